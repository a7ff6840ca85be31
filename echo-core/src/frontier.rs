//! Per-actor causal frontiers.
//!
//! A frontier maps every known actor to the highest change sequence
//! incorporated from it. Because each actor's changes form a hash chain,
//! `(actor, seq)` being included implies every earlier change of that actor
//! is too, so the frontier summarizes a causally closed set of changes.

use crate::ids::ActorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frontier(BTreeMap<ActorId, u64>);

/// Inclusive run of one actor's change sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqRange {
    pub actor: ActorId,
    pub start: u64,
    pub end: u64,
}

impl SeqRange {
    pub fn len(&self) -> u64 {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, seq: u64) -> bool {
        (self.start..=self.end).contains(&seq)
    }
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence seen from `actor`, zero if none.
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    /// Raises `actor` to `seq`. Never lowers it.
    pub fn advance(&mut self, actor: ActorId, seq: u64) {
        if seq == 0 {
            return;
        }
        let entry = self.0.entry(actor).or_insert(0);
        *entry = (*entry).max(seq);
    }

    pub fn includes(&self, actor: &ActorId, seq: u64) -> bool {
        self.get(actor) >= seq
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &Frontier) {
        for (actor, seq) in &other.0 {
            self.advance(*actor, *seq);
        }
    }

    /// `self` includes everything `other` does.
    pub fn dominates(&self, other: &Frontier) -> bool {
        other.0.iter().all(|(actor, seq)| self.get(actor) >= *seq)
    }

    /// Ranges present in `self` that `other` is missing.
    pub fn missing_from(&self, other: &Frontier) -> Vec<SeqRange> {
        self.0
            .iter()
            .filter_map(|(actor, seq)| {
                let theirs = other.get(actor);
                (*seq > theirs).then_some(SeqRange {
                    actor: *actor,
                    start: theirs + 1,
                    end: *seq,
                })
            })
            .collect()
    }

    /// Number of changes present in `self` that `other` is missing.
    pub fn total_missing(&self, other: &Frontier) -> u64 {
        self.missing_from(other).iter().map(SeqRange::len).sum()
    }

    /// Sum of all sequence numbers: the number of changes summarized.
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ActorId, u64)> for Frontier {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        let mut frontier = Frontier::new();
        for (actor, seq) in iter {
            frontier.advance(actor, seq);
        }
        frontier
    }
}

impl fmt::Display for Frontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (actor, seq)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{actor}:{seq}")?;
        }
        f.write_str("}")
    }
}
