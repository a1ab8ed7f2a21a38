//! Append-only record of path-level mutations.
//!
//! Every committed mutation appends one delta. Observers poll with
//! [deltas_since](Journal::deltas_since) using the sequence numbers assigned
//! at append time; sequence numbers are dense and strictly increasing within
//! a mount.
use std::sync::Mutex;
use std::time::SystemTime;

use driftfs_castore::RepoPathBuf;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalDelta {
    Created(RepoPathBuf),
    Removed(RepoPathBuf),
    Renamed {
        from: RepoPathBuf,
        to: RepoPathBuf,
    },
    /// Attribute or content change at a path.
    Changed(RepoPathBuf),
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub sequence: u64,
    pub time: SystemTime,
    pub delta: JournalDelta,
}

#[derive(Default)]
pub struct Journal {
    state: Mutex<JournalState>,
}

#[derive(Default)]
struct JournalState {
    entries: Vec<JournalEntry>,
    next_sequence: u64,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_delta(&self, delta: JournalDelta) {
        let mut state = self.state.lock().expect("journal lock poisoned");
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        debug!(journal.sequence = sequence, journal.delta = ?delta, "delta");
        state.entries.push(JournalEntry {
            sequence,
            time: SystemTime::now(),
            delta,
        });
    }

    /// The sequence number of the most recent delta, if any were recorded.
    pub fn latest_sequence(&self) -> Option<u64> {
        let state = self.state.lock().expect("journal lock poisoned");
        state.entries.last().map(|e| e.sequence)
    }

    /// Returns all deltas with a sequence number of at least `sequence`.
    pub fn deltas_since(&self, sequence: u64) -> Vec<JournalEntry> {
        let state = self.state.lock().expect("journal lock poisoned");
        state
            .entries
            .iter()
            .filter(|e| e.sequence >= sequence)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Journal, JournalDelta};

    #[test]
    fn sequences_are_dense() {
        let journal = Journal::new();
        assert_eq!(None, journal.latest_sequence());

        journal.add_delta(JournalDelta::Created("a".parse().unwrap()));
        journal.add_delta(JournalDelta::Removed("a".parse().unwrap()));
        journal.add_delta(JournalDelta::Renamed {
            from: "b".parse().unwrap(),
            to: "c".parse().unwrap(),
        });

        assert_eq!(Some(2), journal.latest_sequence());
        assert_eq!(3, journal.deltas_since(0).len());
        assert_eq!(1, journal.deltas_since(2).len());
    }
}
