//! Raft Log Implementation
//!
//! The in-memory log of a node. Entries covered by a snapshot are discarded;
//! the snapshot keeps the term of its last entry and the configuration that
//! was in force at that point.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub type NodeId = String;

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader to commit entries from earlier terms.
    Blank,
    /// An opaque state machine command.
    Command(Vec<u8>),
    /// Adds a voter to the configuration. Takes effect once appended.
    AddVoter { node_id: NodeId, address: String },
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when the entry was received by leader
    pub term: u64,
    /// The index of this entry in the log
    pub index: u64,
    pub payload: EntryPayload,
}

/// Snapshot of the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The last log index included in the snapshot
    pub last_included_index: u64,
    /// The last log term included in the snapshot
    pub last_included_term: u64,
    /// Voters as of `last_included_index`
    pub members: BTreeMap<NodeId, String>,
    /// The snapshot data
    pub data: Vec<u8>,
}

/// The Raft log structure
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Entries after the snapshot, contiguous
    entries: VecDeque<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from a persisted snapshot and the entries that follow it.
    pub fn restore(snapshot: Option<Snapshot>, entries: Vec<LogEntry>) -> Self {
        let mut log = RaftLog {
            entries: VecDeque::new(),
            snapshot,
        };
        let first = log.first_index();
        let entries = entries.into_iter().filter(|e| e.index >= first);
        for entry in entries {
            if entry.index != log.last_index() + 1 {
                break;
            }
            log.entries.push_back(entry);
        }
        log
    }

    /// Index of the first entry held in memory.
    pub fn first_index(&self) -> u64 {
        self.snapshot_index() + 1
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.last_included_index).unwrap_or(0)
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.last_included_term).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Get the last log index
    pub fn last_index(&self) -> u64 {
        self.snapshot_index() + self.entries.len() as u64
    }

    /// Get the term of the last log entry
    pub fn last_term(&self) -> u64 {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot_term())
    }

    /// Term of the entry at `index`. Index 0 and the snapshot boundary are
    /// known; anything compacted away or past the end is not.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        let snapshot_index = self.snapshot_index();
        if index == snapshot_index {
            return Some(self.snapshot_term());
        }
        self.get_entry(index).map(|e| e.term)
    }

    /// Get a log entry by index
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first_index() {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// Append a new entry at the tail and return its index.
    pub fn push(&mut self, term: u64, payload: EntryPayload) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry { term, index, payload });
        index
    }

    /// Append entries whose indexes continue the log.
    pub fn append(&mut self, entries: Vec<LogEntry>) {
        if entries.is_empty() {
            return;
        }
        debug!("Appending {} entries at index {}", entries.len(), self.last_index() + 1);
        for mut entry in entries {
            entry.index = self.last_index() + 1;
            self.entries.push_back(entry);
        }
    }

    /// Truncate the log from the given index (inclusive)
    pub fn truncate_from(&mut self, index: u64) {
        if index < self.first_index() {
            // Cannot truncate into snapshot
            return;
        }
        let relative = (index - self.first_index()) as usize;
        if relative < self.entries.len() {
            self.entries.truncate(relative);
            debug!("Truncated log from index {}", index);
        }
    }

    /// Entries in memory, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        self.entries.iter()
    }

    /// Up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let start = index.saturating_sub(self.first_index()) as usize;
        self.entries.range(start.min(self.entries.len())..).take(max).cloned().collect()
    }

    /// Voters in force after every entry up to and including `index`.
    pub fn members_through(&self, index: u64) -> BTreeMap<NodeId, String> {
        let mut members = self
            .snapshot
            .as_ref()
            .map(|s| s.members.clone())
            .unwrap_or_default();
        for entry in self.entries.iter().take_while(|e| e.index <= index) {
            if let EntryPayload::AddVoter { node_id, address } = &entry.payload {
                members.insert(node_id.clone(), address.clone());
            }
        }
        members
    }

    /// Voters as of the last entry in the log.
    pub fn members(&self) -> BTreeMap<NodeId, String> {
        self.members_through(self.last_index())
    }

    /// Discard every entry up to `index`, replacing them with a snapshot
    /// of the state machine taken at that point.
    pub fn compact(&mut self, index: u64, data: Vec<u8>) -> bool {
        if index <= self.snapshot_index() || index > self.last_index() {
            return false;
        }
        let Some(term) = self.term_at(index) else {
            return false;
        };
        let members = self.members_through(index);
        let remove = (index - self.snapshot_index()) as usize;
        self.entries.drain(..remove);
        self.snapshot = Some(Snapshot {
            last_included_index: index,
            last_included_term: term,
            members,
            data,
        });
        debug!("Created snapshot at index {}", index);
        true
    }

    /// Install a snapshot received from the leader. Entries following the
    /// snapshot are kept only if the log agrees with it at its last index.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) {
        let index = snapshot.last_included_index;
        if self.term_at(index) == Some(snapshot.last_included_term) && index <= self.last_index() {
            let remove = (index - self.snapshot_index()) as usize;
            self.entries.drain(..remove);
        } else {
            self.entries.clear();
        }
        debug!("Installed snapshot at index {}", index);
        self.snapshot = Some(snapshot);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
