//! Raft State Machine
//!
//! This module defines the state machine interface and provides an
//! in-memory implementation for testing.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trait for a Raft state machine
///
/// The state machine applies committed commands from the Raft log in index
/// order. Applying the same sequence of commands must always produce the
/// same state on every node.
pub trait StateMachine: Send + Sync + 'static {
    /// Outcome of applying one command, handed back to the proposer.
    type Response: Send + 'static;

    /// Apply the command committed at `index`
    fn apply(&self, index: u64, command: &[u8]) -> Self::Response;

    /// Create a snapshot of the current state
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with a snapshot
    fn restore(&self, snapshot: &[u8]) -> Result<(), String>;
}

/// Command types understood by [`MemoryStateMachine`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateMachineCommand {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// In-memory key/value state machine.
#[derive(Default)]
pub struct MemoryStateMachine {
    data: RwLock<HashMap<String, Vec<u8>>>,
    applied: RwLock<Vec<u64>>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Log indexes applied since creation or the last restore.
    pub fn applied_indexes(&self) -> Vec<u64> {
        self.applied.read().clone()
    }
}

impl StateMachine for MemoryStateMachine {
    /// The previous value of the key, or an error for undecodable commands.
    type Response = Result<Option<Vec<u8>>, String>;

    fn apply(&self, index: u64, command: &[u8]) -> Self::Response {
        self.applied.write().push(index);
        let cmd: StateMachineCommand =
            bincode::deserialize(command).map_err(|e| format!("invalid command: {}", e))?;
        let mut data = self.data.write();
        Ok(match cmd {
            StateMachineCommand::Set { key, value } => data.insert(key, value),
            StateMachineCommand::Delete { key } => data.remove(&key),
        })
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(&*self.data.read())
            .map_err(|e| format!("Failed to serialize snapshot: {}", e))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), String> {
        let data: HashMap<String, Vec<u8>> = bincode::deserialize(snapshot)
            .map_err(|e| format!("Failed to deserialize snapshot: {}", e))?;
        *self.data.write() = data;
        self.applied.write().clear();
        Ok(())
    }
}

/// Helper to create a Set command
pub fn create_set_command(key: impl Into<String>, value: Vec<u8>) -> bincode::Result<Vec<u8>> {
    bincode::serialize(&StateMachineCommand::Set { key: key.into(), value })
}

/// Helper to create a Delete command
pub fn create_delete_command(key: impl Into<String>) -> bincode::Result<Vec<u8>> {
    bincode::serialize(&StateMachineCommand::Delete { key: key.into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_state_machine_set_and_delete() {
        let sm = MemoryStateMachine::new();
        assert_eq!(sm.apply(1, &create_set_command("key1", vec![1, 2, 3]).unwrap()), Ok(None));
        assert_eq!(sm.get("key1"), Some(vec![1, 2, 3]));

        let previous = sm.apply(2, &create_delete_command("key1").unwrap());
        assert_eq!(previous, Ok(Some(vec![1, 2, 3])));
        assert!(sm.is_empty());
        assert_eq!(sm.applied_indexes(), vec![1, 2]);
    }

    #[test]
    fn test_memory_state_machine_snapshot() {
        let sm = MemoryStateMachine::new();
        sm.apply(1, &create_set_command("key1", vec![1]).unwrap()).unwrap();
        sm.apply(2, &create_set_command("key2", vec![2]).unwrap()).unwrap();

        let snapshot = sm.snapshot().unwrap();

        let sm2 = MemoryStateMachine::new();
        sm2.restore(&snapshot).unwrap();
        assert_eq!(sm2.get("key1"), Some(vec![1]));
        assert_eq!(sm2.len(), 2);
    }

    #[test]
    fn test_undecodable_command_is_reported() {
        let sm = MemoryStateMachine::new();
        assert!(sm.apply(1, &[0xff, 0xff, 0xff]).is_err());
        assert!(sm.is_empty());
    }
}
