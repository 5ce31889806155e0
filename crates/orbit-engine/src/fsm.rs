//! The cluster state machine: decodes committed commands and applies them to
//! the shared [`ClusterState`].

use crate::metrics::EngineMetrics;
use orbit_core::{ClusterState, Command, StateError};
use orbit_raft::StateMachine;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ClusterFsm {
    state: Arc<RwLock<ClusterState>>,
    metrics: Arc<EngineMetrics>,
}

impl ClusterFsm {
    pub fn new(state: Arc<RwLock<ClusterState>>, metrics: Arc<EngineMetrics>) -> Self {
        Self { state, metrics }
    }

    pub fn state(&self) -> &Arc<RwLock<ClusterState>> {
        &self.state
    }
}

impl StateMachine for ClusterFsm {
    type Response = orbit_core::Result<()>;

    fn apply(&self, index: u64, command: &[u8]) -> Self::Response {
        let command = match Command::from_bytes(command) {
            Ok(command) => command,
            Err(e) => {
                warn!(index, "Skipping undecodable command: {}", e);
                self.metrics.inc_command("unknown", "malformed");
                return Err(StateError::MalformedCommand(e.to_string()));
            }
        };

        // The whole transition runs under the write lock.
        let result = self.state.write().apply(&command);

        match &result {
            Ok(()) => {
                debug!(index, op = command.op(), "Applied command");
                self.metrics.inc_command(command.op(), "applied");
            }
            Err(e) => {
                debug!(index, op = command.op(), "Rejected command: {}", e);
                self.metrics.inc_command(command.op(), "rejected");
            }
        }
        result
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(&*self.state.read()).map_err(|e| e.to_string())
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), String> {
        let restored: ClusterState = bincode::deserialize(snapshot).map_err(|e| e.to_string())?;
        *self.state.write() = restored;
        Ok(())
    }
}
