//! Raft consensus for the Orbit cluster.
//!
//! A small Raft implementation with leader election, log replication,
//! single-server membership changes, snapshots and file-backed storage.

pub mod codec;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod raft;
pub mod state_machine;
pub mod storage;

pub use error::{RaftError, Result};
pub use log::{EntryPayload, LogEntry, NodeId, RaftLog, Snapshot};
pub use node::{
    MemoryRouter, MemoryTransport, RaftRpcHandler, RaftRpcServer, RaftTransport, TcpTransport,
};
pub use raft::{NodeState, Raft, RaftConfig, RaftStatus};
pub use state_machine::{
    create_delete_command, create_set_command, MemoryStateMachine, StateMachine,
};
pub use storage::RaftStorage;
