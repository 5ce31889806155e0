use crate::log::NodeId;
use thiserror::Error;

/// Errors surfaced by the consensus layer.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader (current leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("cluster has already been bootstrapped")]
    AlreadyBootstrapped,

    #[error("node {0} is already a member of the cluster")]
    AlreadyMember(NodeId),

    #[error("node at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("timed out waiting for the entry to commit")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("a membership change is already in progress")]
    ConfigChangeInProgress,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("raft node has shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RaftError>;
