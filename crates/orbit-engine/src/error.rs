use orbit_core::{BuildKey, CodecError, StateError};
use orbit_raft::RaftError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the replicated store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is already open")]
    AlreadyOpen,

    #[error("store is not open")]
    NotOpen,

    #[error("could not open store: {0}")]
    Open(String),

    #[error("store has already been bootstrapped")]
    AlreadyBootstrapped,

    #[error("this node is not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("could not join node {node_id} at {address}: {reason}")]
    Join {
        node_id: String,
        address: String,
        reason: String,
    },

    #[error("timed out waiting for the command to be applied")]
    Timeout,

    #[error("command rejected: {0}")]
    Rejected(#[from] StateError),

    #[error("could not encode command: {0}")]
    Codec(#[from] CodecError),

    #[error("consensus error: {0}")]
    Raft(RaftError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RaftError> for StoreError {
    fn from(e: RaftError) -> Self {
        match e {
            RaftError::NotLeader { leader_id } => StoreError::NotLeader { leader: leader_id },
            RaftError::AlreadyBootstrapped => StoreError::AlreadyBootstrapped,
            RaftError::Timeout => StoreError::Timeout,
            other => StoreError::Raft(other),
        }
    }
}

/// Errors from invoking git
#[derive(Error, Debug)]
pub enum GitError {
    #[error("could not run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {command} failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Errors from the build pipeline, one per stage. Failures after the build
/// key was derived carry it, so the partial transcript can still be found.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("repository does not exist: {0}")]
    RepositoryNotFound(String),

    #[error("could not materialize repository: {0}")]
    Materialization(String),

    #[error("could not check out branch {branch}: {reason}")]
    BranchCheckout { branch: String, reason: String },

    #[error("could not resolve the commit to build: {0}")]
    CommitResolution(String),

    #[error("could not prepare build definition in {path:?}: {reason}")]
    BuildDefinition { path: PathBuf, reason: String },

    #[error("build {key} failed: {reason}")]
    Engine { key: BuildKey, reason: String },

    #[error("could not flush build log {key}: {source}")]
    Flush {
        key: BuildKey,
        #[source]
        source: StoreError,
    },
}

impl BuildError {
    /// The build key, for failures that happened after it was derived.
    pub fn key(&self) -> Option<&BuildKey> {
        match self {
            BuildError::Engine { key, .. } | BuildError::Flush { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            BuildError::RepositoryNotFound(_) => "repository",
            BuildError::Materialization(_) => "materialization",
            BuildError::BranchCheckout { .. } => "checkout",
            BuildError::CommitResolution(_) => "commit",
            BuildError::BuildDefinition { .. } => "definition",
            BuildError::Engine { .. } => "engine",
            BuildError::Flush { .. } => "flush",
        }
    }
}

/// Errors from engine lifecycle and control-plane operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("the engine has already been set up")]
    AlreadySetup,

    #[error("the engine is not set up yet")]
    NotReady,

    #[error("the cluster has already been bootstrapped")]
    AlreadyBootstrapped,

    #[error("this node is not the leader of the cluster, and leader forwarding is not implemented")]
    NotLeader { leader: Option<String> },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("could not persist engine state: {0}")]
    StateFile(String),

    #[error("could not register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotLeader { leader } => EngineError::NotLeader { leader },
            StoreError::AlreadyBootstrapped => EngineError::AlreadyBootstrapped,
            StoreError::Rejected(state) => EngineError::State(state),
            other => EngineError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
