//! Core data model for Orbit: the replicated cluster state, the commands that
//! mutate it, and the identifiers that name its entities.

mod command;
mod error;
mod ids;
mod state;

pub use command::Command;
pub use error::{CodecError, Result, StateError};
pub use ids::{generate_deployment_id, generate_id, BuildKey, ID_BYTES};
pub use state::{
    ClusterState, Deployment, DeploymentConfig, Namespace, Repository, User, UserConfig,
    DEFAULT_BRANCH,
};
