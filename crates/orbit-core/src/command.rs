use crate::error::CodecError;
use crate::state::{Deployment, Namespace, Repository, User};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mutation of the cluster state. Commands are the only way state changes:
/// they are encoded into the consensus log and applied, in log order, by
/// every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Insert a user that passed admission validation.
    UserNew(User),

    /// Delete a user by ID.
    UserRemove { id: String },

    NamespaceNew(Namespace),

    RepositoryNew(Repository),

    RepositoryRemove { id: String },

    DeploymentNew(Deployment),

    DeploymentRemove { id: String },

    /// Append lines to one or more build logs of a deployment.
    DeploymentAppendBuildLog {
        deployment_id: String,
        logs: BTreeMap<String, Vec<String>>,
    },

    /// Reset a single build log to an empty sequence.
    DeploymentClearBuildLog { deployment_id: String, key: String },
}

impl Command {
    /// The operation tag of this command, e.g. `User.New`.
    pub fn op(&self) -> &'static str {
        match self {
            Command::UserNew(_) => "User.New",
            Command::UserRemove { .. } => "User.Remove",
            Command::NamespaceNew(_) => "Namespace.New",
            Command::RepositoryNew(_) => "Repository.New",
            Command::RepositoryRemove { .. } => "Repository.Remove",
            Command::DeploymentNew(_) => "Deployment.New",
            Command::DeploymentRemove { .. } => "Deployment.Remove",
            Command::DeploymentAppendBuildLog { .. } => "Deployment.AppendBuildLog",
            Command::DeploymentClearBuildLog { .. } => "Deployment.ClearBuildLog",
        }
    }

    /// Convenience constructor for appending `lines` under a single key.
    pub fn append_build_log(
        deployment_id: impl Into<String>,
        key: impl Into<String>,
        lines: Vec<String>,
    ) -> Self {
        let mut logs = BTreeMap::new();
        logs.insert(key.into(), lines);
        Command::DeploymentAppendBuildLog {
            deployment_id: deployment_id.into(),
            logs,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
