use crate::command::Command;
use crate::ids::{generate_deployment_id, generate_id};
use crate::{Result, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Branch used for a deployment that does not name one.
pub const DEFAULT_BRANCH: &str = "master";

#[cfg(not(test))]
const PASSWORD_HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const PASSWORD_HASH_COST: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Build a user from admitted signup fields, hashing the password.
    pub fn create(id: String, config: UserConfig) -> Result<User> {
        let password_hash = bcrypt::hash(&config.password, PASSWORD_HASH_COST)
            .map_err(|e| StateError::PasswordHash(e.to_string()))?;

        Ok(User {
            id,
            name: config.name,
            username: config.username,
            email: config.email,
            password_hash,
            created_at: Utc::now(),
        })
    }

    pub fn validate_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

/// Fields supplied when signing up a new user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub namespace_id: Option<String>,
}

/// A deployment built from a repository, also referred to as an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,

    /// ID of the repository the deployment is built from.
    pub repository: String,
    pub branch: Option<String>,
    /// Subdirectory of the repository to build, empty for the root.
    pub path: String,
    pub namespace_id: Option<String>,

    /// Build transcripts keyed by build key. Each value is the ordered list of
    /// lines the build produced.
    pub build_logs: BTreeMap<String, Vec<String>>,
}

impl Deployment {
    /// The branch to build, falling back to [`DEFAULT_BRANCH`].
    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or(DEFAULT_BRANCH)
    }
}

/// Fields supplied when creating a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    pub repository: String,
    pub branch: Option<String>,
    #[serde(default)]
    pub path: String,
    pub namespace_id: Option<String>,
}

/// The replicated aggregate. Only [`ClusterState::apply`] mutates it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub users: BTreeMap<String, User>,
    pub namespaces: BTreeMap<String, Namespace>,
    pub repositories: BTreeMap<String, Repository>,
    pub deployments: BTreeMap<String, Deployment>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a signup and produce the user to embed in a `User.New`
    /// command. Nothing is inserted here.
    pub fn generate_user(&self, config: UserConfig) -> Result<User> {
        let id = self.admit_user(&config)?;
        User::create(id, config)
    }

    /// The cheap half of [`generate_user`](Self::generate_user): checks the
    /// fields and uniqueness and picks a fresh ID, without hashing.
    pub fn admit_user(&self, config: &UserConfig) -> Result<String> {
        if config.name.is_empty()
            || config.username.is_empty()
            || config.email.is_empty()
            || config.password.is_empty()
        {
            return Err(StateError::MissingFields);
        }
        self.check_user_unique(&config.username, &config.email)?;
        Ok(generate_id(|id| self.users.contains_key(id)))
    }

    fn check_user_unique(&self, username: &str, email: &str) -> Result<()> {
        for user in self.users.values() {
            if user.username == username {
                return Err(StateError::UsernameTaken(username.to_string()));
            }
            if user.email == email {
                return Err(StateError::EmailTaken(email.to_string()));
            }
        }
        Ok(())
    }

    /// Find a user by username or email address.
    pub fn find_user(&self, login: &str) -> Option<&User> {
        self.users
            .values()
            .find(|u| u.username == login || u.email == login)
    }

    /// Find a namespace by ID or name.
    pub fn find_namespace(&self, reference: &str) -> Option<&Namespace> {
        self.namespaces
            .get(reference)
            .or_else(|| self.namespaces.values().find(|n| n.name == reference))
    }

    pub fn generate_namespace(&self, name: &str) -> Result<Namespace> {
        if name.is_empty() {
            return Err(StateError::MissingFields);
        }
        if self.namespaces.values().any(|n| n.name == name) {
            return Err(StateError::NamespaceExists(name.to_string()));
        }
        Ok(Namespace {
            id: generate_id(|id| self.namespaces.contains_key(id)),
            name: name.to_string(),
        })
    }

    pub fn generate_repository(
        &self,
        name: &str,
        namespace_id: Option<String>,
    ) -> Result<Repository> {
        if name.is_empty() {
            return Err(StateError::MissingFields);
        }
        let repository = Repository {
            id: generate_id(|id| self.repositories.contains_key(id)),
            name: name.to_string(),
            namespace_id,
        };
        self.check_repository(&repository)?;
        Ok(repository)
    }

    pub fn generate_deployment(&self, config: DeploymentConfig) -> Result<Deployment> {
        if config.name.is_empty() || config.repository.is_empty() {
            return Err(StateError::MissingFields);
        }
        let ids: Vec<&str> = self.deployments.keys().map(String::as_str).collect();
        let deployment = Deployment {
            id: generate_deployment_id(&ids),
            name: config.name,
            repository: config.repository,
            branch: config.branch.filter(|b| !b.is_empty()),
            path: config.path,
            namespace_id: config.namespace_id,
            build_logs: BTreeMap::new(),
        };
        self.check_deployment(&deployment)?;
        Ok(deployment)
    }

    fn check_repository(&self, repository: &Repository) -> Result<()> {
        if self.repositories.contains_key(&repository.id) {
            return Err(StateError::RepositoryExists(repository.id.clone()));
        }
        if let Some(ns) = &repository.namespace_id {
            if !self.namespaces.contains_key(ns) {
                return Err(StateError::NamespaceNotFound(ns.clone()));
            }
        }
        let duplicate = self
            .repositories
            .values()
            .any(|r| r.name == repository.name && r.namespace_id == repository.namespace_id);
        if duplicate {
            return Err(StateError::RepositoryExists(repository.name.clone()));
        }
        Ok(())
    }

    fn check_deployment(&self, deployment: &Deployment) -> Result<()> {
        if self.deployments.contains_key(&deployment.id) {
            return Err(StateError::DeploymentExists(deployment.id.clone()));
        }
        if !self.repositories.contains_key(&deployment.repository) {
            return Err(StateError::RepositoryNotFound(deployment.repository.clone()));
        }
        if let Some(ns) = &deployment.namespace_id {
            if !self.namespaces.contains_key(ns) {
                return Err(StateError::NamespaceNotFound(ns.clone()));
            }
        }
        Ok(())
    }

    /// Resolve a repository reference as the git gateway receives it: a bare
    /// ID, a bare name, or `namespace/name`, optionally prefixed by `repo/`.
    pub fn resolve_repository(&self, reference: &str) -> Option<&Repository> {
        let reference = reference.trim_matches('/');
        let reference = reference.strip_prefix("repo/").unwrap_or(reference);
        let reference = reference.strip_suffix(".git").unwrap_or(reference);
        let tokens: Vec<&str> = reference.split('/').collect();

        match tokens.as_slice() {
            [identifier] => self.repositories.get(*identifier).or_else(|| {
                self.repositories.values().find(|r| r.name == *identifier)
            }),
            [namespace, identifier] => {
                if let Some(repo) = self.repositories.get(*identifier) {
                    return Some(repo);
                }
                let namespace = self.find_namespace(namespace)?;
                self.repositories.values().find(|r| {
                    r.namespace_id.as_deref() == Some(namespace.id.as_str())
                        && r.name == *identifier
                })
            }
            _ => None,
        }
    }

    /// Apply a committed command. A rejected command leaves the state
    /// untouched; the caller decides how to report it.
    pub fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::UserNew(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(StateError::UserExists(user.id.clone()));
                }
                self.check_user_unique(&user.username, &user.email)?;
                self.users.insert(user.id.clone(), user.clone());
            }

            Command::UserRemove { id } => {
                self.users.remove(id);
            }

            Command::NamespaceNew(namespace) => {
                if self.namespaces.contains_key(&namespace.id)
                    || self.namespaces.values().any(|n| n.name == namespace.name)
                {
                    return Err(StateError::NamespaceExists(namespace.name.clone()));
                }
                self.namespaces.insert(namespace.id.clone(), namespace.clone());
            }

            Command::RepositoryNew(repository) => {
                self.check_repository(repository)?;
                self.repositories
                    .insert(repository.id.clone(), repository.clone());
            }

            Command::RepositoryRemove { id } => {
                self.repositories.remove(id);
            }

            Command::DeploymentNew(deployment) => {
                self.check_deployment(deployment)?;
                let mut deployment = deployment.clone();
                deployment.build_logs.clear();
                self.deployments.insert(deployment.id.clone(), deployment);
            }

            Command::DeploymentRemove { id } => {
                self.deployments.remove(id);
            }

            Command::DeploymentAppendBuildLog { deployment_id, logs } => {
                let deployment = self
                    .deployments
                    .get_mut(deployment_id)
                    .ok_or_else(|| StateError::DeploymentNotFound(deployment_id.clone()))?;
                for (key, lines) in logs {
                    deployment
                        .build_logs
                        .entry(key.clone())
                        .or_default()
                        .extend(lines.iter().cloned());
                }
            }

            Command::DeploymentClearBuildLog { deployment_id, key } => {
                let deployment = self
                    .deployments
                    .get_mut(deployment_id)
                    .ok_or_else(|| StateError::DeploymentNotFound(deployment_id.clone()))?;
                deployment.build_logs.insert(key.clone(), Vec::new());
            }
        }
        Ok(())
    }
}
