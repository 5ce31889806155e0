//! Node lifecycle and the control-plane operations exposed by the API.

use crate::build::BuildPipeline;
use crate::config::EngineConfig;
use crate::docker::{BuildEngine, DockerEngine};
use crate::error::{EngineError, Result};
use crate::metrics::EngineMetrics;
use crate::store::{Store, StoreConfig};
use orbit_core::{
    generate_id, BuildKey, Command, Deployment, DeploymentConfig, Namespace, Repository,
    StateError, User, UserConfig,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const STATE_FILE: &str = "engine.json";

/// Lifecycle of a node. Ordered: each stage implies the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Uninitialized,
    Ready,
    Running,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Uninitialized => "uninitialized",
            Status::Ready => "ready",
            Status::Running => "running",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EngineState {
    node_id: String,
    status: Status,
    advertise: Option<IpAddr>,
}

impl EngineState {
    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| EngineError::StateFile(e.to_string()))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let contents =
            serde_json::to_vec_pretty(self).map_err(|e| EngineError::StateFile(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<Store>,
    pipeline: Arc<BuildPipeline>,
    metrics: Arc<EngineMetrics>,
    state: RwLock<EngineState>,
    state_path: PathBuf,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = DockerEngine::new(config.build.docker_binary.clone(), config.build.push);
        Self::with_build_engine(config, Arc::new(engine))
    }

    pub fn with_build_engine(
        config: EngineConfig,
        build_engine: Arc<dyn BuildEngine>,
    ) -> Result<Self> {
        let data_dir = config.node.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;
        let state_path = data_dir.join(STATE_FILE);

        let state = match EngineState::load(&state_path)? {
            Some(state) => {
                if let Some(configured) = &config.node.node_id {
                    if configured != &state.node_id {
                        warn!(
                            "Configured node ID {} ignored, this data directory belongs to {}",
                            configured, state.node_id
                        );
                    }
                }
                state
            }
            None => EngineState {
                node_id: config
                    .node
                    .node_id
                    .clone()
                    .unwrap_or_else(|| generate_id(|_| false)),
                status: Status::Uninitialized,
                advertise: None,
            },
        };

        let metrics = Arc::new(EngineMetrics::new()?);
        let store_config = StoreConfig {
            node_id: state.node_id.clone(),
            data_dir: data_dir.clone(),
            raft_port: config.raft.port,
            raft: config.consensus_config(&state.node_id),
            rpc_timeout: config.rpc_timeout(),
        };
        let store = Arc::new(Store::new(store_config, metrics.clone()));
        let pipeline = Arc::new(BuildPipeline::new(
            store.clone(),
            build_engine,
            config.build.registry.clone(),
            config.flush_interval(),
        ));

        Ok(Self {
            config,
            store,
            pipeline,
            metrics,
            state: RwLock::new(state),
            state_path,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node_id(&self) -> String {
        self.state.read().node_id.clone()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Reopen the store of a node that was set up before a restart.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let (status, advertise) = {
            let state = self.state.read();
            (state.status, state.advertise)
        };
        match (status, advertise) {
            (Status::Uninitialized, _) => {
                info!("Engine is not set up yet, waiting for setup");
                Ok(())
            }
            (_, Some(ip)) => {
                self.store.open(ip).await?;
                self.store.started().await;
                info!(node_id = %self.node_id(), %status, "Engine restarted");
                Ok(())
            }
            (_, None) => Err(EngineError::StateFile(
                "engine state has no advertise address".into(),
            )),
        }
    }

    /// Current status. A ready node that a leader has since added to the
    /// cluster reads as running; see [`Engine::promote_if_member`].
    pub fn status(&self) -> Status {
        let status = self.state.read().status;
        if status == Status::Ready && self.store.is_member() {
            return Status::Running;
        }
        status
    }

    /// Persist the running status of a ready node that has been joined.
    /// Returns whether the node was promoted.
    pub fn promote_if_member(&self) -> Result<bool> {
        let mut state = self.state.write();
        if state.status != Status::Ready || !self.store.is_member() {
            return Ok(false);
        }
        state.status = Status::Running;
        state.save(&self.state_path)?;
        info!(node_id = %state.node_id, "Node joined, now running");
        Ok(true)
    }

    fn set_status(&self, status: Status) -> Result<()> {
        let mut state = self.state.write();
        state.status = status;
        state.save(&self.state_path)
    }

    /// Open the store on `advertise` and mark the node ready.
    pub async fn setup(&self, advertise: IpAddr) -> Result<SocketAddr> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.read().status >= Status::Ready {
            return Err(EngineError::AlreadySetup);
        }

        let address = self.store.open(advertise).await?;
        self.store.started().await;

        let mut state = self.state.write();
        state.status = Status::Ready;
        state.advertise = Some(advertise);
        state.save(&self.state_path)?;
        info!(node_id = %state.node_id, %address, "Engine set up");
        Ok(address)
    }

    /// Form a new cluster with this node as its only member.
    pub async fn bootstrap(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.promote_if_member()? {
            return Err(EngineError::AlreadyBootstrapped);
        }
        match self.status() {
            Status::Uninitialized => return Err(EngineError::NotReady),
            Status::Running => return Err(EngineError::AlreadyBootstrapped),
            Status::Ready => {}
        }
        self.store.bootstrap()?;
        self.set_status(Status::Running)?;
        info!(node_id = %self.node_id(), "Cluster bootstrapped");
        Ok(())
    }

    /// Add the node `node_id`, reachable for consensus at `address`.
    pub async fn join(&self, node_id: &str, address: &str) -> Result<()> {
        self.ensure_leader()?;
        if node_id.is_empty() {
            return Err(StateError::MissingFields.into());
        }
        address
            .parse::<SocketAddr>()
            .map_err(|_| EngineError::InvalidAddress(address.to_string()))?;
        self.store.join(node_id, address).await?;
        Ok(())
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.state.read().status == Status::Uninitialized {
            return Err(EngineError::NotReady);
        }
        if !self.store.is_leader() {
            return Err(EngineError::NotLeader {
                leader: self.store.leader(),
            });
        }
        Ok(())
    }

    pub async fn signup(&self, config: UserConfig) -> Result<User> {
        self.ensure_leader()?;
        let id = self.store.read(|s| s.admit_user(&config))?;
        // bcrypt hashing blocks, and runs outside the state lock
        let user = tokio::task::spawn_blocking(move || User::create(id, config)).await??;

        self.store.apply(Command::UserNew(user.clone())).await?;
        info!(user = %user.username, id = %user.id, "User signed up");
        Ok(user)
    }

    pub async fn remove_user(&self, id: &str) -> Result<()> {
        self.ensure_leader()?;
        if self.store.read(|s| !s.users.contains_key(id)) {
            return Err(StateError::UserNotFound(id.to_string()).into());
        }
        self.store
            .apply(Command::UserRemove { id: id.to_string() })
            .await?;
        info!(id, "User removed");
        Ok(())
    }

    pub async fn create_namespace(&self, name: &str) -> Result<Namespace> {
        self.ensure_leader()?;
        let namespace = self.store.read(|s| s.generate_namespace(name))?;
        self.store
            .apply(Command::NamespaceNew(namespace.clone()))
            .await?;
        Ok(namespace)
    }

    /// Create a repository, optionally inside the namespace named or
    /// identified by `namespace`.
    pub async fn create_repository(
        &self,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Repository> {
        self.ensure_leader()?;
        let repository = self.store.read(|s| {
            let namespace_id = match namespace {
                Some(reference) => Some(
                    s.find_namespace(reference)
                        .map(|n| n.id.clone())
                        .ok_or_else(|| StateError::NamespaceNotFound(reference.to_string()))?,
                ),
                None => None,
            };
            s.generate_repository(name, namespace_id)
        })?;
        self.store
            .apply(Command::RepositoryNew(repository.clone()))
            .await?;
        Ok(repository)
    }

    /// Create a deployment. `config.repository` may be any reference the git
    /// gateway accepts and `config.namespace_id` a namespace name or ID.
    pub async fn create_deployment(&self, mut config: DeploymentConfig) -> Result<Deployment> {
        self.ensure_leader()?;
        let deployment = self.store.read(|s| {
            if let Some(repository) = s.resolve_repository(&config.repository) {
                config.repository = repository.id.clone();
            }
            if let Some(reference) = config.namespace_id.take() {
                let namespace = s
                    .find_namespace(&reference)
                    .ok_or_else(|| StateError::NamespaceNotFound(reference.clone()))?;
                config.namespace_id = Some(namespace.id.clone());
            }
            s.generate_deployment(config)
        })?;
        self.store
            .apply(Command::DeploymentNew(deployment.clone()))
            .await?;
        info!(id = %deployment.id, name = %deployment.name, "Deployment created");
        Ok(deployment)
    }

    fn deployment_for_build(&self, id: &str) -> Result<Deployment> {
        self.ensure_leader()?;
        self.store
            .deployment(id)
            .ok_or_else(|| StateError::DeploymentNotFound(id.to_string()).into())
    }

    /// Build the deployment and wait for the build to finish.
    pub async fn build_deployment(&self, id: &str) -> Result<BuildKey> {
        let deployment = self.deployment_for_build(id)?;
        Ok(self.pipeline.build_deployment(&deployment).await?)
    }

    /// Start building the deployment in the background.
    pub fn spawn_build(&self, id: &str) -> Result<JoinHandle<Result<BuildKey>>> {
        let deployment = self.deployment_for_build(id)?;
        let pipeline = self.pipeline.clone();
        Ok(tokio::spawn(async move {
            Ok(pipeline.build_deployment(&deployment).await?)
        }))
    }

    pub fn refresh_metrics(&self) {
        if let Err(e) = self.promote_if_member() {
            warn!("Could not persist engine status: {}", e);
        }
        self.metrics
            .set_raft(self.store.term(), self.store.is_leader());
    }

    pub fn shutdown(&self) {
        self.store.close();
        info!(node_id = %self.node_id(), "Engine stopped");
    }
}
