//! The replicated store: one consensus participant per node applying
//! [`Command`]s to the shared [`ClusterState`].

use crate::error::{GitError, StoreError};
use crate::fsm::ClusterFsm;
use crate::git;
use crate::metrics::EngineMetrics;
use orbit_core::{ClusterState, Command, Deployment, Repository, User};
use orbit_raft::{
    Raft, RaftConfig, RaftError, RaftRpcHandler, RaftRpcServer, RaftStatus, RaftStorage,
    TcpTransport,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    /// Port for consensus RPCs; 0 picks a free one
    pub raft_port: u16,
    pub raft: RaftConfig,
    pub rpc_timeout: Duration,
}

impl StoreConfig {
    pub fn new(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.into(),
            raft_port: 6501,
            raft: RaftConfig::default(),
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

type ClusterRaft = Raft<ClusterFsm>;

pub struct Store {
    config: StoreConfig,
    state: Arc<RwLock<ClusterState>>,
    metrics: Arc<EngineMetrics>,
    raft: RwLock<Option<Arc<ClusterRaft>>>,
    address: RwLock<Option<SocketAddr>>,
    server: Mutex<Option<JoinHandle<()>>>,
    opening: tokio::sync::Mutex<()>,
    started: watch::Sender<bool>,
}

impl Store {
    pub fn new(config: StoreConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(ClusterState::new())),
            metrics,
            raft: RwLock::new(None),
            address: RwLock::new(None),
            server: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
            started: watch::channel(false).0,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }

    /// Bind the consensus listener on `advertise`, recover persisted state
    /// and start the participant.
    pub async fn open(&self, advertise: IpAddr) -> Result<SocketAddr, StoreError> {
        let _opening = self.opening.lock().await;
        if self.raft.read().is_some() {
            return Err(StoreError::AlreadyOpen);
        }

        let bind = SocketAddr::new(advertise, self.config.raft_port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| StoreError::Open(format!("could not listen on {}: {}", bind, e)))?;
        let address = listener.local_addr()?;

        let storage = RaftStorage::open(self.config.data_dir.join("raft"))
            .map_err(|e| StoreError::Open(format!("could not open raft storage: {}", e)))?;
        // Recovery replays the persisted log from the start.
        *self.state.write() = ClusterState::new();
        let fsm = ClusterFsm::new(self.state.clone(), self.metrics.clone());
        let transport = Arc::new(TcpTransport::new(self.config.rpc_timeout));

        let mut raft_config = self.config.raft.clone();
        raft_config.node_id = self.config.node_id.clone();
        let raft = Raft::new(raft_config, Arc::new(fsm), transport, Some(storage))
            .map_err(|e| StoreError::Open(e.to_string()))?;

        let handler: Arc<dyn RaftRpcHandler> = raft.clone();
        let server = RaftRpcServer::new(listener, handler);
        *self.server.lock() = Some(tokio::spawn(server.serve()));

        raft.start();
        *self.raft.write() = Some(raft);
        *self.address.write() = Some(address);
        self.started.send_replace(true);

        info!(node_id = %self.config.node_id, %address, "Store opened");
        Ok(address)
    }

    /// Resolves once the store has been opened.
    pub async fn started(&self) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    pub fn is_open(&self) -> bool {
        self.raft.read().is_some()
    }

    /// The consensus address this node is reachable at.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.read()
    }

    fn raft(&self) -> Result<Arc<ClusterRaft>, StoreError> {
        self.raft.read().clone().ok_or(StoreError::NotOpen)
    }

    /// Form a new single-voter cluster around this node.
    pub fn bootstrap(&self) -> Result<(), StoreError> {
        let raft = self.raft()?;
        let address = self.address().ok_or(StoreError::NotOpen)?;
        raft.bootstrap(address.to_string())?;
        Ok(())
    }

    /// Add the node at `address` as a voter. Leader only.
    pub async fn join(&self, node_id: &str, address: &str) -> Result<(), StoreError> {
        let raft = self.raft()?;
        info!(%node_id, %address, "Joining node to the cluster");

        raft.add_voter(node_id.to_string(), address.to_string())
            .await
            .map_err(|e| match e {
                RaftError::AlreadyMember(_)
                | RaftError::Unreachable { .. }
                | RaftError::ConfigChangeInProgress => StoreError::Join {
                    node_id: node_id.to_string(),
                    address: address.to_string(),
                    reason: e.to_string(),
                },
                other => other.into(),
            })
    }

    /// Submit a command and wait until it has been committed and applied on
    /// this node.
    pub async fn apply(&self, command: Command) -> Result<(), StoreError> {
        let raft = self.raft()?;
        let op = command.op();
        let bytes = command.to_bytes()?;
        raft.submit(bytes).await??;
        debug!(op, "Command applied");
        Ok(())
    }

    pub fn read<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&ClusterState) -> T,
    {
        f(&self.state.read())
    }

    pub fn state(&self) -> &Arc<RwLock<ClusterState>> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn users(&self) -> Vec<User> {
        self.read(|state| state.users.values().cloned().collect())
    }

    pub fn deployment(&self, id: &str) -> Option<Deployment> {
        self.read(|state| state.deployments.get(id).cloned())
    }

    pub fn deployments(&self) -> Vec<Deployment> {
        self.read(|state| state.deployments.values().cloned().collect())
    }

    pub fn is_leader(&self) -> bool {
        self.raft.read().as_ref().map_or(false, |raft| raft.is_leader())
    }

    pub fn leader(&self) -> Option<String> {
        self.raft.read().as_ref().and_then(|raft| raft.leader_id())
    }

    /// Voters and their consensus addresses
    pub fn members(&self) -> BTreeMap<String, String> {
        self.raft
            .read()
            .as_ref()
            .map(|raft| raft.members())
            .unwrap_or_default()
    }

    /// True when this node is part of the voter set it knows.
    pub fn is_member(&self) -> bool {
        self.members().contains_key(&self.config.node_id)
    }

    pub fn term(&self) -> u64 {
        self.raft.read().as_ref().map_or(0, |raft| raft.current_term())
    }

    pub fn status(&self) -> Option<RaftStatus> {
        self.raft.read().as_ref().map(|raft| raft.status())
    }

    /// Compact the consensus log. Returns the index the snapshot covers.
    pub fn snapshot(&self) -> Result<u64, StoreError> {
        Ok(self.raft()?.snapshot()?)
    }

    /// Append build output under `key`. Submits nothing when `lines` is empty.
    pub async fn append_build_log(
        &self,
        deployment_id: &str,
        key: &str,
        lines: Vec<String>,
    ) -> Result<(), StoreError> {
        if lines.is_empty() {
            return Ok(());
        }
        let count = lines.len() as u64;
        self.apply(Command::append_build_log(deployment_id, key, lines))
            .await?;
        self.metrics.build_log_lines.inc_by(count);
        Ok(())
    }

    pub async fn clear_build_log(&self, deployment_id: &str, key: &str) -> Result<(), StoreError> {
        self.apply(Command::DeploymentClearBuildLog {
            deployment_id: deployment_id.to_string(),
            key: key.to_string(),
        })
        .await
    }

    pub fn resolve_repository(&self, reference: &str) -> Option<Repository> {
        self.read(|state| state.resolve_repository(reference).cloned())
    }

    /// Where the bare repository for `repository` lives on this node.
    pub fn repository_path(&self, repository: &Repository) -> PathBuf {
        self.config
            .data_dir
            .join("repositories")
            .join(&repository.id)
    }

    /// Resolve `reference` for the git gateway, creating the bare
    /// repository on first access.
    pub async fn open_repository(&self, reference: &str) -> Result<Option<PathBuf>, GitError> {
        let Some(repository) = self.resolve_repository(reference) else {
            return Ok(None);
        };
        let path = self.repository_path(&repository);
        git::ensure_bare_repository(&path).await?;
        Ok(Some(path))
    }

    /// Stop the participant and its RPC listener. The store can be opened
    /// again afterwards.
    pub fn close(&self) {
        if let Some(raft) = self.raft.write().take() {
            raft.shutdown();
        }
        if let Some(server) = self.server.lock().take() {
            server.abort();
        }
        *self.address.write() = None;
        self.started.send_replace(false);
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}
