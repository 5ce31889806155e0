//! Build pipeline: materialise a deployment's source tree, run the container
//! engine against it and stream the transcript into the cluster state.

use crate::docker::{ensure_dockerfile, BuildEngine, BuildOutput};
use crate::error::{BuildError, StoreError};
use crate::git;
use crate::metrics::EngineMetrics;
use crate::store::Store;
use async_trait::async_trait;
use orbit_core::{BuildKey, Deployment};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{info, warn};

/// Where flushed build output goes.
#[async_trait]
pub trait BuildLogSink: Send + Sync {
    async fn append_build_log(
        &self,
        deployment_id: &str,
        key: &BuildKey,
        lines: Vec<String>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl BuildLogSink for Store {
    async fn append_build_log(
        &self,
        deployment_id: &str,
        key: &BuildKey,
        lines: Vec<String>,
    ) -> Result<(), StoreError> {
        Store::append_build_log(self, deployment_id, &key.to_string(), lines).await
    }
}

struct LogBuffer<'a, S: ?Sized> {
    sink: &'a S,
    deployment_id: &'a str,
    key: &'a BuildKey,
    lines: Vec<String>,
}

impl<S: BuildLogSink + ?Sized> LogBuffer<'_, S> {
    async fn flush(&mut self) -> Result<(), BuildError> {
        if self.lines.is_empty() {
            return Ok(());
        }
        let lines = std::mem::take(&mut self.lines);
        self.sink
            .append_build_log(self.deployment_id, self.key, lines)
            .await
            .map_err(|source| BuildError::Flush {
                key: self.key.clone(),
                source,
            })
    }

    /// Flush what is buffered and report the engine failure.
    async fn fail(&mut self, reason: String) -> BuildError {
        if let Err(e) = self.flush().await {
            warn!(key = %self.key, "Could not flush build log after failure: {}", e);
        }
        BuildError::Engine {
            key: self.key.clone(),
            reason,
        }
    }
}

/// Drive one build's output into `sink` under `key`.
///
/// Lines are buffered and flushed every `flush_interval`, whenever the
/// engine reports its terminal error, and once more when the output ends.
/// Buffered lines are always consumed before the error or the timer.
pub async fn stream_build<S>(
    sink: &S,
    mut output: BuildOutput,
    deployment_id: &str,
    key: &BuildKey,
    flush_interval: Duration,
) -> Result<(), BuildError>
where
    S: BuildLogSink + ?Sized,
{
    let mut buffer = LogBuffer {
        sink,
        deployment_id,
        key,
        lines: Vec::new(),
    };
    let start = tokio::time::Instant::now() + flush_interval;
    let mut ticker = tokio::time::interval_at(start, flush_interval);
    let mut error_pending = true;

    loop {
        tokio::select! {
            biased;

            line = output.lines.recv() => match line {
                Some(line) => {
                    info!(deployment = deployment_id, key = %key, "{}", line);
                    buffer.lines.push(line);
                }
                None => break,
            },

            result = &mut output.error, if error_pending => {
                error_pending = false;
                // A dropped sender means the engine finished cleanly.
                if let Ok(reason) = result {
                    return Err(buffer.fail(reason).await);
                }
            }

            _ = ticker.tick() => buffer.flush().await?,
        }
    }

    if error_pending {
        match output.error.try_recv() {
            Ok(reason) => return Err(buffer.fail(reason).await),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
        }
    }

    buffer.flush().await
}

pub struct BuildPipeline {
    store: Arc<Store>,
    engine: Arc<dyn BuildEngine>,
    registry: String,
    flush_interval: Duration,
    metrics: Arc<EngineMetrics>,
}

impl BuildPipeline {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<dyn BuildEngine>,
        registry: impl Into<String>,
        flush_interval: Duration,
    ) -> Self {
        let metrics = store.metrics().clone();
        Self {
            store,
            engine,
            registry: registry.into(),
            flush_interval,
            metrics,
        }
    }

    /// Image tag the deployment is built into.
    pub fn tag(&self, deployment: &Deployment) -> String {
        format!("{}/{}", self.registry, deployment.id)
    }

    /// Build `deployment` and return the key its transcript was stored under.
    pub async fn build_deployment(&self, deployment: &Deployment) -> Result<BuildKey, BuildError> {
        let started = Instant::now();
        let result = self.run(deployment).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(key) => {
                info!(deployment = %deployment.id, %key, "Build finished in {:.1}s", elapsed);
                self.metrics.observe_build("success", elapsed);
            }
            Err(e) => {
                warn!(deployment = %deployment.id, stage = e.stage(), "Build failed: {}", e);
                self.metrics.observe_build(e.stage(), elapsed);
            }
        }
        result
    }

    async fn run(&self, deployment: &Deployment) -> Result<BuildKey, BuildError> {
        let repository = self
            .store
            .resolve_repository(&deployment.repository)
            .ok_or_else(|| BuildError::RepositoryNotFound(deployment.repository.clone()))?;
        let bare = self.store.repository_path(&repository);

        // Removed when this build returns.
        let scratch = tempfile::Builder::new()
            .prefix("orbit-build-")
            .tempdir()
            .map_err(|e| BuildError::Materialization(e.to_string()))?;
        let checkout = scratch.path().join("src");

        git::ensure_bare_repository(&bare)
            .await
            .map_err(|e| BuildError::Materialization(e.to_string()))?;
        git::clone(&bare, &checkout)
            .await
            .map_err(|e| BuildError::Materialization(e.to_string()))?;

        if let Some(branch) = &deployment.branch {
            git::checkout(&checkout, branch)
                .await
                .map_err(|e| BuildError::BranchCheckout {
                    branch: branch.clone(),
                    reason: e.to_string(),
                })?;
        }

        let commit = git::rev_parse_head(&checkout)
            .await
            .map_err(|e| BuildError::CommitResolution(e.to_string()))?;

        let key = BuildKey::new(commit, &deployment.path);
        let source = checkout.join(key.path());
        ensure_dockerfile(&source)
            .await
            .map_err(|e| BuildError::BuildDefinition {
                path: source.clone(),
                reason: e.to_string(),
            })?;

        let tag = self.tag(deployment);
        info!(deployment = %deployment.id, %key, %tag, "Starting build");
        let output = self.engine.build(&source, &tag);

        stream_build(
            self.store.as_ref(),
            output,
            &deployment.id,
            &key,
            self.flush_interval,
        )
        .await?;
        Ok(key)
    }
}
