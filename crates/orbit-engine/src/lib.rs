//! Orbit engine node: the replicated store, the build pipeline and the
//! control-plane API served by every node of a cluster.

pub mod api;
pub mod build;
pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod git;
pub mod metrics;
pub mod store;

pub use build::{stream_build, BuildLogSink, BuildPipeline};
pub use config::{ConfigError, EngineConfig};
pub use docker::{BuildEngine, BuildOutput, DockerEngine};
pub use engine::{Engine, Status};
pub use error::{BuildError, EngineError, GitError, StoreError};
pub use fsm::ClusterFsm;
pub use metrics::EngineMetrics;
pub use store::{Store, StoreConfig};
