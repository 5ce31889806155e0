use async_trait::async_trait;
use orbit_core::{BuildKey, Command, Deployment, Repository};
use orbit_engine::{
    stream_build, BuildEngine, BuildError, BuildLogSink, BuildOutput, BuildPipeline,
    EngineMetrics, Store, StoreConfig, StoreError,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Command as Process;
use std::sync::Arc;
use std::time::Duration;

enum Step {
    Line(&'static str),
    Sleep(Duration),
}

/// Plays back a fixed script, optionally ending in an error.
struct ScriptedEngine {
    script: Vec<Step>,
    error: Option<&'static str>,
    seen: Mutex<Option<(PathBuf, String, bool)>>,
}

impl ScriptedEngine {
    fn new(script: Vec<Step>, error: Option<&'static str>) -> Self {
        Self {
            script,
            error,
            seen: Mutex::new(None),
        }
    }

    fn lines(lines: &[&'static str], error: Option<&'static str>) -> Self {
        Self::new(lines.iter().map(|l| Step::Line(*l)).collect(), error)
    }
}

impl BuildEngine for ScriptedEngine {
    fn build(&self, source: &Path, tag: &str) -> BuildOutput {
        *self.seen.lock() = Some((
            source.to_path_buf(),
            tag.to_string(),
            source.join("Dockerfile").exists(),
        ));

        let (line_tx, error_tx, output) = BuildOutput::channel();
        let script: Vec<_> = self
            .script
            .iter()
            .map(|s| match s {
                Step::Line(l) => Step::Line(*l),
                Step::Sleep(d) => Step::Sleep(*d),
            })
            .collect();
        let error = self.error;
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Line(line) => {
                        let _ = line_tx.send(line.to_string()).await;
                    }
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                }
            }
            if let Some(reason) = error {
                let _ = error_tx.send(reason.to_string());
            }
        });
        output
    }
}

#[derive(Default)]
struct RecordingSink {
    flushes: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl RecordingSink {
    fn batches(&self) -> Vec<Vec<String>> {
        self.flushes.lock().iter().map(|(_, _, l)| l.clone()).collect()
    }
}

#[async_trait]
impl BuildLogSink for RecordingSink {
    async fn append_build_log(
        &self,
        deployment_id: &str,
        key: &BuildKey,
        lines: Vec<String>,
    ) -> Result<(), StoreError> {
        self.flushes
            .lock()
            .push((deployment_id.to_string(), key.to_string(), lines));
        Ok(())
    }
}

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_failed_build_keeps_lines_emitted_before_failure() {
    let engine = ScriptedEngine::lines(&["step1", "step2"], Some("exit status 1"));
    let sink = RecordingSink::default();
    let key = BuildKey::new("abc123", "");

    let output = engine.build(Path::new("/tmp"), "reg/dep");
    let err = stream_build(&sink, output, "dep", &key, HOUR)
        .await
        .unwrap_err();

    match &err {
        BuildError::Engine { reason, .. } => assert_eq!(reason, "exit status 1"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.key(), Some(&key));

    let flushed: Vec<String> = sink.batches().concat();
    assert_eq!(flushed, vec!["step1", "step2"]);
    assert!(sink
        .flushes
        .lock()
        .iter()
        .all(|(d, k, _)| d == "dep" && *k == key.to_string()));
}

#[tokio::test]
async fn test_successful_build_flushes_once_at_end() {
    let engine = ScriptedEngine::lines(&["a", "b", "c"], None);
    let sink = RecordingSink::default();
    let key = BuildKey::new("abc123", "web");

    let output = engine.build(Path::new("/tmp"), "reg/dep");
    stream_build(&sink, output, "dep", &key, HOUR).await.unwrap();

    assert_eq!(sink.batches(), vec![vec!["a", "b", "c"]]);
}

#[tokio::test]
async fn test_no_output_submits_nothing() {
    let engine = ScriptedEngine::lines(&[], None);
    let sink = RecordingSink::default();
    let key = BuildKey::new("abc123", "");

    let output = engine.build(Path::new("/tmp"), "reg/dep");
    stream_build(&sink, output, "dep", &key, HOUR).await.unwrap();
    assert!(sink.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lines_flushed_on_each_tick() {
    let engine = ScriptedEngine::new(
        vec![
            Step::Line("one"),
            Step::Sleep(Duration::from_secs(3)),
            Step::Line("two"),
            Step::Line("three"),
            Step::Sleep(Duration::from_secs(3)),
        ],
        None,
    );
    let sink = RecordingSink::default();
    let key = BuildKey::new("abc123", "");

    let output = engine.build(Path::new("/tmp"), "reg/dep");
    stream_build(&sink, output, "dep", &key, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(sink.batches(), vec![vec!["one"], vec!["two", "three"]]);
}

async fn single_node_store(dir: &Path) -> Arc<Store> {
    let mut config = StoreConfig::new("builder", dir);
    config.raft_port = 0;
    config.raft.election_timeout_min = Duration::from_millis(150);
    config.raft.election_timeout_max = Duration::from_millis(300);
    config.raft.heartbeat_interval = Duration::from_millis(50);
    config.raft.tick_interval = Duration::from_millis(10);

    let store = Arc::new(Store::new(config, Arc::new(EngineMetrics::new().unwrap())));
    store.open(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
    store.bootstrap().unwrap();
    store
}

async fn add_deployment(
    store: &Store,
    branch: Option<&str>,
    path: &str,
) -> (Repository, Deployment) {
    let repository = Repository {
        id: "r1".into(),
        name: "site".into(),
        namespace_id: None,
    };
    store
        .apply(Command::RepositoryNew(repository.clone()))
        .await
        .unwrap();

    let deployment = Deployment {
        id: "d1".into(),
        name: "site".into(),
        repository: repository.id.clone(),
        branch: branch.map(str::to_string),
        path: path.into(),
        namespace_id: None,
        build_logs: BTreeMap::new(),
    };
    store
        .apply(Command::DeploymentNew(deployment.clone()))
        .await
        .unwrap();
    (repository, deployment)
}

#[tokio::test]
async fn test_failed_build_log_lands_in_cluster_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = single_node_store(dir.path()).await;
    let (_, deployment) = add_deployment(&store, None, "").await;

    let engine = ScriptedEngine::lines(&["step1", "step2"], Some("exit status 1"));
    let key = BuildKey::new("abc123", "");
    let output = engine.build(Path::new("/tmp"), "reg/d1");

    let err = stream_build(store.as_ref(), output, &deployment.id, &key, HOUR)
        .await
        .unwrap_err();
    assert_eq!(err.key(), Some(&key));

    let logs = store.deployment("d1").unwrap().build_logs;
    assert_eq!(logs[&key.to_string()], vec!["step1", "step2"]);
    assert_eq!(store.metrics().build_log_lines.get(), 2);
}

#[tokio::test]
async fn test_unknown_repository_fails_before_building() {
    let dir = tempfile::tempdir().unwrap();
    let store = single_node_store(dir.path()).await;
    let engine = Arc::new(ScriptedEngine::lines(&[], None));
    let pipeline = BuildPipeline::new(store.clone(), engine.clone(), "reg", HOUR);

    let deployment = Deployment {
        id: "d9".into(),
        name: "ghost".into(),
        repository: "missing".into(),
        branch: None,
        path: String::new(),
        namespace_id: None,
        build_logs: BTreeMap::new(),
    };
    let err = pipeline.build_deployment(&deployment).await.unwrap_err();
    assert!(matches!(err, BuildError::RepositoryNotFound(_)));
    assert!(err.key().is_none());
    assert!(engine.seen.lock().is_none());
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Process::new("git")
        .args(["-c", "user.name=Orbit", "-c", "user.email=orbit@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(output.status.success(), "git {:?} failed: {:?}", args, output);
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn git_available() -> bool {
    Process::new("git").arg("--version").output().is_ok()
}

#[tokio::test]
async fn test_pipeline_builds_branch_subdirectory() {
    if !git_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let store = single_node_store(dir.path()).await;
    let (repository, deployment) = add_deployment(&store, Some("feature"), "web").await;

    // Push a commit on `feature` into the node's bare repository.
    let bare = store.repository_path(&repository);
    orbit_engine::git::ensure_bare_repository(&bare).await.unwrap();
    let work = tempfile::tempdir().unwrap();
    git(work.path(), &["init", "--quiet"]);
    std::fs::create_dir(work.path().join("web")).unwrap();
    std::fs::write(work.path().join("web").join("index.html"), "hi").unwrap();
    git(work.path(), &["checkout", "--quiet", "-b", "feature"]);
    git(work.path(), &["add", "."]);
    git(work.path(), &["commit", "--quiet", "-m", "initial"]);
    let commit = git(work.path(), &["rev-parse", "HEAD"]);
    git(
        work.path(),
        &["push", "--quiet", bare.to_str().unwrap(), "feature"],
    );

    let engine = Arc::new(ScriptedEngine::lines(&["built"], None));
    let pipeline = BuildPipeline::new(store.clone(), engine.clone(), "127.0.0.1:6510", HOUR);
    let key = pipeline.build_deployment(&deployment).await.unwrap();

    assert_eq!(key.commit(), commit);
    assert_eq!(key.path(), "web");

    let (source, tag, had_dockerfile) = engine.seen.lock().clone().unwrap();
    assert_eq!(tag, "127.0.0.1:6510/d1");
    assert!(source.ends_with("web"));
    assert!(had_dockerfile);
    // Scratch checkout is gone once the build returns.
    assert!(!source.exists());

    let logs = store.deployment("d1").unwrap().build_logs;
    assert_eq!(logs[&key.to_string()], vec!["built"]);
}

#[tokio::test]
async fn test_pipeline_reports_missing_branch() {
    if !git_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let store = single_node_store(dir.path()).await;
    let (_, deployment) = add_deployment(&store, Some("does-not-exist"), "").await;

    let pipeline = BuildPipeline::new(
        store.clone(),
        Arc::new(ScriptedEngine::lines(&[], None)),
        "reg",
        HOUR,
    );
    // The bare repository is created on demand and is empty.
    let err = pipeline.build_deployment(&deployment).await.unwrap_err();
    assert!(
        matches!(err, BuildError::BranchCheckout { ref branch, .. } if branch == "does-not-exist"),
        "unexpected error {:?}",
        err
    );
}
