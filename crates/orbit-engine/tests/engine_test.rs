use orbit_core::{Command, DeploymentConfig, StateError, UserConfig};
use orbit_engine::{Engine, EngineConfig, EngineError, Status, StoreError};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn config(dir: &Path, node_id: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.node.data_dir = dir.to_path_buf();
    config.node.node_id = Some(node_id.to_string());
    config.raft.port = 0;
    config.raft.election_timeout_min_ms = 150;
    config.raft.election_timeout_max_ms = 300;
    config.raft.heartbeat_interval_ms = 50;
    config.raft.rpc_timeout_ms = 1000;
    config
}

fn user(username: &str, email: &str) -> UserConfig {
    UserConfig {
        name: username.to_uppercase(),
        username: username.to_string(),
        email: email.to_string(),
        password: "secret".to_string(),
    }
}

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn running_engine(dir: &Path, node_id: &str) -> Engine {
    let engine = Engine::new(config(dir, node_id)).unwrap();
    engine.setup(LOCALHOST).await.unwrap();
    engine.bootstrap().await.unwrap();
    engine
}

#[tokio::test]
async fn test_lifecycle_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(config(dir.path(), "a")).unwrap();
    assert_eq!(engine.status(), Status::Uninitialized);

    assert!(matches!(engine.bootstrap().await, Err(EngineError::NotReady)));

    engine.setup(LOCALHOST).await.unwrap();
    assert_eq!(engine.status(), Status::Ready);
    assert!(matches!(engine.setup(LOCALHOST).await, Err(EngineError::AlreadySetup)));

    engine.bootstrap().await.unwrap();
    assert_eq!(engine.status(), Status::Running);
    assert!(matches!(
        engine.bootstrap().await,
        Err(EngineError::AlreadyBootstrapped)
    ));
    assert_eq!(engine.store().members().len(), 1);
}

#[tokio::test]
async fn test_signup_username_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let engine = running_engine(dir.path(), "a").await;

    let first = engine.signup(user("a", "a@x.com")).await.unwrap();
    assert!(first.validate_password("secret"));

    let second = engine.signup(user("a", "b@x.com")).await;
    assert!(matches!(
        second,
        Err(EngineError::State(StateError::UsernameTaken(_)))
    ));
    assert_eq!(engine.store().users().len(), 1);

    let missing = engine.signup(user("", "c@x.com")).await;
    assert!(matches!(missing, Err(EngineError::State(StateError::MissingFields))));
}

#[tokio::test]
async fn test_remove_unknown_user() {
    let dir = tempfile::tempdir().unwrap();
    let engine = running_engine(dir.path(), "a").await;

    let err = engine.remove_user("nobody").await.unwrap_err();
    assert!(matches!(err, EngineError::State(StateError::UserNotFound(_))));

    let user = engine.signup(user("b", "b@x.com")).await.unwrap();
    engine.remove_user(&user.id).await.unwrap();
    assert!(engine.store().users().is_empty());
}

#[tokio::test]
async fn test_deployment_resolves_repository_reference() {
    let dir = tempfile::tempdir().unwrap();
    let engine = running_engine(dir.path(), "a").await;

    let namespace = engine.create_namespace("web").await.unwrap();
    let repository = engine.create_repository("site", Some("web")).await.unwrap();
    assert_eq!(repository.namespace_id.as_deref(), Some(namespace.id.as_str()));

    let deployment = engine
        .create_deployment(DeploymentConfig {
            name: "site".into(),
            repository: "web/site".into(),
            branch: None,
            path: String::new(),
            namespace_id: Some("web".into()),
        })
        .await
        .unwrap();
    assert_eq!(deployment.repository, repository.id);
    assert_eq!(deployment.namespace_id, Some(namespace.id));
    assert_eq!(deployment.branch(), "master");
    assert!(engine.store().deployment(&deployment.id).is_some());

    let err = engine
        .create_deployment(DeploymentConfig {
            name: "ghost".into(),
            repository: "nope".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::State(StateError::RepositoryNotFound(_))));

    let err = engine.build_deployment("nope").await.unwrap_err();
    assert!(matches!(err, EngineError::State(StateError::DeploymentNotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joined_follower_replicates_and_rejects_writes() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let leader = running_engine(dir_a.path(), "a").await;
    let follower = Engine::new(config(dir_b.path(), "b")).unwrap();
    let follower_address = follower.setup(LOCALHOST).await.unwrap();
    assert_eq!(follower.status(), Status::Ready);

    // Joining needs a well-formed address.
    assert!(matches!(
        leader.join("b", "localhost").await,
        Err(EngineError::InvalidAddress(_))
    ));

    leader
        .join("b", &follower_address.to_string())
        .await
        .unwrap();
    eventually("follower to become running", || follower.status() == Status::Running).await;
    assert_eq!(follower.store().leader().as_deref(), Some("a"));

    leader.signup(user("a", "a@x.com")).await.unwrap();
    eventually("user to replicate", || follower.store().users().len() == 1).await;

    let before = follower.store().read(|s| s.clone());
    assert_eq!(leader.store().read(|s| s.clone()), before);

    let err = follower.signup(user("c", "c@x.com")).await.unwrap_err();
    match err {
        EngineError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("a")),
        other => panic!("expected NotLeader, got {:?}", other),
    }

    // Writing to the follower's store directly is refused as well.
    let err = follower
        .store()
        .apply(Command::UserRemove { id: "x".into() })
        .await
        .unwrap_err();
    match err {
        StoreError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("a")),
        other => panic!("expected NotLeader, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(follower.store().read(|s| s.clone()), before);
    assert_eq!(leader.store().read(|s| s.clone()), before);

    // Reading the status does not persist the promotion.
    let state_file = dir_b.path().join("engine.json");
    assert!(std::fs::read_to_string(&state_file).unwrap().contains("\"ready\""));
    assert!(follower.promote_if_member().unwrap());
    assert!(!follower.promote_if_member().unwrap());
    assert!(std::fs::read_to_string(&state_file).unwrap().contains("\"running\""));

    // The follower is already a member.
    assert!(leader
        .join("b", &follower_address.to_string())
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_signup_hashing_does_not_block_writes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(running_engine(dir.path(), "a").await);

    let signup = tokio::spawn({
        let engine = engine.clone();
        async move { engine.signup(user("a", "a@x.com")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Committing applies under the state write lock, which must stay free
    // while the password is hashed.
    engine.create_namespace("web").await.unwrap();
    assert!(!signup.is_finished());

    signup.await.unwrap().unwrap();
    assert_eq!(engine.store().users().len(), 1);
}

#[tokio::test]
async fn test_restart_recovers_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = running_engine(dir.path(), "a").await;
        engine.create_namespace("web").await.unwrap();
        engine.shutdown();
    }

    let engine = Engine::new(config(dir.path(), "ignored")).unwrap();
    assert_eq!(engine.node_id(), "a");
    assert_eq!(engine.status(), Status::Running);
    engine.start().await.unwrap();

    eventually("state to be replayed", || {
        engine.store().read(|s| s.find_namespace("web").is_some())
    })
    .await;
    eventually("node to lead again", || engine.store().is_leader()).await;
    engine.create_namespace("api").await.unwrap();
}
