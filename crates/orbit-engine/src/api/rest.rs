use crate::engine::{Engine, Status};
use crate::error::{BuildError, EngineError, StoreError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use orbit_core::{
    ClusterState, Deployment, DeploymentConfig, Namespace, Repository, StateError, User,
    UserConfig,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

const INDEX: &str = "Welcome to the Orbit Engine API.\nAll systems are operational.";

/// REST API routes
pub fn create_rest_api(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/state", get(get_state))
        .route("/users", get(list_users))
        .route("/nodes", get(list_nodes))
        .route("/deployments", get(list_deployments).post(create_deployment))
        .route("/deployments/:id", get(get_deployment))
        .route("/deployments/:id/build", post(build_deployment))
        .route("/setup", post(setup))
        .route("/cluster/bootstrap", post(bootstrap))
        .route("/cluster/join", post(join))
        .route("/snapshot", post(snapshot))
        .route("/user", post(signup))
        .route("/user/:id", delete(remove_user))
        .route("/namespaces", post(create_namespace))
        .route("/repositories", post(create_repository))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(engine)
}

async fn index() -> &'static str {
    INDEX
}

#[derive(Debug, Serialize)]
struct UserResponse {
    id: String,
    name: String,
    username: String,
    email: String,
    created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        UserResponse {
            id: user.id.clone(),
            name: user.name.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
        }
    }
}

/// Cluster state with password hashes left out
#[derive(Debug, Serialize)]
struct StateResponse {
    users: Vec<UserResponse>,
    namespaces: Vec<Namespace>,
    repositories: Vec<Repository>,
    deployments: Vec<Deployment>,
}

impl From<&ClusterState> for StateResponse {
    fn from(state: &ClusterState) -> Self {
        StateResponse {
            users: state.users.values().map(UserResponse::from).collect(),
            namespaces: state.namespaces.values().cloned().collect(),
            repositories: state.repositories.values().cloned().collect(),
            deployments: state.deployments.values().cloned().collect(),
        }
    }
}

async fn get_state(State(engine): State<Arc<Engine>>) -> Json<StateResponse> {
    Json(engine.store().read(|s| StateResponse::from(s)))
}

async fn list_users(State(engine): State<Arc<Engine>>) -> Json<Vec<UserResponse>> {
    Json(engine.store().read(|s| s.users.values().map(UserResponse::from).collect()))
}

#[derive(Debug, Serialize)]
struct NodeResponse {
    node_id: String,
    address: String,
    leader: bool,
}

#[derive(Debug, Serialize)]
struct NodesResponse {
    node_id: String,
    status: Status,
    term: u64,
    leader: Option<String>,
    nodes: Vec<NodeResponse>,
}

async fn list_nodes(State(engine): State<Arc<Engine>>) -> Json<NodesResponse> {
    let store = engine.store();
    let leader = store.leader();
    let nodes = store
        .members()
        .into_iter()
        .map(|(node_id, address)| NodeResponse {
            leader: leader.as_deref() == Some(node_id.as_str()),
            node_id,
            address,
        })
        .collect();

    Json(NodesResponse {
        node_id: engine.node_id(),
        status: engine.status(),
        term: store.term(),
        leader,
        nodes,
    })
}

async fn list_deployments(State(engine): State<Arc<Engine>>) -> Json<Vec<Deployment>> {
    Json(engine.store().deployments())
}

async fn get_deployment(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    engine
        .store()
        .deployment(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("deployment not found: {}", id)))
}

#[derive(Debug, Deserialize)]
struct SetupRequest {
    address: String,
}

#[derive(Debug, Serialize)]
struct SetupResponse {
    node_id: String,
    raft_address: String,
}

async fn setup(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, ApiError> {
    let ip: IpAddr = req
        .address
        .parse()
        .map_err(|_| EngineError::InvalidAddress(req.address.clone()))?;
    let address = engine.setup(ip).await?;
    Ok(Json(SetupResponse {
        node_id: engine.node_id(),
        raft_address: address.to_string(),
    }))
}

async fn bootstrap(State(engine): State<Arc<Engine>>) -> Result<StatusCode, ApiError> {
    engine.bootstrap().await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    node_id: String,
    address: String,
}

async fn join(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<JoinRequest>,
) -> Result<StatusCode, ApiError> {
    engine.join(&req.node_id, &req.address).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    index: u64,
}

async fn snapshot(State(engine): State<Arc<Engine>>) -> Result<Json<SnapshotResponse>, ApiError> {
    let index = engine.store().snapshot().map_err(EngineError::from)?;
    Ok(Json(SnapshotResponse { index }))
}

#[derive(Debug, Deserialize)]
struct SignupRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

async fn signup(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let user = engine
        .signup(UserConfig {
            name: req.name,
            username: req.username,
            email: req.email,
            password: req.password,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(UserResponse::from(&user))))
}

async fn remove_user(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.remove_user(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct NamespaceRequest {
    name: String,
}

async fn create_namespace(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<NamespaceRequest>,
) -> Result<(StatusCode, Json<Namespace>), ApiError> {
    let namespace = engine.create_namespace(&req.name).await?;
    Ok((StatusCode::CREATED, Json(namespace)))
}

#[derive(Debug, Deserialize)]
struct RepositoryRequest {
    name: String,
    namespace: Option<String>,
}

async fn create_repository(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<RepositoryRequest>,
) -> Result<(StatusCode, Json<Repository>), ApiError> {
    let repository = engine
        .create_repository(&req.name, req.namespace.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(repository)))
}

#[derive(Debug, Deserialize)]
struct DeploymentRequest {
    name: String,
    repository: String,
    branch: Option<String>,
    #[serde(default)]
    path: String,
    namespace: Option<String>,
}

async fn create_deployment(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<DeploymentRequest>,
) -> Result<(StatusCode, Json<Deployment>), ApiError> {
    let deployment = engine
        .create_deployment(DeploymentConfig {
            name: req.name,
            repository: req.repository,
            branch: req.branch,
            path: req.path,
            namespace_id: req.namespace,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

#[derive(Debug, Serialize)]
struct BuildResponse {
    deployment: String,
    status: &'static str,
}

async fn build_deployment(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<BuildResponse>), ApiError> {
    // The outcome is logged and recorded in metrics by the pipeline.
    engine.spawn_build(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(BuildResponse {
            deployment: id,
            status: "building",
        }),
    ))
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        match e {
            EngineError::State(state) => match state {
                StateError::UsernameTaken(_)
                | StateError::EmailTaken(_)
                | StateError::UserExists(_)
                | StateError::NamespaceExists(_)
                | StateError::RepositoryExists(_)
                | StateError::DeploymentExists(_) => ApiError::Conflict(message),
                StateError::UserNotFound(_)
                | StateError::NamespaceNotFound(_)
                | StateError::RepositoryNotFound(_)
                | StateError::DeploymentNotFound(_) => ApiError::NotFound(message),
                StateError::MissingFields => ApiError::BadRequest(message),
                StateError::PasswordHash(_) | StateError::MalformedCommand(_) => {
                    ApiError::Internal(message)
                }
            },
            EngineError::AlreadySetup
            | EngineError::NotReady
            | EngineError::AlreadyBootstrapped
            | EngineError::InvalidAddress(_)
            | EngineError::Store(StoreError::Open(_))
            | EngineError::Store(StoreError::Join { .. }) => ApiError::BadRequest(message),
            EngineError::Build(BuildError::RepositoryNotFound(_)) => ApiError::NotFound(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
