use thiserror::Error;

/// Reasons a command is refused, either at submission time or when the
/// state machine re-validates it at apply time.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StateError {
    #[error("all of the required fields must be supplied")]
    MissingFields,

    #[error("username is already taken: {0}")]
    UsernameTaken(String),

    #[error("email address is already taken: {0}")]
    EmailTaken(String),

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("namespace already exists: {0}")]
    NamespaceExists(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("deployment already exists: {0}")]
    DeploymentExists(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("could not hash password: {0}")]
    PasswordHash(String),

    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, StateError>;
