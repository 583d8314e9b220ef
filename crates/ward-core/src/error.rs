use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("action '{action}' rejected: {reason}")]
    Rejected { action: String, reason: String },

    #[error("action '{0}' has no owner")]
    MissingOwner(String),

    #[error("parent action '{0}' is not running")]
    ParentNotRunning(String),

    #[error("action '{action}' is blocked on cluster '{cluster}'")]
    Blocked { action: String, cluster: String },

    #[error("no tokio runtime available to start the action engine")]
    NoRuntime,

    #[error("node not found: {0}")]
    UnknownNode(String),

    #[error("attribute '{key}' does not hold the expected type: {message}")]
    AttributeType { key: String, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WardError>;
