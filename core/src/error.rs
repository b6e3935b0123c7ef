use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Access denied: {actor} may not {action}")]
    AccessDenied { actor: String, action: &'static str },

    #[error("Invalid state for {entity} '{id}': {detail}")]
    InvalidState {
        entity: &'static str,
        id: String,
        detail: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Upstream {service} unavailable: {detail}")]
    Upstream {
        service: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
