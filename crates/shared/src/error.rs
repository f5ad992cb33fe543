//! Error types shared across the gateway

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
