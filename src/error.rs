//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown state or direction filter: {0}")]
    InvalidFilter(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook signature error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
