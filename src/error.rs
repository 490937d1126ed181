//! Error types for authgate

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::session::SessionError;
use crate::verifier::VerifierError;

/// Result type alias for authgate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session codec or store failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Token verification failure
    #[error(transparent)]
    Verifier(#[from] VerifierError),

    /// Identity provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Upstream forwarding failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status to surface when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Session(SessionError::NotFound | SessionError::Invalid(_))
            | Self::Verifier(_)
            | Self::Provider(ProviderError::InvalidToken(_)) => StatusCode::UNAUTHORIZED,
            Self::Upstream(_) | Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Session(SessionError::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            // Encoding failures point at key/config problems, exchange failures
            // are shown to the user as a login error.
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
