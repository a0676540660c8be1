//! Error handling for the session client

use std::fmt;
use thiserror::Error;

use crate::refresh::RefreshError;
use dine_session_auth::AuthApiError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the session client
#[derive(Error, Debug)]
pub enum Error {
    /// Network or HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Non-success response from a business endpoint
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// The session could not be refreshed and has been ended
    #[error("Token refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    /// The request was still unauthorized after a successful refresh
    #[error("Session expired")]
    SessionExpired,

    /// Errors from the authentication endpoints
    #[error("Authentication error: {0}")]
    AuthApi(#[from] AuthApiError),

    /// An operation needed a session and there is none
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Invalid client options
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            Error::Http(err) => err.status().map(|s| s.as_u16()),
            Error::AuthApi(err) => err.status(),
            _ => None,
        }
    }

    /// True when the caller must sign in again
    pub fn is_session_ended(&self) -> bool {
        matches!(
            self,
            Error::Refresh(_) | Error::SessionExpired | Error::NotAuthenticated
        )
    }
}
