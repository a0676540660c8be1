//! Authentication server client for dine-session
//!
//! Typed access to the login, token refresh, logout and current-user
//! endpoints, plus the user and token wire types shared with the session
//! manager. The [`AuthApi`] trait is the seam the session layer depends on;
//! [`HttpAuthApi`] is the reqwest-backed implementation.

mod types;

pub use types::*;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Default mount point of the authentication endpoints
pub const DEFAULT_AUTH_PATH: &str = "/auth";

/// Errors returned by the authentication server client
#[derive(Error, Debug)]
pub enum AuthApiError {
    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Request to the authentication server timed out")]
    Timeout,

    /// The server refused the presented credentials or token
    #[error("Rejected by authentication server ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for AuthApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }
}

impl AuthApiError {
    /// True when the server explicitly rejected the credentials or token
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// HTTP status of the failed response, if there was one
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } | Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Operations offered by the authentication server
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for a token pair and the user record
    async fn login(&self, credentials: &LoginCredentials) -> Result<LoginResponse, AuthApiError>;

    /// Exchange a refresh token for a new token pair
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, AuthApiError>;

    /// Invalidate the session server side
    async fn logout(&self, access_token: Option<&str>) -> Result<(), AuthApiError>;

    /// Fetch the user the access token belongs to
    async fn me(&self, access_token: &str) -> Result<User, AuthApiError>;
}

/// HTTP implementation of [`AuthApi`]
///
/// # Example
///
/// ```no_run
/// use dine_session_auth::{AuthApi, HttpAuthApi, LoginCredentials};
///
/// # async fn run() -> Result<(), dine_session_auth::AuthApiError> {
/// let api = HttpAuthApi::new("http://localhost:5000/api", reqwest::Client::new());
/// let response = api
///     .login(&LoginCredentials::new("admin@example.com", "password"))
///     .await?;
/// println!("signed in as {}", response.user.username);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    base_url: String,
    auth_path: String,
    http_client: Client,
}

impl HttpAuthApi {
    /// Create a client for the server at `base_url`
    pub fn new(base_url: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_path: DEFAULT_AUTH_PATH.to_string(),
            http_client,
        }
    }

    /// Mount the endpoints under a different path (default `/auth`)
    pub fn with_auth_path(mut self, auth_path: &str) -> Self {
        self.auth_path = format!("/{}", auth_path.trim_matches('/'));
        self
    }

    fn endpoint(&self, name: &str) -> Result<Url, AuthApiError> {
        let url = format!("{}{}/{}", self.base_url, self.auth_path, name);
        Ok(Url::parse(&url)?)
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &LoginCredentials) -> Result<LoginResponse, AuthApiError> {
        let url = self.endpoint("login")?;
        debug!(email = %credentials.email, "Sending login request");

        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .json(credentials)
            .send()
            .await?;

        read_json(response, false).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, AuthApiError> {
        let url = self.endpoint("refresh-token")?;
        debug!("Sending token refresh request");

        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        // Any client error on refresh means the refresh token is unusable.
        read_json(response, true).await
    }

    async fn logout(&self, access_token: Option<&str>) -> Result<(), AuthApiError> {
        let url = self.endpoint("logout")?;

        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, false));
        }

        Ok(())
    }

    async fn me(&self, access_token: &str) -> Result<User, AuthApiError> {
        let url = self.endpoint("me")?;

        let response = self
            .http_client
            .get(url)
            .header("Accept", "application/json")
            .bearer_auth(access_token)
            .send()
            .await?;

        read_json(response, false).await
    }
}

/// Pull the `message` field out of a JSON error body
pub fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("message")?.as_str().map(str::to_owned)
}

async fn read_json<T: DeserializeOwned>(
    response: Response,
    client_errors_reject: bool,
) -> Result<T, AuthApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(status_error(status, &body, client_errors_reject));
    }

    Ok(serde_json::from_str(&body)?)
}

fn status_error(status: StatusCode, body: &str, client_errors_reject: bool) -> AuthApiError {
    let message = extract_error_message(body)
        .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));

    let rejected = status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || (client_errors_reject && status.is_client_error());

    if rejected {
        AuthApiError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        AuthApiError::Api {
            status: status.as_u16(),
            message,
        }
    }
}
