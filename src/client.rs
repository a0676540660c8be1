//! Authenticated API client
//!
//! Every business request goes through [`SessionClient`]. It attaches the
//! stored access token, and when the server answers 401 it asks the
//! [`RefreshCoordinator`] for a new token and repeats the request once.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::fetch::{join_url, FetchBuilder};
use crate::refresh::RefreshCoordinator;
use crate::store::SessionStore;
use crate::token::Token;

/// A fully read HTTP response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    async fn read(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON; an empty body decodes as `null`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-success response into [`Error::Api`]
    pub fn into_error(self) -> Error {
        let details = serde_json::from_slice::<Value>(&self.body).ok();
        let message = details
            .as_ref()
            .and_then(|body| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP error! status: {}", self.status.as_u16()));

        Error::Api {
            status: self.status.as_u16(),
            message,
            details,
        }
    }
}

/// What to do after one send
enum Attempt {
    Ok(ApiResponse),
    /// Repeat the request with this token
    NeedsRetry(Token),
    Fatal(Error),
}

/// Client for the business API
#[derive(Clone)]
pub struct SessionClient {
    base_url: String,
    login_path: String,
    http_client: Client,
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
}

impl SessionClient {
    pub fn new(
        options: &ClientOptions,
        http_client: Client,
        store: Arc<SessionStore>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            base_url: options.base_url.clone(),
            login_path: options.login_path(),
            http_client,
            store,
            coordinator,
        }
    }

    /// Send a request, refreshing the session and retrying once on 401
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let url = join_url(&self.base_url, path);
        let mut token = self.store.access_token();
        let mut retried = false;

        loop {
            debug!(method = %method, path = %path, retried, "Sending request");
            let response = self.send(&method, &url, body, token.as_deref()).await?;

            match self.assess(response, path, token.as_deref(), retried).await? {
                Attempt::Ok(response) => return Ok(response),
                Attempt::Fatal(err) => return Err(err),
                Attempt::NeedsRetry(fresh) => {
                    token = Some(fresh);
                    retried = true;
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, None).await?.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request(Method::POST, path, Some(&body)).await?.json()
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PUT, path, Some(&body)).await?.json()
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        self.request(Method::PATCH, path, Some(&body)).await?.json()
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::DELETE, path, None).await?.json()
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut builder = FetchBuilder::new(&self.http_client, url, method.clone());
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body)?;
        }
        builder.send().await
    }

    async fn assess(
        &self,
        response: reqwest::Response,
        path: &str,
        token_used: Option<&str>,
        retried: bool,
    ) -> Result<Attempt> {
        let response = ApiResponse::read(response).await?;
        let status = response.status();

        if status.is_success() {
            return Ok(Attempt::Ok(response));
        }

        if status != StatusCode::UNAUTHORIZED || self.is_login_path(path) {
            debug!(status = %status, path = %path, "Request failed");
            return Ok(Attempt::Fatal(response.into_error()));
        }

        if retried {
            warn!(path = %path, "Still unauthorized after refreshing, giving up");
            return Ok(Attempt::Fatal(Error::SessionExpired));
        }

        debug!(path = %path, "Unauthorized, refreshing session");
        match self
            .coordinator
            .refresh_after(token_used.unwrap_or_default())
            .await
        {
            Ok(fresh) => Ok(Attempt::NeedsRetry(fresh)),
            Err(err) => Ok(Attempt::Fatal(Error::Refresh(err))),
        }
    }

    fn is_login_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path);
        format!("/{}", path.trim_matches('/')) == self.login_path
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
