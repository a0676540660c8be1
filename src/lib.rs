//! Session manager for the Scan and Dine API
//!
//! Keeps a user signed in against a JWT-based API: the token pair is stored
//! durably, every business request carries the access token, and an expired
//! token is replaced by exactly one refresh request no matter how many
//! requests noticed the expiry at once.

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod refresh;
pub mod store;
pub mod token;

pub use dine_session_auth as auth;

use std::sync::Arc;

use reqwest::Client;
use tracing::debug;

use crate::client::SessionClient;
use crate::config::ClientOptions;
use crate::error::Result;
use crate::lifecycle::{PhaseTracker, SessionLifecycle};
use crate::refresh::RefreshCoordinator;
use crate::store::{FileMedium, MemoryMedium, SessionStore, StorageMedium};
use dine_session_auth::{AuthApi, HttpAuthApi};

/// The main entry point, wiring every component to one shared session
#[derive(Clone, Debug)]
pub struct DineSession {
    options: ClientOptions,
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    client: SessionClient,
    lifecycle: SessionLifecycle,
}

impl DineSession {
    /// Create a session manager talking to `options.base_url`
    ///
    /// # Example
    ///
    /// ```
    /// use dine_session::{config::ClientOptions, DineSession};
    ///
    /// let options = ClientOptions::new("http://localhost:5000/api").with_persist_session(false);
    /// let session = DineSession::new(options).unwrap();
    /// assert!(session.lifecycle().is_loading());
    /// ```
    pub fn new(options: ClientOptions) -> Result<Self> {
        let http_client = build_http_client(&options)?;
        let api = HttpAuthApi::new(&options.base_url, http_client.clone())
            .with_auth_path(&options.auth_path);

        let store = if options.persist_session {
            SessionStore::new(FileMedium::new(&options.storage_path))
        } else {
            SessionStore::new(MemoryMedium::new())
        };

        Ok(Self::assemble(options, http_client, Arc::new(api), store))
    }

    /// Create a session manager from `DINE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientOptions::from_env()?)
    }

    /// Create a session manager with a custom authentication backend and medium
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use dine_session::prelude::*;
    /// use dine_session::store::MemoryMedium;
    /// use dine_session_auth::HttpAuthApi;
    ///
    /// # async fn run() -> dine_session::error::Result<()> {
    /// let options = ClientOptions::new("http://localhost:5000/api");
    /// let api = HttpAuthApi::new(&options.base_url, reqwest::Client::new());
    /// let session = DineSession::with_parts(options, Arc::new(api), MemoryMedium::new())?;
    ///
    /// session.lifecycle().boot().await;
    /// let user = session
    ///     .lifecycle()
    ///     .login(LoginCredentials::new("admin@example.com", "secret"))
    ///     .await?;
    /// let orders: serde_json::Value = session.client().get("/orders").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_parts(
        options: ClientOptions,
        api: Arc<dyn AuthApi>,
        medium: impl StorageMedium + 'static,
    ) -> Result<Self> {
        let http_client = build_http_client(&options)?;
        Ok(Self::assemble(options, http_client, api, SessionStore::new(medium)))
    }

    fn assemble(
        options: ClientOptions,
        http_client: Client,
        api: Arc<dyn AuthApi>,
        store: SessionStore,
    ) -> Self {
        let store = Arc::new(store);
        let phase = Arc::new(PhaseTracker::new());
        let coordinator = RefreshCoordinator::new(
            api.clone(),
            store.clone(),
            phase.clone(),
            options.refresh_timeout,
        );
        let client = SessionClient::new(&options, http_client, store.clone(), coordinator.clone());
        let lifecycle = SessionLifecycle::new(api, store.clone(), phase, coordinator.clone(), &options);

        debug!(base_url = %options.base_url, persist = options.persist_session, "Session manager ready");

        Self {
            options,
            store,
            coordinator,
            client,
            lifecycle,
        }
    }

    /// Client for business requests
    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    /// Login, logout, boot and background refresh
    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }
}

fn build_http_client(options: &ClientOptions) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(timeout) = options.request_timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::client::{ApiResponse, SessionClient};
    pub use crate::config::ClientOptions;
    pub use crate::error::Error;
    pub use crate::lifecycle::{RefreshTimer, SessionLifecycle, SessionPhase};
    pub use crate::refresh::{RefreshCoordinator, RefreshError};
    pub use crate::store::{SessionRecord, SessionStore};
    pub use crate::DineSession;
    pub use dine_session_auth::{LoginCredentials, Role, User};
}
