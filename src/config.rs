//! Configuration options for the session client

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default API root, matching the local development server
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";

/// Configuration options for the session client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Root URL every request path is appended to
    pub base_url: String,

    /// Path the authentication endpoints are mounted under
    pub auth_path: String,

    /// Whether the session survives restarts
    pub persist_session: bool,

    /// File backing the persisted session
    pub storage_path: PathBuf,

    /// Timeout applied to every HTTP request
    pub request_timeout: Option<Duration>,

    /// Upper bound for one token refresh round trip
    pub refresh_timeout: Duration,

    /// Tokens expiring within this window count as expired
    pub expiry_skew: Duration,

    /// Period of the proactive refresh timer
    pub refresh_interval: Duration,

    /// Confirm a restored session with the server on boot
    pub verify_on_boot: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_path: dine_session_auth::DEFAULT_AUTH_PATH.to_string(),
            persist_session: true,
            storage_path: PathBuf::from("session.json"),
            request_timeout: Some(Duration::from_secs(30)),
            refresh_timeout: Duration::from_secs(10),
            expiry_skew: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(5 * 60),
            verify_on_boot: true,
        }
    }
}

impl ClientOptions {
    /// Options for the API at `base_url`, everything else default
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    /// Read options from the environment
    ///
    /// `DINE_API_URL` is required. `DINE_SESSION_FILE`,
    /// `DINE_PERSIST_SESSION`, `DINE_REFRESH_TIMEOUT_SECS` and
    /// `DINE_REFRESH_INTERVAL_SECS` override the defaults when set.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("DINE_API_URL")
            .map_err(|_| Error::config("DINE_API_URL environment variable not found"))?;

        let mut options = Self::new(&base_url);

        if let Ok(path) = std::env::var("DINE_SESSION_FILE") {
            options.storage_path = PathBuf::from(path);
        }
        if let Some(persist) = parse_env::<bool>("DINE_PERSIST_SESSION")? {
            options.persist_session = persist;
        }
        if let Some(secs) = parse_env::<u64>("DINE_REFRESH_TIMEOUT_SECS")? {
            options.refresh_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("DINE_REFRESH_INTERVAL_SECS")? {
            options.refresh_interval = Duration::from_secs(secs);
        }

        Ok(options)
    }

    /// Set the authentication endpoint mount path
    pub fn with_auth_path(mut self, value: &str) -> Self {
        self.auth_path = format!("/{}", value.trim_matches('/'));
        self
    }

    /// Set whether to persist the session
    pub fn with_persist_session(mut self, value: bool) -> Self {
        self.persist_session = value;
        self
    }

    /// Set the session file
    pub fn with_storage_path(mut self, value: impl Into<PathBuf>) -> Self {
        self.storage_path = value.into();
        self
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, value: Option<Duration>) -> Self {
        self.request_timeout = value;
        self
    }

    /// Set the refresh timeout
    pub fn with_refresh_timeout(mut self, value: Duration) -> Self {
        self.refresh_timeout = value;
        self
    }

    /// Set the expiry skew window
    pub fn with_expiry_skew(mut self, value: Duration) -> Self {
        self.expiry_skew = value;
        self
    }

    /// Set the proactive refresh period
    pub fn with_refresh_interval(mut self, value: Duration) -> Self {
        self.refresh_interval = value;
        self
    }

    /// Set whether boot confirms the stored session with the server
    pub fn with_verify_on_boot(mut self, value: bool) -> Self {
        self.verify_on_boot = value;
        self
    }

    /// Path of the login endpoint, relative to `base_url`
    pub fn login_path(&self) -> String {
        format!("{}/login", self.auth_path)
    }

    pub(crate) fn skew_seconds(&self) -> i64 {
        i64::try_from(self.expiry_skew.as_secs()).unwrap_or(i64::MAX)
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
