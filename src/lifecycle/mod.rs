//! Session lifecycle
//!
//! [`SessionLifecycle`] restores the session at startup, performs login and
//! logout, keeps the access token fresh in the background and answers the
//! questions UI code asks before rendering a protected screen.

mod phase;
mod timer;

pub use phase::{PhaseInput, PhaseTracker, SessionPhase};
pub use timer::RefreshTimer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientOptions;
use crate::error::Result;
use crate::refresh::RefreshCoordinator;
use crate::store::{SessionRecord, SessionStore};
use crate::token;
use dine_session_auth::{AuthApi, LoginCredentials, Role, User};

/// Login, logout, restore and background refresh
#[derive(Clone)]
pub struct SessionLifecycle {
    api: Arc<dyn AuthApi>,
    store: Arc<SessionStore>,
    phase: Arc<PhaseTracker>,
    coordinator: RefreshCoordinator,
    skew_seconds: i64,
    refresh_interval: Duration,
    verify_on_boot: bool,
}

impl SessionLifecycle {
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: Arc<SessionStore>,
        phase: Arc<PhaseTracker>,
        coordinator: RefreshCoordinator,
        options: &ClientOptions,
    ) -> Self {
        Self {
            api,
            store,
            phase,
            coordinator,
            skew_seconds: options.skew_seconds(),
            refresh_interval: options.refresh_interval,
            verify_on_boot: options.verify_on_boot,
        }
    }

    /// Decide the initial phase from the stored session
    ///
    /// Only acts while `Booting`; later calls return the current phase.
    pub async fn boot(&self) -> SessionPhase {
        if self.phase() != SessionPhase::Booting {
            return self.phase();
        }

        match self.restore().await {
            Ok(Some(user)) => {
                info!(user_id = %user.id, "Session restored");
                self.store.set_user(user);
                self.phase.session_restored()
            }
            Ok(None) => {
                debug!("No stored session");
                self.phase.no_session()
            }
            Err(err) => {
                warn!(error = %err, "Could not restore session");
                self.store.clear();
                self.phase.session_ended()
            }
        }
    }

    async fn restore(&self) -> Result<Option<User>> {
        let record = match self.store.snapshot() {
            Some(record) => record,
            None => return Ok(None),
        };

        if token::is_expired_now(&record.access_token, self.skew_seconds) {
            debug!("Stored access token expired, refreshing");
            let access_token = self.coordinator.refresh().await?;
            return Ok(Some(self.api.me(&access_token).await?));
        }

        if !self.verify_on_boot {
            return Ok(Some(record.user));
        }

        match self.api.me(&record.access_token).await {
            Ok(user) => Ok(Some(user)),
            Err(err) => {
                debug!(error = %err, "Stored access token not accepted, refreshing");
                let access_token = self.coordinator.refresh_after(&record.access_token).await?;
                Ok(Some(self.api.me(&access_token).await?))
            }
        }
    }

    /// Sign in and store the new session
    ///
    /// A failed login leaves the phase and the store as they were.
    pub async fn login(&self, credentials: LoginCredentials) -> Result<User> {
        let response = self.api.login(&credentials).await?;

        self.store.set_session(SessionRecord {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            user: response.user.clone(),
        });
        self.phase.logged_in();

        info!(user_id = %response.user.id, role = %response.user.role, "Logged in");
        Ok(response.user)
    }

    /// Sign out
    ///
    /// The server is told on a best-effort basis; local state is cleared
    /// regardless of its answer.
    pub async fn logout(&self) {
        let access_token = self.store.access_token();
        if let Err(err) = self.api.logout(access_token.as_deref()).await {
            warn!(error = %err, "Logout request failed, clearing local session anyway");
        }

        self.store.clear();
        self.phase.logged_out();
        info!("Logged out");
    }

    /// Refresh the access token if it is about to expire
    ///
    /// Returns true when a fresh token is stored afterwards.
    pub async fn refresh_if_needed(&self) -> bool {
        if !self.is_authenticated() {
            return false;
        }

        let access_token = match self.store.access_token() {
            Some(token) => token,
            None => return false,
        };
        if !token::is_expired_now(&access_token, self.skew_seconds) {
            return false;
        }

        debug!("Access token close to expiry, refreshing");
        match self.coordinator.refresh_after(&access_token).await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "Proactive refresh failed");
                false
            }
        }
    }

    /// Start refreshing in the background every `refresh_interval`
    pub fn spawn_refresh_timer(&self) -> RefreshTimer {
        let lifecycle = self.clone();
        RefreshTimer::spawn(self.refresh_interval, move || {
            let lifecycle = lifecycle.clone();
            async move {
                lifecycle.refresh_if_needed().await;
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.phase()
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase().is_authenticated()
    }

    /// True until `boot` has decided the initial phase
    pub fn is_loading(&self) -> bool {
        self.phase() == SessionPhase::Booting
    }

    pub fn current_user(&self) -> Option<User> {
        if self.is_authenticated() {
            self.store.user()
        } else {
            None
        }
    }

    /// Whether the signed-in user holds any of `roles`
    pub fn has_role(&self, roles: &[Role]) -> bool {
        self.current_user()
            .map(|user| user.has_any_role(roles))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SessionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLifecycle")
            .field("phase", &self.phase())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}
