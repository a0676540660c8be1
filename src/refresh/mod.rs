//! Single-flight token refresh
//!
//! However many callers discover an expired access token at the same time,
//! [`RefreshCoordinator`] sends one refresh request and hands its outcome to
//! all of them. A failed refresh ends the session it exchanged: the store is
//! cleared and the lifecycle moves to `Unauthenticated` before any waiter
//! hears about the failure. A session stored after the exchange began is
//! left alone.

mod state;

pub use state::{Admission, RefreshState, RefreshWaiter};

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::lifecycle::PhaseTracker;
use crate::store::SessionStore;
use crate::token::{self, Token};
use dine_session_auth::{AuthApi, AuthApiError};
use state::RefreshOutcome;

/// Why a refresh cycle failed
///
/// Cloneable because every waiter of a cycle receives the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh token has expired")]
    RefreshTokenExpired,

    /// The server refused the refresh token
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    #[error("network error during refresh: {0}")]
    Network(String),

    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),

    /// The refresh task was torn down, typically by runtime shutdown
    #[error("refresh was aborted before completing")]
    Aborted,

    /// The session was logged out or replaced while the refresh ran
    #[error("session changed during refresh")]
    Superseded,
}

impl RefreshError {
    /// Whether this failure means the stored session is no longer usable
    pub fn ends_session(&self) -> bool {
        !matches!(self, RefreshError::Superseded | RefreshError::Aborted)
    }
}

impl From<AuthApiError> for RefreshError {
    fn from(err: AuthApiError) -> Self {
        match err {
            AuthApiError::Rejected { message, .. } => RefreshError::Rejected(message),
            other => RefreshError::Network(other.to_string()),
        }
    }
}

/// Runs refresh cycles on behalf of every component
///
/// Cloning is cheap and every clone shares the same state, so the reactive
/// 401 path and the proactive timer always funnel through one cycle.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn AuthApi>,
    store: Arc<SessionStore>,
    phase: Arc<PhaseTracker>,
    state: Mutex<RefreshState>,
    timeout: Duration,
}

enum Joined {
    Current(Token),
    Waiting(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshCoordinator {
    pub fn new(
        api: Arc<dyn AuthApi>,
        store: Arc<SessionStore>,
        phase: Arc<PhaseTracker>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                phase,
                state: Mutex::new(RefreshState::Idle),
                timeout,
            }),
        }
    }

    /// Obtain a new access token
    ///
    /// Joins the running cycle if there is one, otherwise starts it.
    pub async fn refresh(&self) -> Result<Token, RefreshError> {
        match self.join(None) {
            Joined::Current(token) => Ok(token),
            Joined::Waiting(receiver) => receiver.await.unwrap_or(Err(RefreshError::Aborted)),
        }
    }

    /// Obtain an access token newer than `stale`
    ///
    /// When no cycle is running and the stored token already differs from
    /// `stale`, an earlier cycle has replaced it and that token is returned
    /// without touching the network.
    pub async fn refresh_after(&self, stale: &str) -> Result<Token, RefreshError> {
        match self.join(Some(stale)) {
            Joined::Current(token) => Ok(token),
            Joined::Waiting(receiver) => receiver.await.unwrap_or(Err(RefreshError::Aborted)),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.lock_state().is_in_flight()
    }

    /// Callers currently waiting on the running cycle
    pub fn pending_waiters(&self) -> usize {
        self.inner.lock_state().pending()
    }

    fn join(&self, stale: Option<&str>) -> Joined {
        let (sender, receiver) = RefreshWaiter::channel();

        let admission = {
            let mut state = self.inner.lock_state();

            if let (Some(stale), false) = (stale, state.is_in_flight()) {
                if let Some(current) = self.inner.store.access_token() {
                    if current != stale {
                        debug!("Access token already replaced, skipping refresh");
                        return Joined::Current(current);
                    }
                }
            }

            state.admit(sender)
        };

        match admission {
            Admission::Initiator => {
                debug!("Starting token refresh cycle");
                let cycle = Cycle {
                    inner: self.inner.clone(),
                    exchanged: None,
                    completed: false,
                };
                tokio::spawn(cycle.run());
            }
            Admission::Joined => debug!("Joining in-flight token refresh"),
        }

        Joined::Waiting(receiver)
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &self.is_in_flight())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn exchange(&self, refresh_token: Option<&str>) -> RefreshOutcome {
        let refresh_token = refresh_token.ok_or(RefreshError::MissingRefreshToken)?;

        if token::is_expired_now(refresh_token, 0) {
            return Err(RefreshError::RefreshTokenExpired);
        }

        let response = match tokio::time::timeout(self.timeout, self.api.refresh(refresh_token)).await {
            Ok(result) => result?,
            Err(_) => return Err(RefreshError::Timeout(self.timeout)),
        };

        let access_token = response.access_token;
        if !self
            .store
            .rotate_tokens(refresh_token, access_token.clone(), response.refresh_token)
        {
            return Err(RefreshError::Superseded);
        }

        Ok(access_token)
    }
}

/// One network refresh, run detached from the callers
///
/// If the task is dropped before finishing (runtime shutdown, panic in the
/// API implementation), the drop handler still releases every waiter. The
/// stored session is kept in that case so it survives a restart.
struct Cycle {
    inner: Arc<Inner>,
    /// Refresh token this cycle read from the store
    exchanged: Option<Token>,
    completed: bool,
}

impl Cycle {
    async fn run(mut self) {
        self.exchanged = self.inner.store.refresh_token();
        let outcome = self.inner.exchange(self.exchanged.as_deref()).await;
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: RefreshOutcome) {
        self.completed = true;

        let outcome = match outcome {
            Ok(token) => {
                info!("Token refresh succeeded");
                Ok(token)
            }
            Err(err) if !err.ends_session() => {
                debug!(error = %err, "Releasing refresh waiters without teardown");
                Err(err)
            }
            Err(err) => {
                if self.inner.store.clear_if_refresh(self.exchanged.as_deref()) {
                    warn!(error = %err, "Token refresh failed, ending session");
                    self.inner.phase.session_ended();
                    Err(err)
                } else {
                    debug!(error = %err, "Token refresh failed for a replaced session");
                    Err(RefreshError::Superseded)
                }
            }
        };

        let waiters = self.inner.lock_state().finish();
        debug!(waiters = waiters.len(), "Releasing refresh waiters");
        for waiter in waiters {
            waiter.resolve(outcome.clone());
        }
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        if !self.completed {
            self.complete(Err(RefreshError::Aborted));
        }
    }
}
