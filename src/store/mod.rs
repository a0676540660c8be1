//! Session state shared by every component
//!
//! [`SessionStore`] is the only code that touches the durable medium. Reads
//! are served from an in-memory mirror; writes update the mirror and then
//! the medium while still holding the mirror's write lock, so the medium
//! sees writes in the same order as the mirror. If the medium fails, the
//! store logs it and keeps working from memory for the rest of the process
//! lifetime.

mod medium;

pub use medium::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::token::Token;
use dine_session_auth::User;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const USER_KEY: &str = "user";

/// A complete authenticated session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub access_token: Token,
    pub refresh_token: Token,
    pub user: User,
}

#[derive(Debug, Default)]
struct Mirror {
    access_token: Option<Token>,
    refresh_token: Option<Token>,
    user: Option<User>,
}

/// Holder of the current session
pub struct SessionStore {
    medium: Box<dyn StorageMedium>,
    mirror: RwLock<Mirror>,
    degraded: AtomicBool,
}

impl SessionStore {
    /// Open a store on `medium`, loading any session persisted there
    pub fn new(medium: impl StorageMedium + 'static) -> Self {
        let store = Self {
            medium: Box::new(medium),
            mirror: RwLock::new(Mirror::default()),
            degraded: AtomicBool::new(false),
        };
        store.load();
        store
    }

    /// A store that never outlives the process
    pub fn in_memory() -> Self {
        Self::new(MemoryMedium::new())
    }

    pub fn access_token(&self) -> Option<Token> {
        self.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<Token> {
        self.read().refresh_token.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.read().user.clone()
    }

    /// Access and refresh token, read together
    pub fn token_pair(&self) -> Option<(Token, Token)> {
        let mirror = self.read();
        match (&mirror.access_token, &mirror.refresh_token) {
            (Some(access), Some(refresh)) => Some((access.clone(), refresh.clone())),
            _ => None,
        }
    }

    /// The whole session, if every field is present
    pub fn snapshot(&self) -> Option<SessionRecord> {
        let mirror = self.read();
        match (&mirror.access_token, &mirror.refresh_token, &mirror.user) {
            (Some(access), Some(refresh), Some(user)) => Some(SessionRecord {
                access_token: access.clone(),
                refresh_token: refresh.clone(),
                user: user.clone(),
            }),
            _ => None,
        }
    }

    pub fn has_session(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Replace the whole session
    pub fn set_session(&self, record: SessionRecord) {
        let user_json = match serde_json::to_string(&record.user) {
            Ok(json) => Some(json),
            Err(err) => {
                warn!(error = %err, "Could not serialize user record, keeping it in memory only");
                None
            }
        };

        let mut mirror = self.write();
        mirror.access_token = Some(record.access_token.clone());
        mirror.refresh_token = Some(record.refresh_token.clone());
        mirror.user = Some(record.user);

        let mut entries = vec![
            (ACCESS_TOKEN_KEY, Some(record.access_token.as_str())),
            (REFRESH_TOKEN_KEY, Some(record.refresh_token.as_str())),
        ];
        if let Some(json) = user_json.as_deref() {
            entries.push((USER_KEY, Some(json)));
        }
        self.persist(&entries);
    }

    /// Replace the token pair, keeping the user
    pub fn set_access_and_refresh(&self, access_token: Token, refresh_token: Token) {
        let mut mirror = self.write();
        mirror.access_token = Some(access_token.clone());
        mirror.refresh_token = Some(refresh_token.clone());

        self.persist(&[
            (ACCESS_TOKEN_KEY, Some(access_token.as_str())),
            (REFRESH_TOKEN_KEY, Some(refresh_token.as_str())),
        ]);
    }

    /// Replace the token pair only if the stored refresh token is `expected`
    ///
    /// Returns false, leaving the store untouched, when the session was
    /// cleared or replaced since `expected` was read.
    pub fn rotate_tokens(&self, expected: &str, access_token: Token, refresh_token: Token) -> bool {
        let mut mirror = self.write();
        if mirror.refresh_token.as_deref() != Some(expected) {
            return false;
        }
        mirror.access_token = Some(access_token.clone());
        mirror.refresh_token = Some(refresh_token.clone());

        self.persist(&[
            (ACCESS_TOKEN_KEY, Some(access_token.as_str())),
            (REFRESH_TOKEN_KEY, Some(refresh_token.as_str())),
        ]);
        true
    }

    /// Replace the user record, keeping the tokens
    pub fn set_user(&self, user: User) {
        let user_json = serde_json::to_string(&user);
        let mut mirror = self.write();
        mirror.user = Some(user);

        match user_json {
            Ok(json) => self.persist(&[(USER_KEY, Some(json.as_str()))]),
            Err(err) => warn!(error = %err, "Could not serialize user record"),
        }
    }

    /// Forget the session
    pub fn clear(&self) {
        let mut mirror = self.write();
        self.clear_locked(&mut mirror);
    }

    /// Forget the session only if the stored refresh token is `expected`
    ///
    /// Returns false, leaving the store untouched, when a newer session has
    /// been stored since `expected` was read.
    pub fn clear_if_refresh(&self, expected: Option<&str>) -> bool {
        let mut mirror = self.write();
        if mirror.refresh_token.as_deref() != expected {
            return false;
        }
        self.clear_locked(&mut mirror);
        true
    }

    fn clear_locked(&self, mirror: &mut Mirror) {
        *mirror = Mirror::default();
        self.persist(&[
            (ACCESS_TOKEN_KEY, None),
            (REFRESH_TOKEN_KEY, None),
            (USER_KEY, None),
        ]);
        debug!("Session store cleared");
    }

    /// True once the medium has failed and the store runs from memory
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn load(&self) {
        let loaded = (|| -> Result<_, StorageError> {
            Ok((
                self.medium.get(ACCESS_TOKEN_KEY)?,
                self.medium.get(REFRESH_TOKEN_KEY)?,
                self.medium.get(USER_KEY)?,
            ))
        })();

        let (access, refresh, user_json) = match loaded {
            Ok(values) => values,
            Err(err) => {
                self.degrade(&err);
                return;
            }
        };

        let user = user_json
            .as_deref()
            .and_then(|json| match serde_json::from_str::<User>(json) {
                Ok(user) => Some(user),
                Err(err) => {
                    warn!(error = %err, "Discarding unreadable stored user record");
                    None
                }
            });

        match (access, refresh, user) {
            (Some(access_token), Some(refresh_token), Some(user)) => {
                debug!(user_id = %user.id, "Loaded persisted session");
                *self.write() = Mirror {
                    access_token: Some(access_token),
                    refresh_token: Some(refresh_token),
                    user: Some(user),
                };
            }
            (None, None, None) if user_json.is_none() => {}
            _ => {
                debug!("Removing incomplete persisted session");
                self.persist(&[
                    (ACCESS_TOKEN_KEY, None),
                    (REFRESH_TOKEN_KEY, None),
                    (USER_KEY, None),
                ]);
            }
        }
    }

    fn persist(&self, entries: &[(&str, Option<&str>)]) {
        if self.is_degraded() {
            return;
        }
        if let Err(err) = self.medium.write_batch(entries) {
            self.degrade(&err);
        }
    }

    fn degrade(&self, err: &StorageError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error = %err, "Session storage unavailable, continuing in memory only");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Mirror> {
        self.mirror.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Mirror> {
        self.mirror.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("has_session", &self.has_session())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
