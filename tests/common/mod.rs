#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dine_session::config::ClientOptions;
use dine_session::store::{MemoryMedium, SessionRecord};
use dine_session::token::now_unix;
use dine_session::DineSession;
use dine_session_auth::{
    AuthApi, AuthApiError, LoginCredentials, LoginResponse, RefreshResponse, Role, User,
    UserStatus,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::sync::Semaphore;

static SERIAL: AtomicUsize = AtomicUsize::new(0);

/// A signed JWT expiring `exp_offset` seconds from now
///
/// Every call yields a distinct token.
pub fn mint_token(kind: &str, exp_offset: i64) -> String {
    let serial = SERIAL.fetch_add(1, Ordering::SeqCst);
    encode(
        &Header::default(),
        &json!({
            "sub": "manager@example.com",
            "type": kind,
            "jti": serial,
            "exp": now_unix() + exp_offset,
        }),
        &EncodingKey::from_secret(b"test-signing-key"),
    )
    .unwrap()
}

pub fn fresh_access() -> String {
    mint_token("access", 3600)
}

pub fn expired_access() -> String {
    mint_token("access", -30)
}

pub fn fresh_refresh() -> String {
    mint_token("refresh", 7 * 24 * 3600)
}

pub fn user() -> User {
    User {
        id: "u-1".to_string(),
        username: "manager".to_string(),
        email: "manager@example.com".to_string(),
        phone_number: Some("0901234567".to_string()),
        role: Role::Manager,
        status: UserStatus::Active,
        created_at: "2024-05-01T10:00:00".to_string(),
        updated_at: None,
    }
}

pub fn user_json() -> serde_json::Value {
    serde_json::to_value(user()).unwrap()
}

pub fn record(access_token: String, refresh_token: String) -> SessionRecord {
    SessionRecord {
        access_token,
        refresh_token,
        user: user(),
    }
}

pub fn install_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    Succeed,
    Reject,
    Unavailable,
    Hang,
}

/// In-process authentication server
pub struct FakeAuthApi {
    behavior: Mutex<RefreshBehavior>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    revoked: Mutex<HashSet<String>>,
    issued: Mutex<Vec<String>>,
    logout_fails: Mutex<bool>,
    pub refresh_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
}

impl FakeAuthApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(RefreshBehavior::Succeed),
            gate: Mutex::new(None),
            revoked: Mutex::new(HashSet::new()),
            issued: Mutex::new(Vec::new()),
            logout_fails: Mutex::new(false),
            refresh_calls: AtomicUsize::new(0),
            me_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, behavior: RefreshBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Hold every refresh until [`FakeAuthApi::open_gate`] is called
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1024);
        }
    }

    /// Make `me` refuse this access token
    pub fn revoke(&self, access_token: &str) {
        self.revoked.lock().unwrap().insert(access_token.to_string());
    }

    pub fn set_logout_fails(&self, fails: bool) {
        *self.logout_fails.lock().unwrap() = fails;
    }

    /// Access tokens handed out by refresh, oldest first
    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().unwrap().clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn login(&self, credentials: &LoginCredentials) -> Result<LoginResponse, AuthApiError> {
        if credentials.password != "secret" {
            return Err(AuthApiError::Rejected {
                status: 401,
                message: "Invalid username or password".to_string(),
            });
        }
        Ok(LoginResponse {
            access_token: fresh_access(),
            refresh_token: fresh_refresh(),
            token_type: "Bearer".to_string(),
            user: user(),
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshResponse, AuthApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            RefreshBehavior::Succeed => {
                let access_token = fresh_access();
                self.issued.lock().unwrap().push(access_token.clone());
                Ok(RefreshResponse {
                    access_token,
                    refresh_token: fresh_refresh(),
                    token_type: "Bearer".to_string(),
                })
            }
            RefreshBehavior::Reject => Err(AuthApiError::Rejected {
                status: 401,
                message: "Invalid refresh token".to_string(),
            }),
            RefreshBehavior::Unavailable => Err(AuthApiError::Api {
                status: 503,
                message: "Service unavailable".to_string(),
            }),
            RefreshBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AuthApiError::Timeout)
            }
        }
    }

    async fn logout(&self, _access_token: Option<&str>) -> Result<(), AuthApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if *self.logout_fails.lock().unwrap() {
            return Err(AuthApiError::Api {
                status: 500,
                message: "Internal server error".to_string(),
            });
        }
        Ok(())
    }

    async fn me(&self, access_token: &str) -> Result<User, AuthApiError> {
        self.me_calls.fetch_add(1, Ordering::SeqCst);
        if self.revoked.lock().unwrap().contains(access_token) {
            return Err(AuthApiError::Rejected {
                status: 401,
                message: "Token has been revoked".to_string(),
            });
        }
        Ok(user())
    }
}

pub fn options() -> ClientOptions {
    ClientOptions::new("http://127.0.0.1:9/api")
        .with_persist_session(false)
        .with_refresh_timeout(Duration::from_secs(5))
}

/// Session manager backed by `api` and an in-memory store
pub fn session_with(api: &Arc<FakeAuthApi>, options: ClientOptions) -> DineSession {
    DineSession::with_parts(options, api.clone(), MemoryMedium::new()).unwrap()
}

/// Yield until `condition` holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
