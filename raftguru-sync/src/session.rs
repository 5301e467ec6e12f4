//! Authentication collaborator.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::api::{ApiError, ItemQuery, RecordApi};
use crate::model::User;

/// What bootstrap needs to know about the logged-in user.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn is_logged_in(&self) -> bool;
    async fn current_user(&self) -> Option<User>;
}

/// Cookie session against the record server's `/auth` endpoints.
pub struct HttpSession {
    api: Arc<dyn RecordApi>,
    user: Mutex<Option<User>>,
}

impl HttpSession {
    pub fn new(api: Arc<dyn RecordApi>) -> Self {
        Self {
            api,
            user: Mutex::new(None),
        }
    }

    /// Log in with credentials; the server sets the session cookie.
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        self.api
            .create(
                "/auth/login",
                &json!({ "email": email, "password": password, "mode": "session" }),
            )
            .await?;
        log::info!("[Auth] logged in as {email}");
        self.fetch_user().await
    }

    /// Resume an existing session cookie. `None` when there is none.
    pub async fn auto_login(&self) -> Option<User> {
        match self.fetch_user().await {
            Ok(user) => Some(user),
            Err(e) => {
                log::info!("[Auth] no session to resume: {e}");
                None
            }
        }
    }

    /// End the session. The cached user is dropped even if the call fails.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self
            .api
            .create("/auth/logout", &json!({ "mode": "session" }))
            .await;
        *self.user.lock() = None;
        result.map(|_| {
            log::info!("[Auth] logged out");
        })
    }

    async fn fetch_user(&self) -> Result<User, ApiError> {
        let value = self.api.get("/users/me", &ItemQuery::default()).await;
        let value = match value {
            Ok(value) => value,
            Err(e) => {
                *self.user.lock() = None;
                return Err(e);
            }
        };
        let user = decode_user(value)?;
        *self.user.lock() = Some(user.clone());
        Ok(user)
    }
}

fn decode_user(value: Value) -> Result<User, ApiError> {
    if value.is_null() {
        return Err(ApiError::Decode {
            endpoint: "/users/me".to_string(),
            reason: "empty user".to_string(),
        });
    }
    serde_json::from_value(value).map_err(|e| ApiError::Decode {
        endpoint: "/users/me".to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl SessionProvider for HttpSession {
    async fn is_logged_in(&self) -> bool {
        self.user.lock().is_some()
    }

    async fn current_user(&self) -> Option<User> {
        self.user.lock().clone()
    }
}
