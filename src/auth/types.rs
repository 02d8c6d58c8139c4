// Authentication types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::RwLock;

/// Store key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Store key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Profile of the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// In-memory session state
///
/// The authenticated flag is derived from the presence of a user, so the two
/// can never disagree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    user: Option<UserProfile>,
}

impl Session {
    /// Unauthenticated session
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Authenticated session for the given user
    pub fn authenticated(user: UserProfile) -> Self {
        Self { user: Some(user) }
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// Access/refresh token pair as persisted in the token store
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub saved_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl TokenPair {
    pub fn new(access_token: String, refresh_token: String, ttl: Duration) -> Self {
        Self {
            access_token,
            refresh_token,
            saved_at: Utc::now(),
            ttl,
        }
    }

    /// When the persisted entries stop being readable, `None` if out of range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at.checked_add_signed(self.ttl)
    }
}

/// Current default credential used by every outgoing request
///
/// Written by sign-in, refresh and sign-out; read once per outgoing call so a
/// request never sees a half-updated value.
#[derive(Debug, Default)]
pub struct CredentialCell {
    token: RwLock<Option<String>>,
}

impl CredentialCell {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub async fn current(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn replace(&self, token: String) {
        *self.token.write().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }
}

/// Shorten a token for log output
pub(crate) fn token_prefix(token: &str) -> &str {
    let mut end = 8.min(token.len());
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    &token[..end]
}

/// Sign-in request body
#[derive(Serialize)]
pub struct SignInRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Sign-in response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh response body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(alias = "token")]
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Machine-readable part of an error response body
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
}
