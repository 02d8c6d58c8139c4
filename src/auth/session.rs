// Shared session state
// Token persistence, the current credential and the in-memory user, plus sign-out

use chrono::Duration;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::store::TokenStore;
use super::types::{
    token_prefix, CredentialCell, Session, TokenPair, UserProfile, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};
use crate::error::{Result, SessionError};
use crate::navigation::Navigator;

/// State shared by the transport, the refresh coordinator and the session manager
pub struct SessionState {
    session: RwLock<Session>,
    credential: CredentialCell,
    store: Arc<dyn TokenStore>,
    navigator: Arc<dyn Navigator>,
    token_ttl: Duration,
    entry_path: String,

    /// Sign-out generation; persisting and signing out both hold this lock
    generation: Mutex<u64>,
}

impl SessionState {
    pub fn new(
        store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
        token_ttl: Duration,
        entry_path: impl Into<String>,
    ) -> Self {
        Self {
            session: RwLock::new(Session::anonymous()),
            credential: CredentialCell::default(),
            store,
            navigator,
            token_ttl,
            entry_path: entry_path.into(),
            generation: Mutex::new(0),
        }
    }

    pub fn credential(&self) -> &CredentialCell {
        &self.credential
    }

    pub fn navigator(&self) -> &dyn Navigator {
        self.navigator.as_ref()
    }

    pub async fn snapshot(&self) -> Session {
        self.session.read().await.clone()
    }

    pub async fn set_user(&self, user: UserProfile) {
        *self.session.write().await = Session::authenticated(user);
    }

    pub fn persisted_access_token(&self) -> Result<Option<String>> {
        self.read(ACCESS_TOKEN_KEY)
    }

    pub fn persisted_refresh_token(&self) -> Result<Option<String>> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// Current sign-out generation, bumped by every `sign_out`
    pub async fn generation(&self) -> u64 {
        *self.generation.lock().await
    }

    /// Persist a token pair and make its access token the current credential
    ///
    /// Either both tokens are written or neither is.
    pub async fn persist_tokens(
        &self,
        access_token: String,
        refresh_token: String,
    ) -> Result<TokenPair> {
        let _generation = self.generation.lock().await;
        self.write_pair(access_token, refresh_token).await
    }

    /// Persist a refreshed pair unless the session was signed out since `generation`
    pub async fn persist_refreshed(
        &self,
        generation: u64,
        access_token: String,
        refresh_token: String,
    ) -> Result<TokenPair> {
        let current = self.generation.lock().await;
        if *current != generation {
            tracing::info!("Session ended during refresh, discarding refreshed tokens");
            return Err(SessionError::RefreshFailed(
                "Session ended during refresh".to_string(),
            ));
        }
        self.write_pair(access_token, refresh_token).await
    }

    async fn write_pair(&self, access_token: String, refresh_token: String) -> Result<TokenPair> {
        let pair = TokenPair::new(access_token, refresh_token, self.token_ttl);

        self.store
            .set(ACCESS_TOKEN_KEY, &pair.access_token, pair.ttl)
            .map_err(|e| SessionError::Storage(format!("{:#}", e)))?;

        if let Err(e) = self
            .store
            .set(REFRESH_TOKEN_KEY, &pair.refresh_token, pair.ttl)
        {
            if let Err(rollback) = self.store.clear(ACCESS_TOKEN_KEY) {
                tracing::error!("Failed to roll back access token: {:#}", rollback);
            }
            return Err(SessionError::Storage(format!("{:#}", e)));
        }

        self.credential.replace(pair.access_token.clone()).await;

        tracing::debug!(
            "Persisted token pair (access: {}..., ttl: {} days)",
            token_prefix(&pair.access_token),
            pair.ttl.num_days()
        );

        Ok(pair)
    }

    /// Drop every trace of the session and go back to the entry page
    ///
    /// Safe to call repeatedly.
    pub async fn sign_out(&self) {
        {
            let mut generation = self.generation.lock().await;
            *generation += 1;
            for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
                if let Err(e) = self.store.clear(key) {
                    tracing::warn!("Failed to clear {} during sign-out: {:#}", key, e);
                }
            }
            self.credential.clear().await;
        }

        let was_authenticated = {
            let mut session = self.session.write().await;
            let was = session.is_authenticated();
            *session = Session::anonymous();
            was
        };

        if was_authenticated {
            tracing::info!("Signed out");
        } else {
            tracing::debug!("Sign-out on an unauthenticated session");
        }

        self.navigator.navigate_to(&self.entry_path);
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        self.store
            .get(key)
            .map_err(|e| SessionError::Storage(format!("{:#}", e)))
    }
}
