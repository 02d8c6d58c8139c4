use std::sync::Arc;

use super::session::SessionState;
use super::store::TokenStore;
use super::types::{token_prefix, ErrorBody, Session, SignInRequest, SignInResponse, UserProfile};
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::http_client::{ApiRequest, AuthClient};
use crate::navigation::Navigator;

/// Session manager
/// Restores the session from persisted tokens and implements sign-in/sign-out
pub struct SessionManager {
    /// Shared authenticated client
    client: AuthClient,

    /// Session state shared with the client and refresh coordinator
    state: Arc<SessionState>,

    /// Where to go after a successful sign-in
    home_path: String,
}

impl SessionManager {
    /// Create a manager talking to `config.base_url`
    pub fn new(
        config: &Config,
        store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        let state = Arc::new(SessionState::new(
            store,
            navigator,
            config.token_ttl(),
            config.entry_path.clone(),
        ));
        let client = AuthClient::new(config, state.clone())?;
        Ok(Self::with_client(config, client))
    }

    /// Create a manager around an existing client
    pub fn with_client(config: &Config, client: AuthClient) -> Self {
        Self {
            state: client.session().clone(),
            client,
            home_path: config.home_path.clone(),
        }
    }

    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    pub async fn session(&self) -> Session {
        self.state.snapshot().await
    }

    /// Restore the session from the persisted access token
    ///
    /// Never fails: any problem leaves the session signed out.
    pub async fn bootstrap(&self) -> Session {
        let token = match self.state.persisted_access_token() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Failed to read persisted session: {}", e);
                None
            }
        };

        let Some(token) = token else {
            tracing::debug!("No persisted session, starting signed out");
            return self.state.snapshot().await;
        };

        tracing::info!("Restoring session ({}...)", token_prefix(&token));
        self.state.credential().replace(token).await;

        match self.client.get_json::<UserProfile>("/me").await {
            Ok(user) => {
                tracing::info!(email = %user.email, "Session restored");
                self.state.set_user(user).await;
            }
            Err(e) => {
                tracing::warn!("Session restore failed: {}", e);
                // Unauthorized responses and failed refreshes have already signed out
                if self.state.credential().current().await.is_some() {
                    self.state.sign_out().await;
                }
            }
        }

        self.state.snapshot().await
    }

    /// Sign in with email and password
    ///
    /// Nothing is persisted or changed unless the whole sign-in succeeds.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile> {
        tracing::info!(email = %email, "Signing in...");

        let body = serde_json::to_value(SignInRequest { email, password })
            .map_err(|e| SessionError::InvalidResponse(format!("Failed to encode sign-in: {}", e)))?;

        let response = self
            .client
            .send_unauthenticated(ApiRequest::post("/sessions", body))
            .await
            .map_err(|e| match e {
                SessionError::Api {
                    status: 401 | 403,
                    message,
                } => SessionError::Authentication(rejection_reason(&message)),
                other => other,
            })?;

        let data: SignInResponse = response.json()?;
        if data.access_token.is_empty() || data.refresh_token.is_empty() {
            return Err(SessionError::InvalidResponse(
                "Sign-in response is missing tokens".to_string(),
            ));
        }

        self.state
            .persist_tokens(data.access_token, data.refresh_token)
            .await?;

        let user = UserProfile {
            email: email.to_string(),
            permissions: data.permissions,
            roles: data.roles,
        };
        self.state.set_user(user.clone()).await;

        tracing::info!(email = %email, "Signed in");
        self.state.navigator().navigate_to(&self.home_path);

        Ok(user)
    }

    /// Clear the persisted tokens and the in-memory session
    pub async fn sign_out(&self) {
        self.state.sign_out().await;
    }
}

/// Human-readable reason from a rejected sign-in body
fn rejection_reason(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|e| e.message.or(e.code))
        .unwrap_or_else(|| {
            if body.is_empty() {
                "Invalid credentials".to_string()
            } else {
                body.to_string()
            }
        })
}
