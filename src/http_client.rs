use bytes::Bytes;
use reqwest::{Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::refresh::{http_refresher, RefreshCoordinator, RefreshFn};
use crate::auth::{token_prefix, ErrorBody, SessionState};
use crate::config::Config;
use crate::error::{Result, SessionError};

/// A replayable API request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_json(body)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send this request with `token` instead of the current credential
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Short description used in logs and the refresh queue
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Successful API response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: u16,
    body: Bytes,
}

impl ApiResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| SessionError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }
}

/// How a response affects the session
enum Classified {
    Success(ApiResponse),
    Expired,
    Unauthorized(String),
    Failed(SessionError),
}

struct ClientInner {
    client: Client,
    base_url: String,
    session: Arc<SessionState>,
    coordinator: Arc<RefreshCoordinator>,
    expired_code: String,
}

/// Shared authenticated HTTP client
///
/// Attaches the current access token to every request and classifies every
/// response:
/// - 2xx: returned as is
/// - 401 with the expired reason code: waits for the refresh coordinator, then retries once
/// - other 401: signs out and fails with `Unauthorized`
/// - anything else: returned as an error untouched
///
/// Cheap to clone; clones share the connection pool and refresh coordinator.
#[derive(Clone)]
pub struct AuthClient {
    inner: Arc<ClientInner>,
}

impl AuthClient {
    /// Create a client whose refreshes go to `{base_url}/refresh`
    pub fn new(config: &Config, session: Arc<SessionState>) -> Result<Self> {
        let client = build_client(config)?;
        let refresher = http_refresher(client.clone(), join_url(&config.base_url, "/refresh"));
        Ok(Self::assemble(config, client, session, refresher))
    }

    /// Create a client with a custom refresh call
    pub fn with_refresher(
        config: &Config,
        session: Arc<SessionState>,
        refresher: RefreshFn,
    ) -> Result<Self> {
        let client = build_client(config)?;
        Ok(Self::assemble(config, client, session, refresher))
    }

    fn assemble(
        config: &Config,
        client: Client,
        session: Arc<SessionState>,
        refresher: RefreshFn,
    ) -> Self {
        let coordinator = Arc::new(RefreshCoordinator::new(
            session.clone(),
            refresher,
            config.refresh_timeout(),
            config.sign_out_on_refresh_failure,
        ));

        Self {
            inner: Arc::new(ClientInner {
                client,
                base_url: config.base_url.clone(),
                session,
                coordinator,
                expired_code: config.expired_reason_code.clone(),
            }),
        }
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.inner.session
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.inner.coordinator
    }

    /// Send a request with the current credential, refreshing it if it expired
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let token = match request.bearer {
            Some(ref token) => Some(token.clone()),
            None => self.inner.session.credential().current().await,
        };

        let response = self.execute(&request, token.as_deref(), &request_id).await?;

        match self.classify(response) {
            Classified::Success(response) => Ok(response),
            Classified::Failed(e) => Err(e),
            Classified::Unauthorized(reason) => Err(self.reject(&request_id, reason).await),
            Classified::Expired => {
                tracing::info!(
                    request_id = %request_id,
                    request = %request.label(),
                    "Access token expired, waiting for refresh"
                );

                let fresh = self
                    .inner
                    .coordinator
                    .fresh_token(token.as_deref(), &request.label())
                    .await?;

                tracing::debug!(
                    request_id = %request_id,
                    token = %token_prefix(&fresh),
                    "Retrying with refreshed token"
                );

                // Single retry: a second expiry is final
                let retry = self.execute(&request, Some(&fresh), &request_id).await?;
                match self.classify(retry) {
                    Classified::Success(response) => Ok(response),
                    Classified::Failed(e) => Err(e),
                    Classified::Expired => {
                        tracing::warn!(
                            request_id = %request_id,
                            "Refreshed token rejected as expired, giving up"
                        );
                        Err(SessionError::ExpiredCredential)
                    }
                    Classified::Unauthorized(reason) => {
                        Err(self.reject(&request_id, reason).await)
                    }
                }
            }
        }
    }

    /// Send a request with no credential and no 401 handling
    ///
    /// Used for calls that must never re-enter the refresh path (sign-in).
    pub async fn send_unauthenticated(&self, request: ApiRequest) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let response = self.execute(&request, None, &request_id).await?;

        if (200..300).contains(&response.status) {
            Ok(response)
        } else {
            Err(SessionError::from_status(response.status, &response.text()))
        }
    }

    /// GET a path and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let body = serde_json::to_value(body)
            .map_err(|e| SessionError::InvalidResponse(format!("Failed to encode body: {}", e)))?;
        self.send(ApiRequest::post(path, body)).await?.json()
    }

    async fn execute(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
        request_id: &str,
    ) -> Result<ApiResponse> {
        let url = join_url(&self.inner.base_url, &request.path);
        tracing::debug!(
            request_id = %request_id,
            method = %request.method,
            url = %url,
            authenticated = token.is_some(),
            "Sending HTTP request"
        );

        let mut builder = self.inner.client.request(request.method.clone(), &url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            let err = SessionError::from(e);
            tracing::warn!(
                request_id = %request_id,
                url = %url,
                error = %err,
                "HTTP request error"
            );
            err
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;

        tracing::debug!(
            request_id = %request_id,
            status = status,
            "Received HTTP response"
        );

        Ok(ApiResponse { status, body })
    }

    fn classify(&self, response: ApiResponse) -> Classified {
        match response.status {
            200..=299 => Classified::Success(response),
            401 => {
                let error: ErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();
                match error.code {
                    Some(code) if code == self.inner.expired_code => Classified::Expired,
                    Some(code) => Classified::Unauthorized(code),
                    None => Classified::Unauthorized(
                        error.message.unwrap_or_else(|| "unauthorized".to_string()),
                    ),
                }
            }
            status => {
                let text = response.text();
                tracing::warn!(status = status, "Received error response");
                Classified::Failed(SessionError::from_status(status, &text))
            }
        }
    }

    async fn reject(&self, request_id: &str, reason: String) -> SessionError {
        tracing::warn!(
            request_id = %request_id,
            reason = %reason,
            "Unrecoverable 401, signing out"
        );
        self.inner.session.sign_out().await;
        SessionError::Unauthorized { reason }
    }
}

fn build_client(config: &Config) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.http_connect_timeout))
        .timeout(Duration::from_secs(config.http_request_timeout))
        .build()
        .map_err(|e| SessionError::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Join the base URL and a path with exactly one slash
fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
