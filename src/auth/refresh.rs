// Token refresh logic
// Single-flight refresh coordinator and the refresh endpoint call

use futures::future::BoxFuture;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

use super::session::SessionState;
use super::types::{token_prefix, RefreshRequest, RefreshResponse};
use crate::error::{Result, SessionError};

/// Future returned by a refresh call
pub type RefreshFuture = BoxFuture<'static, Result<RefreshResponse>>;

/// Performs one refresh call given the persisted refresh token
pub type RefreshFn = Arc<dyn Fn(String) -> RefreshFuture + Send + Sync>;

/// Call the refresh endpoint
pub async fn request_refresh(
    client: &Client,
    url: &str,
    refresh_token: &str,
) -> Result<RefreshResponse> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(url)
        .json(&RefreshRequest { refresh_token })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %error_text,
            "Refresh endpoint returned an error"
        );
        return Err(SessionError::from_status(status.as_u16(), &error_text));
    }

    let data: RefreshResponse = response
        .json()
        .await
        .map_err(|e| SessionError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))?;

    if data.access_token.is_empty() {
        return Err(SessionError::InvalidResponse(
            "Refresh response does not contain an access token".to_string(),
        ));
    }

    tracing::info!(
        "Access token refreshed ({}...)",
        token_prefix(&data.access_token)
    );

    Ok(data)
}

/// Refresh function that posts to `url` with the given client
pub fn http_refresher(client: Client, url: String) -> RefreshFn {
    Arc::new(move |refresh_token: String| {
        let client = client.clone();
        let url = url.clone();
        Box::pin(async move { request_refresh(&client, &url, &refresh_token).await })
    })
}

/// A request suspended until the in-flight refresh settles
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    label: String,
    responder: oneshot::Sender<Result<String>>,
}

impl PendingRequest {
    pub fn new(id: u64, label: impl Into<String>) -> (Self, oneshot::Receiver<Result<String>>) {
        let (responder, receiver) = oneshot::channel();
        let request = Self {
            id,
            label: label.into(),
            responder,
        };
        (request, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Hand the refresh outcome to the waiting caller
    ///
    /// Returns false when the caller has gone away.
    fn resolve(self, outcome: &Result<String>) -> bool {
        self.responder.send(outcome.clone()).is_ok()
    }
}

/// Refresh state machine
#[derive(Debug, Default)]
pub enum RefreshState {
    #[default]
    Idle,
    Refreshing { queue: Vec<PendingRequest> },
}

impl RefreshState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RefreshState::Idle)
    }

    pub fn pending(&self) -> usize {
        match self {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }

    /// Queue a request; returns true when this request opened a new refresh cycle
    pub fn enqueue(&mut self, request: PendingRequest) -> bool {
        match self {
            RefreshState::Idle => {
                *self = RefreshState::Refreshing {
                    queue: vec![request],
                };
                true
            }
            RefreshState::Refreshing { queue } => {
                queue.push(request);
                false
            }
        }
    }

    /// Close the cycle: back to `Idle`, handing out the queue in enqueue order
    pub fn finish(&mut self) -> Vec<PendingRequest> {
        match std::mem::take(self) {
            RefreshState::Idle => Vec::new(),
            RefreshState::Refreshing { queue } => queue,
        }
    }
}

/// Observable coordinator phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing { pending: Vec<String> },
}

/// Single-flight refresh coordinator
///
/// However many requests discover an expired token at once, only one refresh
/// call is in flight; every waiter gets that call's outcome.
///
/// Waiters are woken in enqueue order. Each retry then runs on its waiter's
/// own task, so on a multi-threaded runtime the retries may start in any
/// order; only a `current_thread` runtime keeps them FIFO.
///
/// A sign-out while the call is in flight discards its result: nothing is
/// persisted and the waiters fail with `RefreshFailed`.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    session: Arc<SessionState>,
    refresher: RefreshFn,
    timeout: Duration,
    sign_out_on_failure: bool,
    next_id: AtomicU64,
    refresh_count: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        session: Arc<SessionState>,
        refresher: RefreshFn,
        timeout: Duration,
        sign_out_on_failure: bool,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            session,
            refresher,
            timeout,
            sign_out_on_failure,
            next_id: AtomicU64::new(0),
            refresh_count: AtomicU64::new(0),
        }
    }

    pub async fn phase(&self) -> RefreshPhase {
        match &*self.state.lock().await {
            RefreshState::Idle => RefreshPhase::Idle,
            RefreshState::Refreshing { queue } => RefreshPhase::Refreshing {
                pending: queue.iter().map(|r| r.label().to_string()).collect(),
            },
        }
    }

    /// Number of refresh calls dispatched so far
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Obtain an access token newer than `stale`
    ///
    /// `stale` is the token the failed request was sent with. If a refresh
    /// already replaced it the current token is returned at once; otherwise the
    /// caller joins (or starts) the refresh cycle.
    pub async fn fresh_token(self: &Arc<Self>, stale: Option<&str>, label: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (request, receiver) = PendingRequest::new(id, label);

        let dispatch = {
            let mut state = self.state.lock().await;

            if state.is_idle() {
                if let Some(current) = self.session.credential().current().await {
                    if stale != Some(current.as_str()) {
                        tracing::debug!(
                            label = %label,
                            "Token already refreshed, retrying with current credential"
                        );
                        return Ok(current);
                    }
                }
            }

            let dispatch = if state.enqueue(request) {
                Some(self.session.generation().await)
            } else {
                None
            };
            tracing::debug!(
                label = %label,
                pending = state.pending(),
                "Waiting for token refresh"
            );
            dispatch
        };

        if let Some(generation) = dispatch {
            self.refresh_count.fetch_add(1, Ordering::SeqCst);
            let coordinator = Arc::clone(self);
            tokio::spawn(async move { coordinator.run_refresh(generation).await });
        }

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::RefreshFailed(
                "Refresh finished without delivering a result".to_string(),
            )),
        }
    }

    async fn run_refresh(self: Arc<Self>, generation: u64) {
        let outcome = self.perform_refresh(generation).await;

        if let Err(ref e) = outcome {
            tracing::error!("Token refresh failed: {}", e);
            // Already signed out if the generation moved on
            if self.sign_out_on_failure && self.session.generation().await == generation {
                self.session.sign_out().await;
            }
        }

        let mut state = self.state.lock().await;
        let queue = state.finish();
        let total = queue.len();
        let mut delivered = 0;
        for request in queue {
            let id = request.id();
            if request.resolve(&outcome) {
                delivered += 1;
            } else {
                tracing::debug!(request_id = id, "Waiter dropped before refresh settled");
            }
        }

        tracing::debug!(
            total = total,
            delivered = delivered,
            success = outcome.is_ok(),
            "Refresh queue drained"
        );
    }

    async fn perform_refresh(&self, generation: u64) -> Result<String> {
        let refresh_token = self
            .session
            .persisted_refresh_token()
            .map_err(|e| SessionError::refresh_failed(&e))?
            .ok_or_else(|| SessionError::RefreshFailed("No refresh token stored".to_string()))?;

        let mut call = tokio::spawn((self.refresher)(refresh_token.clone()));

        let response = match tokio::time::timeout(self.timeout, &mut call).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(e))) => return Err(SessionError::refresh_failed(&e)),
            Ok(Err(join_error)) => {
                return Err(SessionError::RefreshFailed(format!(
                    "Refresh task aborted: {}",
                    join_error
                )))
            }
            Err(_) => {
                call.abort();
                return Err(SessionError::RefreshFailed(format!(
                    "Timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        // Keep the current refresh token if the server did not rotate it
        let next_refresh_token = response.refresh_token.unwrap_or(refresh_token);

        let pair = self
            .session
            .persist_refreshed(generation, response.access_token, next_refresh_token)
            .await
            .map_err(|e| SessionError::refresh_failed(&e))?;

        Ok(pair.access_token)
    }
}
