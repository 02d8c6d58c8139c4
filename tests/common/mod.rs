//! Mock session API used by the integration tests.
//!
//! Issues tokens `T{n}`/`R{n}`, accepts only the newest access token, and
//! answers stale `T*` tokens with a `token.expired` 401.

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use bearer_session::auth::{MemoryTokenStore, SessionManager, TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use bearer_session::config::Config;
use bearer_session::navigation::RecordingNavigator;

pub const EMAIL: &str = "ana@example.com";
pub const PASSWORD: &str = "secret";

/// Server-side view of the session
#[derive(Default)]
pub struct MockState {
    generation: AtomicUsize,
    valid_access: Mutex<String>,
    valid_refresh: Mutex<String>,
    refresh_delay: Mutex<Duration>,
    refresh_fails: AtomicBool,
    pub refresh_calls: AtomicUsize,
    pub me_calls: AtomicUsize,
    /// (path, Authorization header) for every authenticated route hit
    pub seen: Mutex<Vec<(String, Option<String>)>>,
}

impl MockState {
    /// Mint a new token pair, invalidating the previous one
    fn issue(&self) -> (String, String) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("T{}", generation);
        let refresh = format!("R{}", generation);
        *self.valid_access.lock().unwrap() = access.clone();
        *self.valid_refresh.lock().unwrap() = refresh.clone();
        (access, refresh)
    }

    fn authorize(&self, path: &str, headers: &HeaderMap) -> Result<(), Response> {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        self.seen.lock().unwrap().push((path.to_string(), auth.clone()));

        let token = auth.as_deref().and_then(|a| a.strip_prefix("Bearer "));
        let valid = self.valid_access.lock().unwrap().clone();

        match token {
            Some(token) if !valid.is_empty() && token == valid => Ok(()),
            Some(token) if token.starts_with('T') => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": true, "code": "token.expired", "message": "Token expired."})),
            )
                .into_response()),
            _ => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": true, "code": "token.invalid", "message": "Invalid token."})),
            )
                .into_response()),
        }
    }
}

/// Mock API server
pub struct MockApi {
    pub state: Arc<MockState>,
    url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockApi {
    /// Start the server on a random local port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(MockState::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let app = Router::new()
            .route("/sessions", post(handle_sessions))
            .route("/refresh", post(handle_refresh))
            .route("/me", get(handle_me))
            .route("/items/:id", get(handle_item))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            state,
            url: format!("http://127.0.0.1:{}", port),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn config(&self) -> Config {
        Config::with_base_url(self.url())
    }

    /// The server knows refresh token `R{generation}` while the access token
    /// `T{generation}` is already expired
    pub fn expired_session(&self, generation: usize) -> (String, String) {
        self.state.generation.store(generation, Ordering::SeqCst);
        let refresh = format!("R{}", generation);
        *self.state.valid_access.lock().unwrap() = String::new();
        *self.state.valid_refresh.lock().unwrap() = refresh.clone();
        (format!("T{}", generation), refresh)
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    pub fn fail_refresh(&self) {
        self.state.refresh_fails.store(true, Ordering::SeqCst);
    }

    pub fn current_access(&self) -> String {
        self.state.valid_access.lock().unwrap().clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    /// Authorization headers seen for paths starting with `prefix`
    pub fn auth_headers_for(&self, prefix: &str) -> Vec<Option<String>> {
        self.state
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(_, auth)| auth.clone())
            .collect()
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn profile() -> Value {
    json!({
        "email": EMAIL,
        "permissions": ["metrics.list", "users.create"],
        "roles": ["administrator"]
    })
}

async fn handle_sessions(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    if body["email"] != EMAIL || body["password"] != PASSWORD {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": true, "message": "E-mail or password incorrect."})),
        )
            .into_response();
    }

    let (token, refresh_token) = state.issue();
    Json(json!({
        "token": token,
        "refreshToken": refresh_token,
        "permissions": profile()["permissions"],
        "roles": profile()["roles"]
    }))
    .into_response()
}

async fn handle_refresh(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if state.refresh_fails.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "refresh backend down").into_response();
    }

    let expected = state.valid_refresh.lock().unwrap().clone();
    if body["refreshToken"] != expected.as_str() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": true, "code": "refresh_token.invalid", "message": "Invalid refresh token."})),
        )
            .into_response();
    }

    let (token, refresh_token) = state.issue();
    Json(json!({"token": token, "refreshToken": refresh_token})).into_response()
}

async fn handle_me(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.me_calls.fetch_add(1, Ordering::SeqCst);
    if let Err(rejection) = state.authorize("/me", &headers) {
        return rejection;
    }
    Json(profile()).into_response()
}

async fn handle_item(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = state.authorize(&format!("/items/{}", id), &headers) {
        return rejection;
    }
    Json(json!({"id": id})).into_response()
}

// ==================================================================================================
// Client-side helpers
// ==================================================================================================

pub struct Fixture {
    pub manager: SessionManager,
    pub store: Arc<MemoryTokenStore>,
    pub navigator: Arc<RecordingNavigator>,
}

/// Manager over a fresh in-memory store
pub fn fixture(config: &Config) -> Fixture {
    fixture_with_store(config, Arc::new(MemoryTokenStore::new()))
}

pub fn fixture_with_store(config: &Config, store: Arc<MemoryTokenStore>) -> Fixture {
    let navigator = Arc::new(RecordingNavigator::new());
    let manager = SessionManager::new(config, store.clone(), navigator.clone()).unwrap();
    Fixture {
        manager,
        store,
        navigator,
    }
}

/// Manager whose store and credential already hold `access`/`refresh`
pub async fn signed_in_fixture(config: &Config, access: &str, refresh: &str) -> Fixture {
    let fixture = fixture(config);
    let ttl = chrono::Duration::days(30);
    fixture.store.set(ACCESS_TOKEN_KEY, access, ttl).unwrap();
    fixture.store.set(REFRESH_TOKEN_KEY, refresh, ttl).unwrap();
    fixture
        .manager
        .client()
        .session()
        .credential()
        .replace(access.to_string())
        .await;
    fixture
}

impl Fixture {
    pub fn stored(&self, key: &str) -> Option<String> {
        self.store.get(key).unwrap()
    }
}
