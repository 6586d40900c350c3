use super::error::SessionError;
use super::storage::TokenStorage;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Login endpoint. A 401 here means bad credentials, never a stale token.
pub const LOGIN_PATH: &str = "/auth/login";
/// Refresh endpoint. A 401 here ends the session.
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Requests ────────────────────────────────────────────────────────

/// Builds a multipart form. Called once per attempt since forms are consumed.
pub type MultipartFactory = Arc<dyn Fn() -> reqwest::multipart::Form + Send + Sync>;

/// Body of an outgoing request.
#[derive(Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Sent with `Content-Type: application/json`.
    Json(Value),
    /// The transport sets `multipart/form-data` with its own boundary.
    Multipart(MultipartFactory),
    /// Raw bytes with an optional explicit content type.
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Multipart(_) => f.write_str("Multipart(..)"),
            Self::Bytes { data, content_type } => f
                .debug_struct("Bytes")
                .field("len", &data.len())
                .field("content_type", content_type)
                .finish(),
        }
    }
}

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body. Serialization failures surface as `Decode`.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, SessionError> {
        let value =
            serde_json::to_value(body).map_err(|e| SessionError::Decode(e.to_string()))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart<F>(mut self, make_form: F) -> Self
    where
        F: Fn() -> reqwest::multipart::Form + Send + Sync + 'static,
    {
        self.body = RequestBody::Multipart(Arc::new(make_form));
        self
    }

    pub fn bytes(mut self, data: Vec<u8>, content_type: Option<&str>) -> Self {
        self.body = RequestBody::Bytes {
            data,
            content_type: content_type.map(str::to_string),
        };
        self
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    fn skips_refresh(&self) -> bool {
        let path = self.path.split('?').next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        path == LOGIN_PATH || path == REFRESH_PATH
    }
}

/// A successful (2xx) response. `body` is `null` when the response was empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

/// Token body returned by the login and refresh endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

// ── Guard ───────────────────────────────────────────────────────────

type RefreshFuture = Shared<BoxFuture<'static, Result<String, SessionError>>>;

/// Single-flight refresh bookkeeping.
#[derive(Default)]
struct RefreshSlot {
    /// The refresh currently running, if any.
    in_flight: Option<RefreshFuture>,
    /// Number of refreshes that have completed.
    epoch: u64,
    /// Outcome of the most recent completed refresh.
    last_outcome: Option<Result<String, SessionError>>,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    storage: Arc<dyn TokenStorage>,
    slot: Mutex<RefreshSlot>,
    expired: watch::Sender<bool>,
}

/// HTTP client wrapper that attaches the bearer token and recovers from an
/// expired access token.
///
/// A 401 triggers one refresh no matter how many requests fail at once: the
/// first caller starts it, everyone else awaits the same shared future. A
/// caller whose 401 arrives after that refresh already finished reuses its
/// outcome instead of starting another. Each request is retried at most once.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<Inner>,
}

impl SessionGuard {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        storage: Arc<dyn TokenStorage>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url, storage))
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        storage: Arc<dyn TokenStorage>,
    ) -> Self {
        let (expired, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                storage,
                slot: Mutex::new(RefreshSlot::default()),
                expired,
            }),
        }
    }

    /// Receiver flipped to `true` when a refresh fails and the user must sign in again.
    pub fn subscribe_expired(&self) -> watch::Receiver<bool> {
        self.inner.expired.subscribe()
    }

    pub fn is_session_expired(&self) -> bool {
        *self.inner.expired.borrow()
    }

    pub fn has_session(&self) -> bool {
        self.inner.storage.access_token().is_some()
    }

    /// Sign in and store the issued tokens.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, SessionError> {
        let request = ApiRequest::post(LOGIN_PATH).json(&serde_json::json!({
            "username": username,
            "password": password,
        }))?;
        let response = self.send(&request).await?;
        let tokens: TokenResponse = serde_json::from_value(response.body)
            .map_err(|e| SessionError::Decode(e.to_string()))?;

        self.inner.store_tokens(&tokens);
        self.inner.expired.send_replace(false);
        tracing::info!(username, "Signed in");
        Ok(tokens)
    }

    /// Revoke the session server-side (best effort) and forget the tokens.
    pub async fn logout(&self) {
        let token = self.inner.storage.access_token();
        if token.is_some() {
            let request = ApiRequest::post(LOGOUT_PATH);
            if let Err(e) = self.inner.dispatch(&request, token.as_deref()).await {
                tracing::debug!(error = %e, "Logout request failed");
            }
        }
        self.inner.clear_tokens();
    }

    /// Send a request, refreshing the session once on 401.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, SessionError> {
        let seen_epoch = self.inner.slot.lock().epoch;
        let token = self.inner.storage.access_token();

        let response = self.inner.dispatch(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED || request.skips_refresh() {
            return read_response(response).await;
        }

        tracing::debug!(path = %request.path, "Access token rejected, refreshing");
        let token = self.refresh_after(seen_epoch).await?;

        let retried = self.inner.dispatch(request, Some(&token)).await?;
        read_response(retried).await
    }

    /// Send a request and decode the 2xx body into `T`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, SessionError> {
        let response = self.send(request).await?;
        serde_json::from_value(response.body).map_err(|e| SessionError::Decode(e.to_string()))
    }

    /// Build the outgoing request without sending it.
    pub fn build_request(
        &self,
        request: &ApiRequest,
    ) -> Result<reqwest::Request, SessionError> {
        let token = self.inner.storage.access_token();
        self.inner.build(request, token.as_deref())
    }

    /// Join the running refresh, reuse one that finished after `seen_epoch`,
    /// or start a new one. The slot lock is never held across an await.
    async fn refresh_after(&self, seen_epoch: u64) -> Result<String, SessionError> {
        let refresh = {
            let mut slot = self.inner.slot.lock();
            match slot.in_flight.clone() {
                Some(running) => running,
                None => {
                    if slot.epoch != seen_epoch {
                        if let Some(outcome) = slot.last_outcome.clone() {
                            return outcome;
                        }
                    }
                    let running = Inner::start_refresh(Arc::clone(&self.inner));
                    slot.in_flight = Some(running.clone());
                    running
                }
            }
        };
        refresh.await
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn build(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Request, SessionError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url(&request.path));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(make_form) => builder.multipart(make_form()),
            RequestBody::Bytes { data, content_type } => {
                let builder = builder.body(data.clone());
                match content_type {
                    Some(ct) => builder.header(CONTENT_TYPE, ct.as_str()),
                    None => builder,
                }
            }
        };
        builder.build().map_err(|e| SessionError::from_transport(&e))
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, SessionError> {
        let built = self.build(request, token)?;
        self.http.execute(built).await.map_err(|e| {
            let err = SessionError::from_transport(&e);
            tracing::debug!(path = %request.path, error = %err, "Request failed");
            err
        })
    }

    /// The refresh future clears the slot and records its outcome itself, so
    /// the bookkeeping happens exactly once whoever polls it.
    fn start_refresh(inner: Arc<Self>) -> RefreshFuture {
        async move {
            let outcome = inner.perform_refresh().await;
            let mut slot = inner.slot.lock();
            slot.in_flight = None;
            slot.epoch += 1;
            slot.last_outcome = Some(outcome.clone());
            outcome
        }
        .boxed()
        .shared()
    }

    async fn perform_refresh(&self) -> Result<String, SessionError> {
        let result = self.request_new_tokens().await;
        match &result {
            Ok(tokens) => {
                self.store_tokens(tokens);
                tracing::info!("Session refreshed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session refresh failed, signing out");
                self.clear_tokens();
                self.expired.send_replace(true);
            }
        }
        result.map(|tokens| tokens.access_token)
    }

    async fn request_new_tokens(&self) -> Result<TokenResponse, SessionError> {
        let Some(refresh_token) = self.storage.refresh_token() else {
            return Err(SessionError::SessionExpired(
                "No refresh token available".into(),
            ));
        };

        let request = ApiRequest::post(REFRESH_PATH)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))?;
        let response = self
            .dispatch(&request, None)
            .await
            .map_err(|e| SessionError::SessionExpired(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SessionError::SessionExpired(e.to_string()))?;
        if !status.is_success() {
            let message = match SessionError::from_status(status, &body) {
                SessionError::Unauthorized(m) | SessionError::Api { message: m, .. } => m,
                other => other.to_string(),
            };
            return Err(SessionError::SessionExpired(message));
        }

        serde_json::from_str(&body).map_err(|e| SessionError::SessionExpired(e.to_string()))
    }

    fn store_tokens(&self, tokens: &TokenResponse) {
        if let Err(e) = self
            .storage
            .set_tokens(&tokens.access_token, &tokens.refresh_token)
        {
            tracing::warn!(error = %e, "Failed to persist session tokens");
        }
    }

    fn clear_tokens(&self) {
        if let Err(e) = self.storage.clear() {
            tracing::warn!(error = %e, "Failed to clear session tokens");
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<ApiResponse, SessionError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| SessionError::from_transport(&e))?;

    if !status.is_success() {
        return Err(SessionError::from_status(status, &text));
    }

    let body = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).map_err(|e| SessionError::Decode(e.to_string()))?
    };
    Ok(ApiResponse {
        status: status.as_u16(),
        body,
    })
}
