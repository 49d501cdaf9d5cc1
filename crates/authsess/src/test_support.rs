// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: token builders, a fake API server, and
//! collaborator mocks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Form, Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::coordinator::{Navigator, RefreshCoordinator};
use crate::error::TransportError;
use crate::pipeline::ApiClient;
use crate::scheduler::{epoch_ms, TokenScheduler, DEFAULT_LEAD_TIME};
use crate::storage::MemoryStorage;
use crate::store::{CredentialStore, TokenPair, User};
use crate::transport::{ApiRequest, ApiResponse, RequestBody, Transport};

pub const EMAIL: &str = "ada@example.com";
pub const PASSWORD: &str = "correct-horse";

static NEXT_JTI: AtomicU64 = AtomicU64::new(1);

/// JWT-shaped token with the given `exp`. Every call yields a distinct token.
pub fn token_with_exp(exp: u64) -> String {
    let jti = NEXT_JTI.fetch_add(1, Ordering::Relaxed);
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({ "sub": "1", "exp": exp, "jti": jti }).to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

/// JWT-shaped token expiring `secs` from now (wall clock).
pub fn token_expiring_in(secs: u64) -> String {
    token_with_exp(epoch_ms() / 1000 + secs)
}

pub fn sample_user(id: i64, email: &str) -> User {
    User {
        id,
        email: email.to_owned(),
        full_name: Some("Ada Lovelace".to_owned()),
        avatar: None,
        is_active: true,
        created_at: Some("2026-01-01T00:00:00Z".to_owned()),
        updated_at: None,
    }
}

/// One request as the fake server saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
}

struct Account {
    user: User,
    password: String,
}

struct ApiState {
    accounts: HashMap<String, Account>,
    /// Valid access token -> account email.
    access: HashMap<String, String>,
    /// Valid refresh token -> account email.
    refresh: HashMap<String, String>,
    access_ttl: u64,
    refresh_delay: Duration,
    refresh_reject: Option<StatusCode>,
    logout_fails: bool,
    profile_fails: bool,
    offline: bool,
    seen: Vec<SeenRequest>,
}

impl ApiState {
    fn issue(&mut self, email: &str) -> TokenPair {
        let access_token = token_expiring_in(self.access_ttl);
        let refresh_token = format!("refresh-{}", NEXT_JTI.fetch_add(1, Ordering::Relaxed));
        self.access.insert(access_token.clone(), email.to_owned());
        self.refresh.insert(refresh_token.clone(), email.to_owned());
        TokenPair::new(access_token, refresh_token)
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<String, Response> {
        bearer_of(headers)
            .and_then(|token| self.access.get(&token).cloned())
            .ok_or_else(|| detail(StatusCode::UNAUTHORIZED, "Could not validate credentials"))
    }
}

/// In-process stand-in for the auth API, served by a real axum router.
#[derive(Clone)]
pub struct FakeApi {
    state: Arc<Mutex<ApiState>>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApi {
    /// One registered account ([`EMAIL`] / [`PASSWORD`]) with one-hour tokens.
    pub fn new() -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(
            EMAIL.to_owned(),
            Account { user: sample_user(1, EMAIL), password: PASSWORD.to_owned() },
        );
        Self {
            state: Arc::new(Mutex::new(ApiState {
                accounts,
                access: HashMap::new(),
                refresh: HashMap::new(),
                access_ttl: 3600,
                refresh_delay: Duration::ZERO,
                refresh_reject: None,
                logout_fails: false,
                profile_fails: false,
                offline: false,
                seen: Vec::new(),
            })),
        }
    }

    pub fn user(&self) -> User {
        sample_user(1, EMAIL)
    }

    /// Issue a valid token pair for the default account, as a login would.
    pub fn issue_tokens(&self) -> TokenPair {
        self.state.lock().issue(EMAIL)
    }

    /// Invalidate every access token issued so far.
    pub fn expire_access_tokens(&self) {
        self.state.lock().access.clear();
    }

    pub fn revoke_refresh_tokens(&self) {
        self.state.lock().refresh.clear();
    }

    pub fn is_refresh_valid(&self, refresh_token: &str) -> bool {
        self.state.lock().refresh.contains_key(refresh_token)
    }

    pub fn reject_refresh(&self, status: StatusCode) {
        self.state.lock().refresh_reject = Some(status);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.lock().refresh_delay = delay;
    }

    pub fn set_access_ttl(&self, secs: u64) {
        self.state.lock().access_ttl = secs;
    }

    pub fn fail_logout(&self) {
        self.state.lock().logout_fails = true;
    }

    pub fn fail_profile(&self) {
        self.state.lock().profile_fails = true;
    }

    /// Make the in-process transport fail every call before it reaches the server.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.state.lock().seen.clone()
    }

    /// Number of requests the server saw for `path`.
    pub fn calls(&self, path: &str) -> usize {
        self.state.lock().seen.iter().filter(|r| r.path == path).count()
    }

    /// Bearer tokens the server saw for `path`, in arrival order.
    pub fn bearers(&self, path: &str) -> Vec<Option<String>> {
        self.state.lock().seen.iter().filter(|r| r.path == path).map(|r| r.bearer.clone()).collect()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/auth/login", post(login))
            .route("/api/v1/auth/register", post(register))
            .route("/api/v1/auth/refresh", post(refresh))
            .route("/api/v1/auth/logout", post(logout))
            .route("/api/v1/auth/logout-all", post(logout_all))
            .route("/api/v1/users/me", get(me))
            .route("/api/v1/todos", get(list_todos).post(create_todo))
            .route("/api/v1/todos/{id}", patch(update_todo).delete(delete_todo))
            .route("/api/v1/always-401", get(always_unauthorized))
            .layer(middleware::from_fn_with_state(self.clone(), record))
            .with_state(self.clone())
    }

    /// Transport that dispatches straight into the router, no sockets.
    pub fn transport(&self) -> Arc<RouterTransport> {
        Arc::new(RouterTransport { api: self.clone(), router: self.router() })
    }

    /// Serve the router on a random local port.
    pub async fn spawn(&self) -> anyhow::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(addr)
    }
}

fn bearer_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_owned)
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

fn token_body(pair: &TokenPair, ttl: u64) -> Response {
    Json(json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "token_type": "bearer",
        "expires_in": ttl,
    }))
    .into_response()
}

async fn record(State(api): State<FakeApi>, req: Request, next: Next) -> Response {
    let seen = SeenRequest {
        method: req.method().clone(),
        path: req.uri().path().to_owned(),
        bearer: bearer_of(req.headers()),
    };
    api.state.lock().seen.push(seen);
    next.run(req).await
}

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(State(api): State<FakeApi>, Form(form): Form<LoginForm>) -> Response {
    let mut state = api.state.lock();
    let valid = state.accounts.get(&form.username).is_some_and(|a| a.password == form.password);
    if !valid {
        return detail(StatusCode::UNAUTHORIZED, "Incorrect email or password");
    }
    let pair = state.issue(&form.username);
    token_body(&pair, state.access_ttl)
}

#[derive(Deserialize)]
struct RegisterBody {
    email: String,
    password: String,
    full_name: Option<String>,
}

async fn register(State(api): State<FakeApi>, Json(body): Json<RegisterBody>) -> Response {
    let mut state = api.state.lock();
    if state.accounts.contains_key(&body.email) {
        return detail(StatusCode::BAD_REQUEST, "Email already registered");
    }
    if body.password.len() < 8 {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": [{ "loc": ["body", "password"], "msg": "Password too short" }] })),
        )
            .into_response();
    }
    let id = state.accounts.len() as i64 + 1;
    let mut user = sample_user(id, &body.email);
    user.full_name = body.full_name;
    state
        .accounts
        .insert(body.email, Account { user: user.clone(), password: body.password });
    (StatusCode::CREATED, Json(user)).into_response()
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn refresh(State(api): State<FakeApi>, Json(body): Json<RefreshBody>) -> Response {
    let delay = api.state.lock().refresh_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let mut state = api.state.lock();
    if let Some(status) = state.refresh_reject {
        return detail(status, "Refresh unavailable");
    }
    // Rotation: a refresh token is good for one exchange.
    let Some(email) = state.refresh.remove(&body.refresh_token) else {
        return detail(StatusCode::UNAUTHORIZED, "Invalid refresh token");
    };
    let pair = state.issue(&email);
    token_body(&pair, state.access_ttl)
}

async fn logout(State(api): State<FakeApi>, headers: HeaderMap, Json(body): Json<RefreshBody>) -> Response {
    let mut state = api.state.lock();
    if state.logout_fails {
        return detail(StatusCode::INTERNAL_SERVER_ERROR, "Logout failed");
    }
    if let Err(resp) = state.authorize(&headers) {
        return resp;
    }
    state.refresh.remove(&body.refresh_token);
    Json(json!({ "message": "Successfully logged out" })).into_response()
}

async fn logout_all(State(api): State<FakeApi>, headers: HeaderMap) -> Response {
    let mut state = api.state.lock();
    let email = match state.authorize(&headers) {
        Ok(email) => email,
        Err(resp) => return resp,
    };
    state.refresh.retain(|_, owner| *owner != email);
    state.access.retain(|_, owner| *owner != email);
    Json(json!({ "message": "Logged out from all devices" })).into_response()
}

async fn me(State(api): State<FakeApi>, headers: HeaderMap) -> Response {
    let state = api.state.lock();
    if state.profile_fails {
        return detail(StatusCode::INTERNAL_SERVER_ERROR, "Profile unavailable");
    }
    match state.authorize(&headers) {
        Ok(email) => match state.accounts.get(&email) {
            Some(account) => Json(account.user.clone()).into_response(),
            None => detail(StatusCode::NOT_FOUND, "User not found"),
        },
        Err(resp) => resp,
    }
}

async fn list_todos(State(api): State<FakeApi>, headers: HeaderMap) -> Response {
    if let Err(resp) = api.state.lock().authorize(&headers) {
        return resp;
    }
    Json(json!([{ "id": 1, "title": "write tests", "completed": false }])).into_response()
}

async fn create_todo(State(api): State<FakeApi>, headers: HeaderMap, Json(mut body): Json<Value>) -> Response {
    if let Err(resp) = api.state.lock().authorize(&headers) {
        return resp;
    }
    body["id"] = json!(2);
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn update_todo(
    State(api): State<FakeApi>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Response {
    if let Err(resp) = api.state.lock().authorize(&headers) {
        return resp;
    }
    if id != 1 {
        return detail(StatusCode::NOT_FOUND, "Todo not found");
    }
    body["id"] = json!(id);
    Json(body).into_response()
}

async fn delete_todo(State(api): State<FakeApi>, Path(id): Path<i64>, headers: HeaderMap) -> Response {
    if let Err(resp) = api.state.lock().authorize(&headers) {
        return resp;
    }
    if id != 1 {
        return detail(StatusCode::NOT_FOUND, "Todo not found");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn always_unauthorized() -> Response {
    detail(StatusCode::UNAUTHORIZED, "Not authenticated")
}

/// [`Transport`] that hands requests directly to the fake API's router.
pub struct RouterTransport {
    api: FakeApi,
    router: Router,
}

impl Transport for RouterTransport {
    fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, TransportError>> {
        async move {
            if self.api.state.lock().offline {
                return Err(TransportError("connection refused".to_owned()));
            }
            let request = to_http(request)?;
            let resp = self
                .router
                .clone()
                .oneshot(request)
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            let status = resp.status();
            let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            Ok(ApiResponse::new(status, body))
        }
        .boxed()
    }
}

fn to_http(request: ApiRequest) -> Result<axum::http::Request<Body>, TransportError> {
    let mut builder = axum::http::Request::builder().method(request.method).uri(request.path);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(request.headers);
    }
    let body = match request.body {
        RequestBody::Empty => Body::empty(),
        RequestBody::Json(value) => {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        RequestBody::Form(fields) => {
            builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
            let encoded =
                serde_urlencoded::to_string(&fields).map_err(|e| TransportError(e.to_string()))?;
            Body::from(encoded)
        }
    };
    builder.body(body).map_err(|e| TransportError(e.to_string()))
}

/// Navigator that counts invocations and optionally takes a while to finish.
#[derive(Debug, Default)]
pub struct CountingNavigator {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingNavigator {
    pub fn with_delay(delay: Duration) -> Self {
        Self { calls: AtomicU32::new(0), delay }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Navigator for CountingNavigator {
    fn navigate_to_login(&self) -> BoxFuture<'_, ()> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        .boxed()
    }
}

/// Store, coordinator and client wired against a [`FakeApi`].
pub struct Harness {
    pub api: FakeApi,
    pub storage: Arc<MemoryStorage>,
    pub store: Arc<CredentialStore>,
    pub navigator: Arc<CountingNavigator>,
    pub coordinator: Arc<RefreshCoordinator>,
    pub client: ApiClient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_navigator(CountingNavigator::default())
    }

    pub fn with_navigator(navigator: CountingNavigator) -> Self {
        let api = FakeApi::new();
        let transport: Arc<dyn Transport> = api.transport();
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(CredentialStore::new(storage.clone()));
        let navigator = Arc::new(navigator);
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            TokenScheduler::new(DEFAULT_LEAD_TIME),
            Arc::clone(&transport),
            navigator.clone(),
        );
        let client = ApiClient::new(Arc::clone(&coordinator), transport);
        Self { api, storage, store, navigator, coordinator, client }
    }

    /// Establish a session with a server-issued token pair.
    pub fn sign_in(&self) -> TokenPair {
        let pair = self.api.issue_tokens();
        self.store.login(self.api.user(), &pair);
        pair
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
