//! HTTP route handlers for the Beeline server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /signup` - Create an account
//! - `POST /login` - Exchange a password for session cookies
//! - `POST /logout` - Revoke the current session
//! - `GET /session` - Who am I
//! - `POST /users/{username}/unlock` - Reset a locked account (admin)
//! - `GET /ws/chat/{room}` - Chat room WebSocket
//! - `GET /health` - Health check
//!
//! # Sessions
//!
//! A session is the cookie pair `username` + `auth_token`. Every
//! authenticated route checks the pair with
//! [`SessionVerifier::authenticate`]; there is no other identity carrier.
//!
//! # Example
//!
//! ```rust,no_run
//! use beeline_server::config::Config;
//! use beeline_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5961").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::rejection::WebSocketUpgradeRejection,
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::broadcast::TopicRegistry;
use crate::chat::{run_chat_connection, ChatSession};
use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::password::PasswordHasher;
use crate::rate_limit::{LoginThrottle, ThrottleDecision};
use crate::session::{AuthError, AuthenticatedUser, SessionVerifier};
use crate::store::MemoryStore;

/// Cookie carrying the claimed username.
pub const USERNAME_COOKIE: &str = "username";

/// Cookie carrying the session token.
pub const TOKEN_COOKIE: &str = "auth_token";

/// Lifetime of both session cookies, in seconds.
const COOKIE_MAX_AGE_SECS: u64 = 3600;

const MAX_ROOM_CHARS: usize = 64;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Token and password checks.
    pub verifier: SessionVerifier,

    /// Chat room membership and fan-out.
    pub registry: TopicRegistry,

    /// Per-username login throttle.
    pub throttle: LoginThrottle,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state backed by an in-memory credential store.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let verifier = SessionVerifier::new(
            Arc::new(MemoryStore::new()),
            PasswordHasher::new(),
            config.max_failed_logins,
        );
        let registry = TopicRegistry::new(config.mailbox_capacity, config.max_dropped_messages);
        let throttle = LoginThrottle::new(config.login_rate, config.login_burst);
        Self::with_components(config, verifier, registry, throttle)
    }

    /// Creates application state from explicit components.
    #[must_use]
    pub fn with_components(
        config: Config,
        verifier: SessionVerifier,
        registry: TopicRegistry,
        throttle: LoginThrottle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier,
            registry,
            throttle,
            start_time: Instant::now(),
        }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("verifier", &self.verifier)
            .field("registry", &self.registry)
            .field("throttle", &self.throttle)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/signup", post(post_signup))
        .route("/login", post(post_login))
        .route("/logout", post(post_logout))
        .route("/session", get(get_session))
        .route("/users/{username}/unlock", post(post_unlock))
        .route("/ws/chat/{room}", get(get_chat_ws))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request / Response Bodies
// ============================================================================

/// Username and password, as posted to `/login` and `/signup`.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// The identity behind a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResponse {
    pub username: String,
    pub is_admin: bool,
}

impl From<AuthenticatedUser> for UserResponse {
    fn from(user: AuthenticatedUser) -> Self {
        Self {
            username: user.username,
            is_admin: user.is_admin,
        }
    }
}

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of open chat connections.
    pub connections: usize,

    /// Number of rooms with at least one connection.
    pub rooms: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

// ============================================================================
// Session helpers
// ============================================================================

/// Finds a cookie value in the request's `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Verifies the session cookie pair on a request.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser> {
    let (Some(username), Some(token)) = (
        cookie_value(headers, USERNAME_COOKIE),
        cookie_value(headers, TOKEN_COOKIE),
    ) else {
        debug!("Request without session cookies");
        return Err(AuthError::InvalidCredentials.into());
    };
    Ok(state.verifier.authenticate(username, token)?)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AuthenticatedUser> {
    let user = authenticate(state, headers)?;
    if !user.is_admin {
        debug!(username = %user.username, "Non-admin attempted admin action");
        return Err(ServerError::forbidden("administrator privileges required"));
    }
    Ok(user)
}

fn set_cookie(name: &str, value: &str, max_age: u64) -> String {
    format!("{name}={value}; Path=/; Max-Age={max_age}; HttpOnly; SameSite=Strict")
}

/// Responds with `body` and cookies establishing the session.
fn with_session(status: StatusCode, user: UserResponse, token: &str) -> Response {
    (
        status,
        AppendHeaders([
            (header::SET_COOKIE, set_cookie(USERNAME_COOKIE, &user.username, COOKIE_MAX_AGE_SECS)),
            (header::SET_COOKIE, set_cookie(TOKEN_COOKIE, token, COOKIE_MAX_AGE_SECS)),
        ]),
        Json(user),
    )
        .into_response()
}

/// Runs a password operation on the blocking pool; argon2 is CPU-bound.
async fn run_blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| ServerError::internal(format!("password task failed: {err}")))?
        .map_err(ServerError::from)
}

fn parse_credentials(payload: std::result::Result<Json<Credentials>, JsonRejection>) -> Result<Credentials> {
    payload
        .map(|Json(credentials)| credentials)
        .map_err(|rejection| ServerError::validation(rejection.body_text()))
}

fn validate_room(room: &str) -> Result<()> {
    let valid = !room.is_empty()
        && room.chars().count() <= MAX_ROOM_CHARS
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ServerError::validation(format!(
            "room name must be 1-{MAX_ROOM_CHARS} letters, digits, '-' or '_'"
        )))
    }
}

// ============================================================================
// Account routes
// ============================================================================

/// POST /signup - Create an account.
///
/// With open signup anyone may create an account and is logged in
/// immediately. Otherwise the caller must be an administrator, and the new
/// account is created without a session.
///
/// # Responses
///
/// - `201 Created` - Account created
/// - `400 Bad Request` - Username or password has an invalid shape
/// - `401 Unauthorized` / `403 Forbidden` - Caller may not create accounts
/// - `409 Conflict` - Username taken
async fn post_signup(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<Credentials>, JsonRejection>,
) -> Result<Response> {
    let credentials = parse_credentials(payload)?;
    let max_users = state.config.max_users;
    let verifier = state.verifier.clone();
    let username = credentials.username.clone();

    if state.config.open_signup {
        let token = run_blocking(move || {
            verifier.sign_up(&credentials.username, &credentials.password, max_users)
        })
        .await?;
        info!(username = %username, "Self-service signup");
        let user = UserResponse {
            username,
            is_admin: false,
        };
        return Ok(with_session(StatusCode::CREATED, user, &token));
    }

    let admin = require_admin(&state, &headers)?;
    run_blocking(move || {
        verifier.register(&credentials.username, &credentials.password, false, max_users)
    })
    .await?;
    info!(username = %username, created_by = %admin.username, "Account created by admin");

    Ok((
        StatusCode::CREATED,
        Json(UserResponse {
            username,
            is_admin: false,
        }),
    )
        .into_response())
}

/// POST /login - Check a password and start a session.
///
/// Starting a session ends any other session of the same user.
///
/// # Responses
///
/// - `200 OK` - Session cookies set
/// - `401 Unauthorized` - Unknown user or wrong password
/// - `403 Forbidden` - Account locked
/// - `429 Too Many Requests` - Login throttled, see `Retry-After`
async fn post_login(
    State(state): State<AppState>,
    payload: std::result::Result<Json<Credentials>, JsonRejection>,
) -> Result<Response> {
    let credentials = parse_credentials(payload)?;

    if let ThrottleDecision::Throttled { retry_after_secs } =
        state.throttle.check(&credentials.username).await
    {
        return Err(ServerError::rate_limit(credentials.username, retry_after_secs));
    }

    let verifier = state.verifier.clone();
    let (user, token) =
        run_blocking(move || verifier.login(&credentials.username, &credentials.password)).await?;

    Ok(with_session(StatusCode::OK, user.into(), &token))
}

/// POST /logout - Revoke the caller's session and clear its cookies.
async fn post_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let user = authenticate(&state, &headers)?;
    state.verifier.revoke_token(&user.username);
    info!(username = %user.username, "User logged out");

    Ok((
        StatusCode::NO_CONTENT,
        AppendHeaders([
            (header::SET_COOKIE, set_cookie(USERNAME_COOKIE, "", 0)),
            (header::SET_COOKIE, set_cookie(TOKEN_COOKIE, "", 0)),
        ]),
    )
        .into_response())
}

/// GET /session - The identity behind the caller's cookies.
async fn get_session(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<UserResponse>> {
    let user = authenticate(&state, &headers)?;
    Ok(Json(user.into()))
}

/// POST /users/{username}/unlock - Reset a user's failed-login counter.
///
/// Administrators only.
async fn post_unlock(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let admin = require_admin(&state, &headers)?;
    match state.verifier.reset_failed_logins(&username) {
        Ok(()) => {
            info!(username = %username, unlocked_by = %admin.username, "Account unlocked");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(AuthError::NotFound) => Err(ServerError::not_found(format!("user '{username}' not found"))),
        Err(err) => Err(err.into()),
    }
}

// ============================================================================
// GET /ws/chat/{room} - Chat WebSocket
// ============================================================================

/// GET /ws/chat/{room} - Join a chat room.
///
/// # WebSocket Protocol
///
/// The client sends JSON frames `{"username": ..., "message": ...}`; the
/// server sends each room message as an HTML fragment appended to
/// `#chat_room`. Binary or malformed frames close the connection, and so
/// does logging out or logging in again elsewhere.
///
/// # Responses
///
/// - `101 Switching Protocols` - Joined the room
/// - `400 Bad Request` - Invalid room name or not a WebSocket request
/// - `401 Unauthorized` - Missing or invalid session cookies
async fn get_chat_ws(
    State(state): State<AppState>,
    Path(room): Path<String>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response> {
    let user = authenticate(&state, &headers)?;
    validate_room(&room)?;
    let ws = ws.map_err(|rejection| ServerError::websocket(rejection.body_text()))?;

    let token = cookie_value(&headers, TOKEN_COOKIE)
        .unwrap_or_default()
        .to_string();

    info!(username = %user.username, room = %room, "Chat client connecting");
    let registry = state.registry.clone();
    let verifier = state.verifier.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let (session, mailbox) = ChatSession::open(&registry, &user.username, &room);
        let session = session.bind_token(verifier, token);
        run_chat_connection(socket, session, mailbox).await;
    }))
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.subscriber_count(),
        rooms: state.registry.topic_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
