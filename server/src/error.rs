//! Error types for the Beeline server.
//!
//! Module-level errors ([`AuthError`], [`ConfigError`], ...) live next to
//! the code that raises them. [`ServerError`] is the top-level type returned
//! by HTTP handlers; it maps every failure to a status code and a JSON
//! [`ErrorResponse`].
//!
//! # Example
//!
//! ```rust
//! use beeline_server::error::ServerError;
//! use beeline_server::session::AuthError;
//!
//! let err: ServerError = AuthError::Locked.into();
//! assert!(err.is_client_error());
//! ```

use std::error::Error;
use std::fmt;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::ConfigError;
use crate::session::AuthError;

/// Top-level error type for the Beeline server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// Login, token or account failure.
    Auth(AuthError),

    /// Request body or parameters failed validation.
    Validation(String),

    /// Too many login attempts for one username.
    RateLimit {
        /// The throttled username.
        source: String,
        /// Number of seconds until the client can retry.
        retry_after: u64,
    },

    /// Authenticated, but not allowed to do this.
    Forbidden(String),

    /// The addressed resource does not exist.
    NotFound(String),

    /// WebSocket handshake or protocol error.
    WebSocket(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Auth(err) => write!(f, "authentication failed: {err}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::RateLimit { source, retry_after } => {
                write!(
                    f,
                    "rate limit exceeded for {source}, retry after {retry_after} seconds"
                )
            }
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::WebSocket(msg) => write!(f, "websocket error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl ServerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn rate_limit(source: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            source: source.into(),
            retry_after,
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(err) => match err {
                AuthError::NotFound | AuthError::InvalidCredentials => StatusCode::UNAUTHORIZED,
                AuthError::Locked | AuthError::UserLimit(_) => StatusCode::FORBIDDEN,
                AuthError::Validation(_) => StatusCode::BAD_REQUEST,
                AuthError::UserExists(_) => StatusCode::CONFLICT,
                AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Validation(_) | Self::WebSocket(_) => StatusCode::BAD_REQUEST,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The response body sent to the client.
    ///
    /// Unknown users and wrong passwords share one body so responses do not
    /// reveal which usernames exist. Internal details are never exposed.
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Self::Auth(err) => match err {
                AuthError::NotFound | AuthError::InvalidCredentials => {
                    ErrorResponse::new("invalid credentials").with_code("invalid_credentials")
                }
                AuthError::Locked => {
                    ErrorResponse::new("too many failed logins").with_code("account_locked")
                }
                AuthError::Validation(msg) => {
                    ErrorResponse::new(msg.clone()).with_code("validation_error")
                }
                AuthError::UserExists(_) => {
                    ErrorResponse::new("username already exists").with_code("user_exists")
                }
                AuthError::UserLimit(_) => {
                    ErrorResponse::new("maximum number of users reached").with_code("user_limit")
                }
                AuthError::Internal(_) => ErrorResponse::new("internal server error"),
            },
            Self::Validation(msg) => ErrorResponse::new(msg.clone()).with_code("validation_error"),
            Self::RateLimit { .. } => {
                ErrorResponse::new("too many login attempts").with_code("rate_limited")
            }
            Self::Forbidden(msg) => ErrorResponse::new(msg.clone()).with_code("forbidden"),
            Self::NotFound(msg) => ErrorResponse::new(msg.clone()).with_code("not_found"),
            Self::WebSocket(msg) => ErrorResponse::new(msg.clone()).with_code("websocket_error"),
            Self::Config(_) => ErrorResponse::new("server configuration error"),
            Self::Internal(_) => ErrorResponse::new("internal server error"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let mut response = (status, Json(self.to_error_response())).into_response();
        if let Self::RateLimit { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

/// JSON error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A specialized Result type for request handlers.
pub type Result<T> = std::result::Result<T, ServerError>;
