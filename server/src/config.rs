//! Server configuration module.
//!
//! Parses configuration from environment variables for the Beeline server.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORT` | 5961 | HTTP server port |
//! | `BEELINE_ADMIN_PW` | - | Seeds the `admin` account when set |
//! | `BEELINE_OPEN_SIGNUP` | false | Allow anyone to create an account |
//! | `BEELINE_MAX_FAILED_LOGINS` | 3 | Failed logins before an account locks |
//! | `BEELINE_MAX_USERS` | 100 | Maximum number of accounts |
//! | `BEELINE_MAILBOX_CAPACITY` | 64 | Queued messages per chat connection |
//! | `BEELINE_MAX_DROPPED_MESSAGES` | 16 | Consecutive drops before a slow connection is closed |
//! | `BEELINE_LOGIN_RATE` | 1.0 | Login attempts per second per username |
//! | `BEELINE_LOGIN_BURST` | 5 | Login burst size per username |

use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::broadcast::{DEFAULT_MAILBOX_CAPACITY, DEFAULT_MAX_DROPPED_MESSAGES};
use crate::session::DEFAULT_MAX_FAILED_LOGINS;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 5961;

/// Default account cap.
const DEFAULT_MAX_USERS: usize = 100;

/// Default sustained login attempts per second, per username.
const DEFAULT_LOGIN_RATE: f64 = 1.0;

/// Default login burst, per username.
const DEFAULT_LOGIN_BURST: u32 = 5;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

impl ConfigError {
    fn invalid(var: &str, message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            var: var.to_string(),
            message: message.into(),
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Password for the bootstrap `admin` account.
    pub admin_password: Option<String>,

    /// When true, anyone may sign up. Otherwise only admins create accounts.
    pub open_signup: bool,

    /// Failed logins after which an account is locked.
    pub max_failed_logins: u32,

    /// Maximum number of accounts.
    pub max_users: usize,

    /// Bounded mailbox size for each chat connection.
    pub mailbox_capacity: usize,

    /// Consecutive dropped messages before a chat connection is closed.
    pub max_dropped_messages: u32,

    /// Sustained login attempts per second, per username.
    pub login_rate: f64,

    /// Login burst size, per username.
    pub login_burst: u32,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or a value is out
    /// of range.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use beeline_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            admin_password: env::var("BEELINE_ADMIN_PW").ok().filter(|pw| !pw.is_empty()),
            open_signup: parse_bool_env("BEELINE_OPEN_SIGNUP"),
            max_failed_logins: parse_env("BEELINE_MAX_FAILED_LOGINS", DEFAULT_MAX_FAILED_LOGINS)?,
            max_users: parse_env("BEELINE_MAX_USERS", DEFAULT_MAX_USERS)?,
            mailbox_capacity: parse_env("BEELINE_MAILBOX_CAPACITY", DEFAULT_MAILBOX_CAPACITY)?,
            max_dropped_messages: parse_env(
                "BEELINE_MAX_DROPPED_MESSAGES",
                DEFAULT_MAX_DROPPED_MESSAGES,
            )?,
            login_rate: parse_env("BEELINE_LOGIN_RATE", DEFAULT_LOGIN_RATE)?,
            login_burst: parse_env("BEELINE_LOGIN_BURST", DEFAULT_LOGIN_BURST)?,
        };

        config.validate()?;

        if config.open_signup {
            warn!("BEELINE_OPEN_SIGNUP is enabled - anyone can create an account");
        }
        if config.admin_password.is_none() {
            warn!("BEELINE_ADMIN_PW is not set - no admin account will be created");
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failed_logins == 0 {
            return Err(ConfigError::ValidationError(
                "BEELINE_MAX_FAILED_LOGINS must be greater than 0".to_string(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "BEELINE_MAILBOX_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.max_dropped_messages == 0 {
            return Err(ConfigError::ValidationError(
                "BEELINE_MAX_DROPPED_MESSAGES must be greater than 0".to_string(),
            ));
        }
        if !self.login_rate.is_finite() || self.login_rate <= 0.0 {
            return Err(ConfigError::ValidationError(
                "BEELINE_LOGIN_RATE must be a positive number".to_string(),
            ));
        }
        if self.login_burst == 0 {
            return Err(ConfigError::ValidationError(
                "BEELINE_LOGIN_BURST must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            admin_password: None,
            open_signup: false,
            max_failed_logins: DEFAULT_MAX_FAILED_LOGINS,
            max_users: DEFAULT_MAX_USERS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_dropped_messages: DEFAULT_MAX_DROPPED_MESSAGES,
            login_rate: DEFAULT_LOGIN_RATE,
            login_burst: DEFAULT_LOGIN_BURST,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field(
                "admin_password",
                &self.admin_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("open_signup", &self.open_signup)
            .field("max_failed_logins", &self.max_failed_logins)
            .field("max_users", &self.max_users)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("max_dropped_messages", &self.max_dropped_messages)
            .field("login_rate", &self.login_rate)
            .field("login_burst", &self.login_burst)
            .finish()
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::invalid("PORT", "contains invalid unicode")),
    }
}

/// Parse a numeric environment variable, falling back to `default` if unset.
fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, format!("'{value}': {e}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::invalid(name, "contains invalid unicode")),
    }
}
