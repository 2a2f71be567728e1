//! Credential storage consumed by the session verifier.
//!
//! The verifier only needs a narrow, key-value-ish view of user rows and
//! session tokens, described by the [`CredentialStore`] trait. Persistent
//! storage is a deployment concern; [`MemoryStore`] is the in-process
//! implementation used by the server binary and by tests.
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync` and make every single-row update
//! atomic. [`MemoryStore`] keeps users and tokens behind separate
//! [`RwLock`]s so token checks never wait on user-row writes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, trace};

/// Errors returned by credential store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No user row exists for the username.
    #[error("user '{0}' not found")]
    NotFound(String),

    /// A user row already exists for the username.
    #[error("user '{0}' already exists")]
    AlreadyExists(String),
}

/// A stored user identity.
///
/// The username is the unique key and never changes after creation.
#[derive(Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub failed_login_attempts: u32,
    pub is_admin: bool,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("failed_login_attempts", &self.failed_login_attempts)
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

/// Outcome of [`CredentialStore::reserve_login_attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginAttempt {
    /// The attempt was counted. Holds the row as it was before the
    /// counter was incremented.
    Reserved(UserRecord),

    /// The counter is already at the threshold; nothing was changed.
    Locked { failed_login_attempts: u32 },
}

/// Narrow storage interface over user rows and one-time auth tokens.
pub trait CredentialStore: Send + Sync {
    /// Looks up a user by username.
    fn find_user(&self, username: &str) -> Option<UserRecord>;

    /// Creates a user with a zeroed failed-login counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the username is taken.
    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<(), StoreError>;

    /// Overwrites the failed-login counter of a user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the user does not exist.
    fn update_failed_login_attempts(&self, username: &str, count: u32) -> Result<(), StoreError>;

    /// Counts a login attempt against the failed-login counter before the
    /// password is compared.
    ///
    /// The check against `max_failed` and the increment happen as one
    /// atomic step, so concurrent attempts can never compare more than
    /// `max_failed` passwords between resets.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the user does not exist.
    fn reserve_login_attempt(&self, username: &str, max_failed: u32) -> Result<LoginAttempt, StoreError>;

    /// Number of stored users.
    fn user_count(&self) -> usize;

    /// Returns the live token for a username, if any.
    fn get_token(&self, username: &str) -> Option<String>;

    /// Stores `token` as the only live token for `username`.
    fn set_token(&self, username: &str, token: &str);

    /// Deletes the live token for `username`. Missing tokens are ignored.
    fn delete_token(&self, username: &str);

    /// Deletes every live token, returning how many were removed.
    fn delete_all_tokens(&self) -> usize;
}

/// In-memory [`CredentialStore`].
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn find_user(&self, username: &str) -> Option<UserRecord> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.get(username).cloned()
    }

    fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<(), StoreError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Err(StoreError::AlreadyExists(username.to_string()));
        }

        users.insert(
            username.to_string(),
            UserRecord {
                username: username.to_string(),
                password_hash: password_hash.to_string(),
                failed_login_attempts: 0,
                is_admin,
            },
        );
        debug!(username = %username, is_admin, "Created user");
        Ok(())
    }

    fn update_failed_login_attempts(&self, username: &str, count: u32) -> Result<(), StoreError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        user.failed_login_attempts = count;
        trace!(username = %username, count, "Updated failed login attempts");
        Ok(())
    }

    fn reserve_login_attempt(&self, username: &str, max_failed: u32) -> Result<LoginAttempt, StoreError> {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let user = users
            .get_mut(username)
            .ok_or_else(|| StoreError::NotFound(username.to_string()))?;
        if user.failed_login_attempts >= max_failed {
            return Ok(LoginAttempt::Locked {
                failed_login_attempts: user.failed_login_attempts,
            });
        }

        let before = user.clone();
        user.failed_login_attempts = user.failed_login_attempts.saturating_add(1);
        trace!(username = %username, count = user.failed_login_attempts, "Reserved login attempt");
        Ok(LoginAttempt::Reserved(before))
    }

    fn user_count(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn get_token(&self, username: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        tokens.get(username).cloned()
    }

    fn set_token(&self, username: &str, token: &str) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(username.to_string(), token.to_string());
    }

    fn delete_token(&self, username: &str) {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.remove(username);
    }

    fn delete_all_tokens(&self) -> usize {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        let count = tokens.len();
        tokens.clear();
        count
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens = self.tokens.read().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("MemoryStore")
            .field("user_count", &self.user_count())
            .field("token_count", &tokens)
            .finish()
    }
}
