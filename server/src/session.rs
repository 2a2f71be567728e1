//! Session verification: token issuance and password checks with lockout.
//!
//! Every request that asserts "I am user X" is gated by
//! [`SessionVerifier::verify_token`], which compares the presented token
//! against the single live token stored for that username.
//!
//! # Token Format
//!
//! Tokens are 32 bytes of cryptographically secure random data,
//! base64-url encoded without padding, resulting in 43 character tokens.
//!
//! # Single Session Per User
//!
//! Tokens are keyed by username, so issuing a token silently evicts any
//! other live session of the same user, including ones on other devices.
//!
//! # Lockout
//!
//! Each password check is counted against the user's failed-login counter
//! before the password is compared, in one atomic store step. Once the
//! counter reaches the configured threshold the account is locked:
//! the password is no longer compared at all until an administrator calls
//! [`SessionVerifier::reset_failed_logins`]. A successful check resets the
//! counter to zero.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use beeline_server::password::PasswordHasher;
//! use beeline_server::session::SessionVerifier;
//! use beeline_server::store::MemoryStore;
//!
//! let verifier = SessionVerifier::new(
//!     Arc::new(MemoryStore::new()),
//!     PasswordHasher::insecure_fast(),
//!     3,
//! );
//!
//! let token = verifier.issue_token("alice");
//! assert!(verifier.verify_token("alice", &token));
//! assert!(!verifier.verify_token("alice", "forged"));
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::password::PasswordHasher;
use crate::store::{CredentialStore, LoginAttempt, StoreError};

/// Default lockout threshold.
pub const DEFAULT_MAX_FAILED_LOGINS: u32 = 3;

/// Size of the random token in bytes.
const TOKEN_BYTES: usize = 32;

/// Length of a base64-url encoded token.
pub const TOKEN_LENGTH: usize = 43;

/// Reserved username of the bootstrap administrator.
pub const ADMIN_USERNAME: &str = "admin";

const MIN_USERNAME_CHARS: usize = 3;
const MAX_USERNAME_CHARS: usize = 255;
const MIN_PASSWORD_BYTES: usize = 8;
const MAX_PASSWORD_BYTES: usize = 255;

/// Errors raised by session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No user exists with the given username.
    #[error("user not found")]
    NotFound,

    /// The account has too many failed logins and must be reset by an admin.
    #[error("too many failed logins")]
    Locked,

    /// The presented password or token did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A username or password does not have an acceptable shape.
    #[error("{0}")]
    Validation(String),

    /// The username is already registered.
    #[error("username '{0}' already exists")]
    UserExists(String),

    /// The configured account cap has been reached.
    #[error("maximum of {0} users reached")]
    UserLimit(usize),

    /// Hashing or storage failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound,
            StoreError::AlreadyExists(username) => Self::UserExists(username),
        }
    }
}

/// Outcome of [`SessionVerifier::check_password`] for an existing user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordCheck {
    /// The password matched; the failed-login counter was reset.
    Accepted,

    /// The password did not match; the failed-login counter was incremented.
    Rejected,

    /// The account is locked; the password was not compared.
    Locked,
}

impl PasswordCheck {
    /// Returns `true` if the password was accepted.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Returns `true` if the account is locked out.
    #[inline]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Identity established by a successful login or token check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
    pub is_admin: bool,
}

/// Issues, checks and revokes session tokens on top of a [`CredentialStore`].
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct SessionVerifier {
    store: Arc<dyn CredentialStore>,
    hasher: PasswordHasher,
    max_failed_logins: u32,
    /// Compared against when the user does not exist, so lookups of unknown
    /// usernames cost the same as real password checks.
    dummy_hash: Arc<str>,
}

impl SessionVerifier {
    /// Creates a verifier over `store` with the given lockout threshold.
    pub fn new(store: Arc<dyn CredentialStore>, hasher: PasswordHasher, max_failed_logins: u32) -> Self {
        let dummy_hash = hasher
            .hash("beeline-dummy-password")
            .unwrap_or_default();
        debug!(max_failed_logins, "Creating session verifier");
        Self {
            store,
            hasher,
            max_failed_logins,
            dummy_hash: dummy_hash.into(),
        }
    }

    /// Returns the lockout threshold.
    pub fn max_failed_logins(&self) -> u32 {
        self.max_failed_logins
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Generates a fresh token and stores it as the only live token for
    /// `username`, invalidating any previous one.
    pub fn issue_token(&self, username: &str) -> String {
        let token = generate_session_token();
        self.store.set_token(username, &token);
        trace!(username = %username, "Issued session token");
        token
    }

    /// Returns `true` iff `presented_token` is the live token of
    /// `claimed_username`.
    ///
    /// Never errors: a user without a live token simply fails verification.
    /// The comparison is constant time.
    pub fn verify_token(&self, claimed_username: &str, presented_token: &str) -> bool {
        let Some(live_token) = self.store.get_token(claimed_username) else {
            trace!(username = %claimed_username, "No live session token");
            return false;
        };

        let matches: bool = live_token
            .as_bytes()
            .ct_eq(presented_token.as_bytes())
            .into();
        if !matches {
            trace!(username = %claimed_username, "Session token mismatch");
        }
        matches
    }

    /// Deletes the live token of `username`. Idempotent.
    pub fn revoke_token(&self, username: &str) {
        self.store.delete_token(username);
        debug!(username = %username, "Revoked session token");
    }

    /// Deletes every live token, forcing all clients to log in again.
    pub fn revoke_all(&self) -> usize {
        let revoked = self.store.delete_all_tokens();
        info!(revoked, "Revoked all session tokens");
        revoked
    }

    /// Checks a password against the stored hash, enforcing lockout.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] if no such user exists. A wrong
    /// password is *not* an error; it is reported as
    /// [`PasswordCheck::Rejected`].
    pub fn check_password(&self, username: &str, password: &str) -> Result<PasswordCheck, AuthError> {
        let user = match self.store.reserve_login_attempt(username, self.max_failed_logins) {
            Ok(LoginAttempt::Reserved(user)) => user,
            Ok(LoginAttempt::Locked {
                failed_login_attempts,
            }) => {
                warn!(
                    username = %username,
                    failed_login_attempts,
                    "Login attempt on locked account"
                );
                return Ok(PasswordCheck::Locked);
            }
            Err(StoreError::NotFound(_)) => {
                let _ = self.hasher.verify(&self.dummy_hash, password);
                debug!(username = %username, "Password check for unknown user");
                return Err(AuthError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        // The attempt is already counted; only a match undoes it.
        if self.hasher.verify(&user.password_hash, password) {
            self.store.update_failed_login_attempts(username, 0)?;
            trace!(username = %username, "Password accepted");
            Ok(PasswordCheck::Accepted)
        } else {
            info!(
                username = %username,
                failed_login_attempts = user.failed_login_attempts.saturating_add(1),
                "Password rejected"
            );
            Ok(PasswordCheck::Rejected)
        }
    }

    /// Checks the password and, on success, issues a new token.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotFound`], [`AuthError::Locked`] or
    /// [`AuthError::InvalidCredentials`].
    pub fn login(&self, username: &str, password: &str) -> Result<(AuthenticatedUser, String), AuthError> {
        match self.check_password(username, password)? {
            PasswordCheck::Locked => Err(AuthError::Locked),
            PasswordCheck::Rejected => Err(AuthError::InvalidCredentials),
            PasswordCheck::Accepted => {
                let user = self.store.find_user(username).ok_or(AuthError::NotFound)?;
                let token = self.issue_token(username);
                info!(username = %username, "User logged in");
                Ok((
                    AuthenticatedUser {
                        username: user.username,
                        is_admin: user.is_admin,
                    },
                    token,
                ))
            }
        }
    }

    /// Verifies a cookie pair and returns the identity it proves.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCredentials`] if the token does not verify,
    /// [`AuthError::NotFound`] if the user row has disappeared.
    pub fn authenticate(&self, username: &str, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if username.is_empty() || !self.verify_token(username, token) {
            return Err(AuthError::InvalidCredentials);
        }
        let user = self.store.find_user(username).ok_or(AuthError::NotFound)?;
        Ok(AuthenticatedUser {
            username: user.username,
            is_admin: user.is_admin,
        })
    }

    /// Validates and stores a new account.
    ///
    /// # Errors
    ///
    /// [`AuthError::Validation`] for a bad username or password shape,
    /// [`AuthError::UserExists`], or [`AuthError::UserLimit`] when the store
    /// already holds `max_users` accounts.
    pub fn register(
        &self,
        username: &str,
        password: &str,
        is_admin: bool,
        max_users: usize,
    ) -> Result<(), AuthError> {
        validate_username(username)?;
        validate_password(password)?;
        if self.store.find_user(username).is_some() {
            return Err(AuthError::UserExists(username.to_string()));
        }
        if self.store.user_count() >= max_users {
            warn!(max_users, "Account cap reached, rejecting signup");
            return Err(AuthError::UserLimit(max_users));
        }

        let hash = self
            .hasher
            .hash(password)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        self.store.create_user(username, &hash, is_admin)?;
        info!(username = %username, is_admin, "Registered user");
        Ok(())
    }

    /// Registers a non-admin account and logs it in immediately.
    pub fn sign_up(&self, username: &str, password: &str, max_users: usize) -> Result<String, AuthError> {
        self.register(username, password, false, max_users)?;
        Ok(self.issue_token(username))
    }

    /// Creates the administrator account if it does not exist yet.
    ///
    /// Returns `true` if the account was created.
    pub fn ensure_admin(&self, password: &str) -> Result<bool, AuthError> {
        if self.store.find_user(ADMIN_USERNAME).is_some() {
            return Ok(false);
        }
        validate_password(password)?;
        let hash = self
            .hasher
            .hash(password)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        self.store.create_user(ADMIN_USERNAME, &hash, true)?;
        info!("Created administrator account");
        Ok(true)
    }

    /// Clears the failed-login counter, lifting a lockout.
    pub fn reset_failed_logins(&self, username: &str) -> Result<(), AuthError> {
        self.store.update_failed_login_attempts(username, 0)?;
        info!(username = %username, "Failed login counter reset");
        Ok(())
    }
}

impl std::fmt::Debug for SessionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVerifier")
            .field("max_failed_logins", &self.max_failed_logins)
            .finish_non_exhaustive()
    }
}

/// Checks that a username is 3–255 ASCII alphanumeric characters and not
/// the reserved administrator name.
pub fn validate_username(username: &str) -> Result<(), AuthError> {
    let len = username.chars().count();
    if !(MIN_USERNAME_CHARS..=MAX_USERNAME_CHARS).contains(&len) {
        return Err(AuthError::Validation(format!(
            "username length must be between {MIN_USERNAME_CHARS} and {MAX_USERNAME_CHARS}, got {len}"
        )));
    }
    if username == ADMIN_USERNAME {
        return Err(AuthError::Validation("invalid name".to_string()));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AuthError::Validation(format!(
            "invalid username '{username}', must only contain letters and digits"
        )));
    }
    Ok(())
}

/// Checks that a password is 8–255 bytes long.
pub fn validate_password(password: &str) -> Result<(), AuthError> {
    let len = password.len();
    if !(MIN_PASSWORD_BYTES..=MAX_PASSWORD_BYTES).contains(&len) {
        return Err(AuthError::Validation(format!(
            "password length must be between {MIN_PASSWORD_BYTES} and {MAX_PASSWORD_BYTES}, got {len}"
        )));
    }
    Ok(())
}

/// Generates a cryptographically secure session token.
fn generate_session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
