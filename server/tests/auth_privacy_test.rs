//! Privacy tests for authentication data in logs.
//!
//! Session tokens and passwords must never appear in log output, even at
//! TRACE level.
//!
//! # Test Approach
//!
//! 1. Use a custom tracing subscriber Layer to capture all log messages
//! 2. Exercise the session verifier and HTTP routes
//! 3. Verify that tokens and passwords do NOT appear in captured logs

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use beeline_server::broadcast::TopicRegistry;
use beeline_server::config::Config;
use beeline_server::password::PasswordHasher;
use beeline_server::rate_limit::LoginThrottle;
use beeline_server::routes::{create_router, AppState};
use beeline_server::session::SessionVerifier;
use beeline_server::store::{CredentialStore, MemoryStore};

const ALICE_PW: &str = "alice-Secret-Pw-91";

// ============================================================================
// Log Capture Infrastructure
// ============================================================================

/// A buffer for capturing log output during tests.
#[derive(Clone, Default)]
struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    fn get_logs(&self) -> String {
        self.logs.lock().unwrap().join("\n")
    }
}

/// A tracing Layer that captures log events for inspection.
struct CaptureLayer {
    capture: LogCapture,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);

        let message = format!(
            "[{}] {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }
}

/// A visitor that collects all event fields into a string.
#[derive(Default)]
struct StringVisitor {
    parts: Vec<String>,
}

impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.parts.push(format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.parts.push(format!("{}={}", field.name(), value));
    }
}

fn capturing_subscriber() -> (impl Subscriber + Send + Sync, LogCapture) {
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };
    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));
    (subscriber, capture)
}

/// Runs a closure with log capture at TRACE level and returns the logs.
fn with_log_capture<F, T>(test_fn: F) -> (T, String)
where
    F: FnOnce() -> T,
{
    let (subscriber, capture) = capturing_subscriber();
    let result = tracing::subscriber::with_default(subscriber, test_fn);
    (result, capture.get_logs())
}

fn assert_not_in_logs(logs: &str, value: &str, value_name: &str, context: &str) {
    assert!(
        !logs.contains(value),
        "{value_name} found in logs during {context}!\nValue: {value}\nLogs:\n{logs}"
    );
}

fn verifier() -> SessionVerifier {
    let verifier = SessionVerifier::new(
        Arc::new(MemoryStore::new()),
        PasswordHasher::insecure_fast(),
        3,
    );
    verifier.register("alice", ALICE_PW, false, 100).unwrap();
    verifier
}

// ============================================================================
// Test Cases
// ============================================================================

#[test]
fn token_not_logged_on_issue_verify_and_revoke() {
    let verifier = verifier();

    let (tokens, logs) = with_log_capture(|| {
        let first = verifier.issue_token("alice");
        let second = verifier.issue_token("alice");
        assert!(!verifier.verify_token("alice", &first));
        assert!(verifier.verify_token("alice", &second));
        assert!(!verifier.verify_token("bob", &second));
        verifier.revoke_token("alice");
        let third = verifier.issue_token("bob");
        verifier.revoke_all();
        vec![first, second, third]
    });

    assert!(!logs.is_empty(), "expected the verifier to log something");
    for token in &tokens {
        assert_not_in_logs(&logs, token, "session token", "issue/verify/revoke");
    }
}

#[test]
fn passwords_not_logged_on_failed_logins_and_lockout() {
    let verifier = verifier();
    let wrong = "wrong-Password-77";

    let (_, logs) = with_log_capture(|| {
        for _ in 0..3 {
            verifier.login("alice", wrong).unwrap_err();
        }
        // Locked, even with the right password.
        verifier.login("alice", ALICE_PW).unwrap_err();
        verifier.login("ghost", "ghost-Password-55").unwrap_err();
    });

    assert!(logs.contains("Login attempt on locked account"));
    assert_not_in_logs(&logs, wrong, "wrong password", "failed login");
    assert_not_in_logs(&logs, ALICE_PW, "password", "locked login");
    assert_not_in_logs(&logs, "ghost-Password-55", "password", "unknown user login");
}

#[test]
fn successful_login_logs_neither_password_nor_token() {
    let verifier = verifier();

    let ((_, token), logs) = with_log_capture(|| verifier.login("alice", ALICE_PW).unwrap());

    assert!(logs.contains("User logged in"));
    assert_not_in_logs(&logs, ALICE_PW, "password", "login");
    assert_not_in_logs(&logs, &token, "session token", "login");
}

#[test]
fn password_hash_not_logged_or_debug_printed() {
    let verifier = verifier();
    let record = verifier.store().find_user("alice").unwrap();

    let (_, logs) = with_log_capture(|| {
        verifier.register("bob", "bob-Secret-Pw-42", false, 100).unwrap();
        verifier.reset_failed_logins("alice").unwrap();
    });

    assert_not_in_logs(&logs, &record.password_hash, "password hash", "register");
    assert_not_in_logs(&logs, "bob-Secret-Pw-42", "password", "register");
    assert!(!format!("{record:?}").contains(&record.password_hash));
}

#[test]
fn validation_errors_do_not_echo_passwords() {
    let verifier = verifier();
    let short = "Xq7#z";

    let (result, logs) = with_log_capture(|| verifier.register("carol", short, false, 100));

    let err = result.unwrap_err();
    assert!(!err.to_string().contains(short));
    assert_not_in_logs(&logs, short, "password", "signup validation");
}

#[tokio::test]
async fn http_session_flow_does_not_leak_secrets() {
    let config = Config::default();
    let verifier = verifier();
    let state = AppState::with_components(
        config.clone(),
        verifier.clone(),
        TopicRegistry::new(config.mailbox_capacity, config.max_dropped_messages),
        LoginThrottle::new(config.login_rate, config.login_burst),
    );
    let app = create_router(state);

    let (subscriber, capture) = capturing_subscriber();
    let _guard = tracing::subscriber::set_default(subscriber);

    let body = serde_json::json!({"username": "alice", "password": ALICE_PW}).to_string();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cookie: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().split(';').next().unwrap().to_string())
        .collect();
    let token = cookie
        .iter()
        .find_map(|pair| pair.strip_prefix("auth_token="))
        .unwrap()
        .to_string();
    let cookie = cookie.join("; ");

    for uri in ["/session", "/logout"] {
        let method = if uri == "/logout" { "POST" } else { "GET" };
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success(), "{uri}: {}", response.status());
    }

    let logs = capture.get_logs();
    assert!(logs.contains("User logged out"));
    assert_not_in_logs(&logs, &token, "session token", "HTTP session flow");
    assert_not_in_logs(&logs, ALICE_PW, "password", "HTTP session flow");
}
