//! Chat message types.
//!
//! Inbound frames are parsed into a [`ChatSubmission`], checked by
//! [`admit`], and turned into an immutable [`Message`] carrying the room
//! topic and a server-stamped [`ChatMessage`]. Messages are shared between
//! subscriber mailboxes behind an `Arc`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum accepted message length in Unicode scalar values.
pub const MIN_MESSAGE_CHARS: usize = 3;

/// Maximum accepted message length in Unicode scalar values.
pub const MAX_MESSAGE_CHARS: usize = 255;

const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A chat frame as sent by the browser.
///
/// Any client-side timestamp is ignored; unknown fields are dropped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatSubmission {
    pub username: String,
    pub message: String,

    /// Opaque headers attached by the client library, passed through as-is.
    #[serde(default, rename = "HEADERS", alias = "HEADER")]
    pub headers: Option<serde_json::Value>,
}

/// A chat line after admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Renders the `"<time> - <sender>: <text>"` display line.
    pub fn display_line(&self) -> String {
        format!(
            "{} - {}: {}",
            self.timestamp.format(DISPLAY_TIME_FORMAT),
            self.username,
            self.message
        )
    }

    /// Renders the line as an out-of-band fragment appended to `#chat_room`.
    ///
    /// Sender and text are HTML-escaped.
    pub fn to_html_fragment(&self) -> String {
        format!(
            r##"<div hx-swap-oob="beforeend:#chat_room"><p>{}</p></div>"##,
            escape_html(&self.display_line())
        )
    }
}

/// An immutable message tagged with the topic it is published on.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    topic: String,
    body: ChatMessage,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: ChatMessage) -> Self {
        Self {
            topic: topic.into(),
            body,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &ChatMessage {
        &self.body
    }
}

/// Reasons a submission is refused before reaching the broadcaster.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("sender '{claimed}' does not match authenticated user '{authenticated}'")]
    SenderMismatch {
        claimed: String,
        authenticated: String,
    },

    #[error("message too short ({0} characters)")]
    TooShort(usize),

    #[error("message too long ({0} characters)")]
    TooLong(usize),
}

/// Validates a submission from `authenticated_user` and stamps it with the
/// current server time.
///
/// # Errors
///
/// Returns an [`AdmissionError`] if the claimed sender is not the
/// authenticated user or the text is outside 3–255 characters.
pub fn admit(
    submission: ChatSubmission,
    authenticated_user: &str,
    topic: &str,
) -> Result<Message, AdmissionError> {
    if submission.username != authenticated_user {
        return Err(AdmissionError::SenderMismatch {
            claimed: submission.username,
            authenticated: authenticated_user.to_string(),
        });
    }

    let len = submission.message.chars().count();
    if len < MIN_MESSAGE_CHARS {
        return Err(AdmissionError::TooShort(len));
    }
    if len > MAX_MESSAGE_CHARS {
        return Err(AdmissionError::TooLong(len));
    }

    Ok(Message::new(
        topic,
        ChatMessage {
            username: submission.username,
            message: submission.message,
            timestamp: Utc::now(),
        },
    ))
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
