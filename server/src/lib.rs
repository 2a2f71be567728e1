//! Beeline Server - session verification and chat room fan-out.
//!
//! This crate provides the server side of Beeline:
//! - Cookie sessions backed by single-use-per-user tokens, with lockout
//!   after repeated failed logins
//! - Topic-based publish/subscribe delivering chat messages to every
//!   connection in a room
//!
//! # Architecture
//!
//! Each chat connection owns a [`subscriber::Subscriber`] with a bounded
//! mailbox. The [`broadcast::TopicRegistry`] holds weak references to the
//! subscribers joined to each room and fans out published messages without
//! ever waiting on a slow client. Nothing is persisted; credentials live in
//! a [`store::CredentialStore`].

pub mod broadcast;
pub mod chat;
pub mod config;
pub mod error;
pub mod password;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod store;
pub mod subscriber;
pub mod types;
