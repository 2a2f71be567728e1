//! Per-connection subscriber with a bounded mailbox.
//!
//! A [`Subscriber`] is created together with its [`Mailbox`]. The owning
//! connection keeps both: the `Arc<Subscriber>` is its identity and the
//! mailbox is where published messages arrive. The topic registry only
//! holds weak references.
//!
//! # Lifecycle
//!
//! ```text
//! Active ──begin_close──▶ Closing ──finish_close──▶ Closed
//! ```
//!
//! The mailbox sender is dropped on entering `Closing`, so no message can
//! be enqueued afterwards. The receiving side keeps draining what was
//! already queued and then observes the close.
//!
//! # Backpressure
//!
//! [`Subscriber::signal`] never blocks. A full mailbox drops the new
//! message. After `max_dropped` consecutive drops the subscriber reports
//! [`Delivery::Overloaded`] and the registry disconnects it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::Message;

/// Unique identifier of a subscriber.
pub type SubscriberId = Uuid;

/// Lifecycle state of a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Active,
    Closing,
    Closed,
}

/// Result of [`Subscriber::signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message was queued.
    Delivered,

    /// The mailbox was full and the message was discarded.
    Dropped,

    /// The subscriber is no longer active; the message was discarded.
    Inactive,

    /// The mailbox was full for too many messages in a row. The message was
    /// discarded and the subscriber should be disconnected.
    Overloaded,
}

#[derive(Debug)]
struct Inner {
    state: SubscriberState,
    sender: Option<mpsc::Sender<Arc<Message>>>,
    topics: HashSet<String>,
    consecutive_drops: u32,
}

/// A live connection's registration for receiving topic messages.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    username: String,
    max_dropped: u32,
    inner: Mutex<Inner>,
}

/// Receiving end of a subscriber's message queue.
#[derive(Debug)]
pub struct Mailbox {
    receiver: mpsc::Receiver<Arc<Message>>,
}

impl Mailbox {
    /// Waits for the next message.
    ///
    /// Returns `None` once the subscriber has been closed and every queued
    /// message has been drained. Cancel-safe.
    pub async fn poll_message(&mut self) -> Option<Arc<Message>> {
        self.receiver.recv().await
    }

    /// Returns a queued message without waiting.
    pub fn try_poll_message(&mut self) -> Option<Arc<Message>> {
        self.receiver.try_recv().ok()
    }
}

impl Subscriber {
    /// Creates an active subscriber whose mailbox holds up to `capacity`
    /// messages.
    pub fn new(username: impl Into<String>, capacity: usize, max_dropped: u32) -> (Arc<Self>, Mailbox) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let subscriber = Arc::new(Self {
            id: Uuid::new_v4(),
            username: username.into(),
            max_dropped: max_dropped.max(1),
            inner: Mutex::new(Inner {
                state: SubscriberState::Active,
                sender: Some(sender),
                topics: HashSet::new(),
                consecutive_drops: 0,
            }),
        });
        trace!(subscriber_id = %subscriber.id, capacity, "Created subscriber");
        (subscriber, Mailbox { receiver })
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SubscriberState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    /// Topics this subscriber is currently joined to.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics.iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Enqueues `message` if the subscriber is active. Never blocks.
    pub fn signal(&self, message: Arc<Message>) -> Delivery {
        let mut inner = self.lock();
        if inner.state != SubscriberState::Active {
            return Delivery::Inactive;
        }
        let Some(sender) = inner.sender.as_ref() else {
            return Delivery::Inactive;
        };

        match sender.try_send(message) {
            Ok(()) => {
                inner.consecutive_drops = 0;
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => {
                inner.consecutive_drops += 1;
                debug!(
                    subscriber_id = %self.id,
                    consecutive_drops = inner.consecutive_drops,
                    "Mailbox full, dropped message"
                );
                if inner.consecutive_drops >= self.max_dropped {
                    Delivery::Overloaded
                } else {
                    Delivery::Dropped
                }
            }
            // Receiver gone: the connection ended without closing us.
            Err(TrySendError::Closed(_)) => Delivery::Inactive,
        }
    }

    /// Records `topic` as joined. Returns `false` if the subscriber is not
    /// active, in which case nothing changes.
    pub(crate) fn add_topic(&self, topic: &str) -> bool {
        let mut inner = self.lock();
        if inner.state != SubscriberState::Active {
            return false;
        }
        inner.topics.insert(topic.to_string());
        true
    }

    pub(crate) fn remove_topic(&self, topic: &str) -> bool {
        self.lock().topics.remove(topic)
    }

    /// Takes the set of joined topics, leaving it empty.
    pub(crate) fn take_topics(&self) -> HashSet<String> {
        std::mem::take(&mut self.lock().topics)
    }

    /// Moves `Active` to `Closing` and closes the mailbox.
    ///
    /// Returns `false` if the subscriber was already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SubscriberState::Active {
            return false;
        }
        inner.state = SubscriberState::Closing;
        inner.sender = None;
        true
    }

    pub(crate) fn finish_close(&self) {
        self.lock().state = SubscriberState::Closed;
        trace!(subscriber_id = %self.id, "Subscriber closed");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
