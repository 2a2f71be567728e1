//! Topic registry and message fan-out.
//!
//! [`TopicRegistry`] maps topic names to the subscribers joined to them and
//! delivers published messages to every member.
//!
//! # Architecture
//!
//! - Membership is one map behind an [`RwLock`]. `join`, `leave`,
//!   `leave_all` and `disconnect` take the write lock; `publish` takes the
//!   read lock only long enough to snapshot the topic's members.
//! - Entries are [`Weak`] references. Connections own their subscribers.
//! - Delivery happens outside the lock, one non-blocking
//!   [`Subscriber::signal`] per member, so a stalled subscriber can never
//!   hold up the publisher or other subscribers.
//! - Topics with no members are removed.
//!
//! # Example
//!
//! ```rust
//! use beeline_server::broadcast::TopicRegistry;
//! use beeline_server::types::{ChatMessage, Message};
//! use chrono::Utc;
//!
//! # tokio_test::block_on(async {
//! let registry = TopicRegistry::new(16, 4);
//! let (bob, mut mailbox) = registry.create_subscriber("bob");
//! registry.join(&bob, "general");
//!
//! let report = registry.publish(Message::new(
//!     "general",
//!     ChatMessage {
//!         username: "alice".to_string(),
//!         message: "hello there".to_string(),
//!         timestamp: Utc::now(),
//!     },
//! ));
//! assert_eq!(report.delivered, 1);
//!
//! let received = mailbox.poll_message().await.unwrap();
//! assert_eq!(received.body().message, "hello there");
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard, Weak};

use tracing::{debug, info, trace, warn};

use crate::subscriber::{Delivery, Mailbox, Subscriber, SubscriberId};
use crate::types::Message;

/// Default per-subscriber mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Default number of consecutive dropped messages before a subscriber is
/// disconnected.
pub const DEFAULT_MAX_DROPPED_MESSAGES: u32 = 16;

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Members whose mailbox accepted the message.
    pub delivered: usize,

    /// Members whose mailbox was full.
    pub dropped: usize,

    /// Members that had gone inactive since the snapshot.
    pub skipped: usize,

    /// Members disconnected for chronic backpressure.
    pub disconnected: usize,
}

#[derive(Debug, Default)]
struct Membership {
    topics: HashMap<String, HashMap<SubscriberId, Weak<Subscriber>>>,
    subscribers: HashMap<SubscriberId, Weak<Subscriber>>,
}

impl Membership {
    fn remove_from_topic(&mut self, topic: &str, id: &SubscriberId) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(id).is_some();
        if members.is_empty() {
            self.topics.remove(topic);
            trace!(topic = %topic, "Removed empty topic");
        }
        removed
    }

    /// Forgets subscribers that were dropped without being disconnected.
    fn prune_dropped(&mut self) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, weak| weak.strong_count() > 0);
        self.topics.retain(|_, members| {
            members.retain(|_, weak| weak.strong_count() > 0);
            !members.is_empty()
        });
        before - self.subscribers.len()
    }
}

/// Thread-safe topic membership and broadcaster.
///
/// Cheap to clone; clones share the same membership.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    inner: Arc<RwLock<Membership>>,
    mailbox_capacity: usize,
    max_dropped: u32,
}

impl TopicRegistry {
    /// Creates a registry whose subscribers get mailboxes of
    /// `mailbox_capacity` messages and are disconnected after
    /// `max_dropped` consecutive drops.
    #[must_use]
    pub fn new(mailbox_capacity: usize, max_dropped: u32) -> Self {
        debug!(mailbox_capacity, max_dropped, "Created topic registry");
        Self {
            inner: Arc::new(RwLock::new(Membership::default())),
            mailbox_capacity,
            max_dropped,
        }
    }

    /// Creates and registers a subscriber with this registry's mailbox
    /// settings.
    pub fn create_subscriber(&self, username: &str) -> (Arc<Subscriber>, Mailbox) {
        let (subscriber, mailbox) =
            Subscriber::new(username, self.mailbox_capacity, self.max_dropped);
        {
            let mut membership = self.write();
            let pruned = membership.prune_dropped();
            if pruned > 0 {
                debug!(pruned, "Pruned dropped subscribers");
            }
            membership
                .subscribers
                .insert(subscriber.id(), Arc::downgrade(&subscriber));
        }
        debug!(
            subscriber_id = %subscriber.id(),
            username = %username,
            "Subscriber connected"
        );
        (subscriber, mailbox)
    }

    /// Registers `subscriber` under `topic`. Idempotent.
    ///
    /// Returns `false` without joining if the subscriber is no longer active.
    pub fn join(&self, subscriber: &Arc<Subscriber>, topic: &str) -> bool {
        let mut membership = self.write();
        if !subscriber.add_topic(topic) {
            debug!(subscriber_id = %subscriber.id(), topic = %topic, "Inactive subscriber cannot join");
            return false;
        }

        let weak = Arc::downgrade(subscriber);
        membership
            .subscribers
            .entry(subscriber.id())
            .or_insert_with(|| weak.clone());
        membership
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber.id(), weak);

        debug!(subscriber_id = %subscriber.id(), topic = %topic, "Joined topic");
        true
    }

    /// Removes `subscriber` from `topic`. Idempotent.
    pub fn leave(&self, subscriber: &Subscriber, topic: &str) {
        let mut membership = self.write();
        subscriber.remove_topic(topic);
        if membership.remove_from_topic(topic, &subscriber.id()) {
            debug!(subscriber_id = %subscriber.id(), topic = %topic, "Left topic");
        }
    }

    /// Removes `subscriber` from every topic it has joined.
    pub fn leave_all(&self, subscriber: &Subscriber) {
        let mut membership = self.write();
        Self::leave_all_locked(&mut membership, subscriber);
    }

    /// Closes `subscriber` and removes it from the registry.
    ///
    /// The mailbox is closed first, then the subscriber leaves every topic,
    /// then it is marked closed. Only the first call has any effect, so the
    /// connection, the publisher and shutdown may all race to call this.
    ///
    /// Returns `true` if this call performed the disconnect.
    pub fn disconnect(&self, subscriber: &Subscriber) -> bool {
        let mut membership = self.write();
        if !subscriber.begin_close() {
            return false;
        }
        Self::leave_all_locked(&mut membership, subscriber);
        membership.subscribers.remove(&subscriber.id());
        drop(membership);

        subscriber.finish_close();
        debug!(subscriber_id = %subscriber.id(), "Subscriber disconnected");
        true
    }

    /// Delivers `message` to every member of its topic.
    ///
    /// Never blocks on subscribers and never fails: members that went
    /// inactive are skipped, full mailboxes drop the message, and
    /// subscribers that keep overflowing are disconnected.
    pub fn publish(&self, message: Message) -> PublishReport {
        let message = Arc::new(message);
        let topic = message.topic();

        let (members, stale) = {
            let membership = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let Some(entries) = membership.topics.get(topic) else {
                trace!(topic = %topic, "Published to topic without members");
                return PublishReport::default();
            };

            let mut members = Vec::with_capacity(entries.len());
            let mut stale = Vec::new();
            for (id, weak) in entries {
                match weak.upgrade() {
                    Some(subscriber) => members.push(subscriber),
                    None => stale.push(*id),
                }
            }
            (members, stale)
        };

        let mut report = PublishReport::default();
        let mut overloaded = Vec::new();
        for subscriber in members {
            match subscriber.signal(Arc::clone(&message)) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Inactive => report.skipped += 1,
                Delivery::Overloaded => {
                    report.dropped += 1;
                    overloaded.push(subscriber);
                }
            }
        }

        for subscriber in overloaded {
            warn!(
                subscriber_id = %subscriber.id(),
                username = %subscriber.username(),
                "Disconnecting subscriber for backpressure"
            );
            if self.disconnect(&subscriber) {
                report.disconnected += 1;
            }
        }

        if !stale.is_empty() {
            let mut membership = self.write();
            for id in &stale {
                membership.remove_from_topic(topic, id);
                membership.subscribers.remove(id);
            }
            debug!(topic = %topic, pruned = stale.len(), "Pruned dropped subscribers");
        }

        trace!(
            topic = %topic,
            delivered = report.delivered,
            dropped = report.dropped,
            skipped = report.skipped,
            "Published message"
        );
        report
    }

    /// Disconnects every registered subscriber. Used during shutdown.
    pub fn close_all(&self) -> usize {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut membership = self.write();
            membership.prune_dropped();
            membership
                .subscribers
                .values()
                .filter_map(Weak::upgrade)
                .collect()
        };

        let closed = subscribers
            .iter()
            .filter(|subscriber| self.disconnect(subscriber))
            .count();
        info!(closed, "Closed all subscribers");
        closed
    }

    /// Number of registered, live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let membership = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        membership
            .subscribers
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of topics with at least one member.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .len()
    }

    /// Number of members of `topic`.
    #[must_use]
    pub fn member_count(&self, topic: &str) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topics
            .get(topic)
            .map_or(0, HashMap::len)
    }

    fn leave_all_locked(membership: &mut Membership, subscriber: &Subscriber) {
        let topics = subscriber.take_topics();
        for topic in &topics {
            membership.remove_from_topic(topic, &subscriber.id());
        }
        if !topics.is_empty() {
            debug!(
                subscriber_id = %subscriber.id(),
                topic_count = topics.len(),
                "Left all topics"
            );
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Membership> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY, DEFAULT_MAX_DROPPED_MESSAGES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::SubscriberState;
    use crate::types::ChatMessage;
    use chrono::Utc;
    use std::time::Duration;

    fn chat(topic: &str, text: &str) -> Message {
        Message::new(
            topic,
            ChatMessage {
                username: "alice".to_string(),
                message: text.to_string(),
                timestamp: Utc::now(),
            },
        )
    }

    #[tokio::test]
    async fn publish_reaches_every_member_in_order() {
        let registry = TopicRegistry::default();
        let (s1, mut m1) = registry.create_subscriber("bob");
        let (s2, mut m2) = registry.create_subscriber("carol");
        registry.join(&s1, "general");
        registry.join(&s2, "general");

        for text in ["first", "second", "third"] {
            assert_eq!(registry.publish(chat("general", text)).delivered, 2);
        }

        for mailbox in [&mut m1, &mut m2] {
            for expected in ["first", "second", "third"] {
                let msg = mailbox.poll_message().await.unwrap();
                assert_eq!(msg.body().message, expected);
                assert_eq!(msg.topic(), "general");
            }
        }
    }

    #[tokio::test]
    async fn publish_only_reaches_the_topic() {
        let registry = TopicRegistry::default();
        let (general, mut general_box) = registry.create_subscriber("bob");
        let (random, mut random_box) = registry.create_subscriber("carol");
        registry.join(&general, "general");
        registry.join(&random, "random");

        registry.publish(chat("general", "hello"));

        assert_eq!(general_box.poll_message().await.unwrap().body().message, "hello");
        assert!(random_box.try_poll_message().is_none());
    }

    #[test]
    fn publish_to_unknown_topic_is_empty_report() {
        let registry = TopicRegistry::default();
        assert_eq!(registry.publish(chat("nowhere", "echo")), PublishReport::default());
    }

    #[test]
    fn join_is_idempotent() {
        let registry = TopicRegistry::default();
        let (bob, mut mailbox) = registry.create_subscriber("bob");

        assert!(registry.join(&bob, "general"));
        assert!(registry.join(&bob, "general"));
        assert_eq!(registry.member_count("general"), 1);

        assert_eq!(registry.publish(chat("general", "once")).delivered, 1);
        assert!(mailbox.try_poll_message().is_some());
        assert!(mailbox.try_poll_message().is_none());
    }

    #[test]
    fn leave_is_idempotent_and_removes_empty_topic() {
        let registry = TopicRegistry::default();
        let (bob, _mailbox) = registry.create_subscriber("bob");
        registry.join(&bob, "general");

        registry.leave(&bob, "general");
        registry.leave(&bob, "general");
        registry.leave(&bob, "never-joined");

        assert_eq!(registry.member_count("general"), 0);
        assert_eq!(registry.topic_count(), 0);
        assert!(bob.topics().is_empty());
    }

    #[test]
    fn leave_all_stops_delivery() {
        let registry = TopicRegistry::default();
        let (bob, mut mailbox) = registry.create_subscriber("bob");
        registry.join(&bob, "general");
        registry.join(&bob, "random");

        registry.leave_all(&bob);

        let report = registry.publish(chat("general", "anyone?"));
        assert_eq!(report, PublishReport::default());
        registry.publish(chat("random", "anyone?"));
        assert!(mailbox.try_poll_message().is_none());
        assert_eq!(registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_mailbox_and_is_exactly_once() {
        let registry = TopicRegistry::default();
        let (bob, mut mailbox) = registry.create_subscriber("bob");
        registry.join(&bob, "general");
        assert_eq!(registry.subscriber_count(), 1);

        assert!(registry.disconnect(&bob));
        assert!(!registry.disconnect(&bob));

        assert_eq!(bob.state(), SubscriberState::Closed);
        assert_eq!(registry.subscriber_count(), 0);
        assert_eq!(registry.member_count("general"), 0);
        assert!(!registry.join(&bob, "general"));

        let report = registry.publish(chat("general", "gone"));
        assert_eq!(report.delivered, 0);
        assert!(mailbox.poll_message().await.is_none());
    }

    #[test]
    fn dropped_subscriber_is_pruned_on_publish() {
        let registry = TopicRegistry::default();
        let (bob, mailbox) = registry.create_subscriber("bob");
        registry.join(&bob, "general");
        drop(mailbox);
        drop(bob);

        let report = registry.publish(chat("general", "hello?"));
        assert_eq!(report, PublishReport::default());
        assert_eq!(registry.topic_count(), 0);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_dropped_before_joining_is_forgotten() {
        let registry = TopicRegistry::default();
        let (orphan, _mailbox) = registry.create_subscriber("alice");
        drop(orphan);

        let (bob, _bob_mailbox) = registry.create_subscriber("bob");
        assert_eq!(registry.write().subscribers.len(), 1);

        drop(bob);
        assert_eq!(registry.close_all(), 0);
        assert!(registry.write().subscribers.is_empty());
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn stalled_subscriber_is_disconnected_without_starving_others() {
        let registry = TopicRegistry::new(2, 3);
        let (stalled, mut stalled_box) = registry.create_subscriber("stalled");
        let (healthy, mut healthy_box) = registry.create_subscriber("healthy");
        registry.join(&stalled, "general");
        registry.join(&healthy, "general");

        let mut disconnected = 0;
        for i in 0..10 {
            let report = registry.publish(chat("general", &format!("msg {i}")));
            disconnected += report.disconnected;
            // The healthy subscriber keeps up.
            assert_eq!(
                healthy_box.try_poll_message().unwrap().body().message,
                format!("msg {i}")
            );
        }

        assert_eq!(disconnected, 1);
        assert_eq!(stalled.state(), SubscriberState::Closed);
        assert_eq!(registry.member_count("general"), 1);
        assert!(healthy.is_active());

        // The stalled subscriber still drains what it had queued, then ends.
        assert_eq!(stalled_box.try_poll_message().unwrap().body().message, "msg 0");
        assert_eq!(stalled_box.try_poll_message().unwrap().body().message, "msg 1");
        assert!(stalled_box.try_poll_message().is_none());
    }

    #[tokio::test]
    async fn close_all_ends_every_mailbox() {
        let registry = TopicRegistry::default();
        let (bob, mut bob_box) = registry.create_subscriber("bob");
        let (carol, mut carol_box) = registry.create_subscriber("carol");
        registry.join(&bob, "general");
        registry.join(&carol, "random");

        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.subscriber_count(), 0);
        assert_eq!(registry.topic_count(), 0);

        let bob_end = tokio::time::timeout(Duration::from_secs(1), bob_box.poll_message()).await;
        let carol_end =
            tokio::time::timeout(Duration::from_secs(1), carol_box.poll_message()).await;
        assert!(matches!(bob_end, Ok(None)));
        assert!(matches!(carol_end, Ok(None)));
    }

    #[tokio::test]
    async fn concurrent_publish_and_disconnect() {
        let registry = TopicRegistry::new(1024, 1024);
        let mut subscribers = Vec::new();
        for i in 0..20 {
            let (subscriber, mailbox) = registry.create_subscriber(&format!("user{i}"));
            registry.join(&subscriber, "general");
            subscribers.push((subscriber, mailbox));
        }

        let publisher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    registry.publish(chat("general", &format!("msg {i}")));
                    tokio::task::yield_now().await;
                }
            })
        };

        let closer = {
            let registry = registry.clone();
            let handles: Vec<Arc<Subscriber>> =
                subscribers.iter().map(|(s, _)| Arc::clone(s)).collect();
            tokio::spawn(async move {
                for subscriber in handles {
                    registry.disconnect(&subscriber);
                    tokio::task::yield_now().await;
                }
            })
        };

        publisher.await.unwrap();
        closer.await.unwrap();

        assert_eq!(registry.subscriber_count(), 0);
        assert_eq!(registry.topic_count(), 0);
        for (subscriber, mut mailbox) in subscribers {
            assert_eq!(subscriber.state(), SubscriberState::Closed);
            // Everything queued is in publish order and the mailbox ends.
            let mut last = None;
            while let Some(msg) = mailbox.poll_message().await {
                let n: usize = msg.body().message["msg ".len()..].parse().unwrap();
                assert!(last.map_or(true, |prev| n > prev));
                last = Some(n);
            }
        }
    }
}
