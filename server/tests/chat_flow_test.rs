//! End-to-end chat flow over in-memory transports.
//!
//! Two users log in, join the same room, and exchange messages. Covers
//! authentication, admission, fan-out ordering, disconnect cleanup and
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use beeline_server::broadcast::TopicRegistry;
use beeline_server::chat::{channel_transport, run_chat_connection, ChannelPeer, ChatSession, ConnectionEnd};
use beeline_server::password::PasswordHasher;
use beeline_server::session::SessionVerifier;
use beeline_server::store::MemoryStore;

const WAIT: Duration = Duration::from_secs(2);

struct Server {
    verifier: SessionVerifier,
    registry: TopicRegistry,
}

impl Server {
    fn new() -> Self {
        let verifier = SessionVerifier::new(
            Arc::new(MemoryStore::new()),
            PasswordHasher::insecure_fast(),
            3,
        );
        verifier.register("alice", "alice-password", false, 100).unwrap();
        verifier.register("bob", "bob-password", false, 100).unwrap();
        Self {
            verifier,
            registry: TopicRegistry::new(16, 4),
        }
    }

    /// Logs in, checks the cookie pair the way the HTTP layer does, and
    /// connects to `room`.
    fn connect(&self, username: &str, password: &str, room: &str) -> (ChannelPeer, JoinHandle<ConnectionEnd>) {
        let (user, token) = self.verifier.login(username, password).unwrap();
        let user = self.verifier.authenticate(&user.username, &token).unwrap();

        let (transport, peer) = channel_transport();
        let (session, mailbox) = ChatSession::open(&self.registry, &user.username, room);
        let session = session.bind_token(self.verifier.clone(), token);
        let task = tokio::spawn(run_chat_connection(transport, session, mailbox));
        (peer, task)
    }
}

fn say(peer: &ChannelPeer, username: &str, message: &str) {
    let frame = serde_json::json!({"username": username, "message": message}).to_string();
    assert!(peer.send_text(frame));
}

async fn next_line(peer: &mut ChannelPeer) -> String {
    timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for a chat line")
        .expect("connection closed")
}

#[tokio::test]
async fn alice_and_bob_share_a_room() {
    let server = Server::new();
    let (mut alice, alice_task) = server.connect("alice", "alice-password", "general");
    let (mut bob, bob_task) = server.connect("bob", "bob-password", "general");
    assert_eq!(server.registry.member_count("general"), 2);

    say(&alice, "alice", "hello bob");
    for peer in [&mut alice, &mut bob] {
        let line = next_line(peer).await;
        assert!(line.contains("alice: hello bob"), "{line}");
    }

    // Bob leaves; Alice keeps chatting without errors.
    drop(bob);
    assert_eq!(timeout(WAIT, bob_task).await.unwrap().unwrap(), ConnectionEnd::ClientClosed);
    assert_eq!(server.registry.member_count("general"), 1);

    say(&alice, "alice", "anyone there?");
    assert!(next_line(&mut alice).await.contains("alice: anyone there?"));

    drop(alice);
    assert_eq!(timeout(WAIT, alice_task).await.unwrap().unwrap(), ConnectionEnd::ClientClosed);
    assert_eq!(server.registry.topic_count(), 0);
    assert_eq!(server.registry.subscriber_count(), 0);
}

#[tokio::test]
async fn messages_arrive_in_publish_order() {
    let server = Server::new();
    let (alice, _alice_task) = server.connect("alice", "alice-password", "general");
    let (mut bob, _bob_task) = server.connect("bob", "bob-password", "general");

    let texts: Vec<String> = (0..10).map(|i| format!("message number {i}")).collect();
    for text in &texts {
        say(&alice, "alice", text);
    }

    for text in &texts {
        let line = next_line(&mut bob).await;
        assert!(line.contains(text.as_str()), "expected {text}, got {line}");
    }
}

#[tokio::test]
async fn spoofed_and_out_of_range_messages_are_dropped() {
    let server = Server::new();
    let (mut alice, _alice_task) = server.connect("alice", "alice-password", "general");
    let (mut bob, _bob_task) = server.connect("bob", "bob-password", "general");

    say(&alice, "bob", "pretending to be bob");
    say(&alice, "alice", "no");
    say(&alice, "alice", &"y".repeat(256));
    say(&alice, "alice", "abc");
    say(&alice, "alice", &"z".repeat(255));

    let short = next_line(&mut bob).await;
    assert!(short.contains("alice: abc"));
    let long = next_line(&mut bob).await;
    assert!(long.contains(&"z".repeat(255)));

    // Alice's connection is still open and she sees the same two lines.
    assert!(next_line(&mut alice).await.contains("alice: abc"));
    assert!(next_line(&mut alice).await.contains(&"z".repeat(255)));
    assert!(bob.try_recv().is_none());
}

#[tokio::test]
async fn html_in_messages_is_escaped() {
    let server = Server::new();
    let (mut alice, _alice_task) = server.connect("alice", "alice-password", "general");

    say(&alice, "alice", "<img src=x onerror=alert(1)>");
    let line = next_line(&mut alice).await;
    assert!(line.contains("&lt;img src=x onerror=alert(1)&gt;"));
    assert!(!line.contains("<img"));
}

#[tokio::test]
async fn relogin_elsewhere_ends_the_open_connection() {
    let server = Server::new();
    let (mut alice, alice_task) = server.connect("alice", "alice-password", "general");
    let (mut bob, _bob_task) = server.connect("bob", "bob-password", "general");

    say(&alice, "alice", "first device");
    assert!(next_line(&mut bob).await.contains("first device"));

    // A second login replaces the token the first connection was opened with.
    let (_, second_token) = server.verifier.login("alice", "alice-password").unwrap();
    say(&alice, "alice", "from a stale session");

    assert_eq!(timeout(WAIT, alice_task).await.unwrap().unwrap(), ConnectionEnd::SessionRevoked);
    assert!(server.verifier.verify_token("alice", &second_token));
    assert_eq!(server.registry.member_count("general"), 1);
    while let Some(line) = alice.try_recv() {
        assert!(!line.contains("from a stale session"));
    }

    // Anything published by the stale session would be ahead of this line.
    say(&bob, "bob", "still here");
    assert!(next_line(&mut bob).await.contains("bob: still here"));
}

#[tokio::test]
async fn logout_ends_the_open_connection() {
    let server = Server::new();
    let (alice, alice_task) = server.connect("alice", "alice-password", "general");
    let (mut bob, _bob_task) = server.connect("bob", "bob-password", "general");

    server.verifier.revoke_token("alice");
    say(&alice, "alice", "after logout");

    assert_eq!(timeout(WAIT, alice_task).await.unwrap().unwrap(), ConnectionEnd::SessionRevoked);
    say(&bob, "bob", "still here");
    assert!(next_line(&mut bob).await.contains("bob: still here"));
}

#[tokio::test]
async fn shutdown_closes_every_connection_and_revokes_tokens() {
    let server = Server::new();
    let (mut alice, alice_task) = server.connect("alice", "alice-password", "general");
    let (mut bob, bob_task) = server.connect("bob", "bob-password", "random");

    assert_eq!(server.registry.close_all(), 2);
    assert_eq!(server.verifier.revoke_all(), 2);

    assert_eq!(timeout(WAIT, alice_task).await.unwrap().unwrap(), ConnectionEnd::Disconnected);
    assert_eq!(timeout(WAIT, bob_task).await.unwrap().unwrap(), ConnectionEnd::Disconnected);
    assert!(timeout(WAIT, alice.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, bob.recv()).await.unwrap().is_none());
    assert_eq!(server.registry.topic_count(), 0);
}

#[tokio::test]
async fn slow_reader_does_not_hold_up_the_room() {
    // Bob's connection is never started, so nothing drains his mailbox.
    let server = Server::new();
    let (alice, _alice_task) = server.connect("alice", "alice-password", "general");
    let (stalled, _mailbox) = server.registry.create_subscriber("bob");
    server.registry.join(&stalled, "general");
    let (mut carol, _carol_task) = {
        let (transport, peer) = channel_transport();
        let (session, mailbox) = ChatSession::open(&server.registry, "carol", "general");
        (peer, tokio::spawn(run_chat_connection(transport, session, mailbox)))
    };

    for i in 0..40 {
        say(&alice, "alice", &format!("burst {i}"));
        let line = next_line(&mut carol).await;
        assert!(line.contains(&format!("burst {i}")), "{line}");
    }

    // The stalled subscriber was cut off after overflowing repeatedly.
    assert!(!stalled.is_active());
    assert_eq!(server.registry.member_count("general"), 2);
}
