//! Integration tests for presence over the full network stack.
//!
//! These tests start a real server and connect several clients, verifying
//! presence broadcast, the snapshot a late joiner receives, and TTL expiry
//! after a client goes away.

use std::sync::Arc;
use std::time::Duration;

use pipeline_collab::{
    AwarenessUpdate, ConnectionState, PresenceRecord, ServerConfig, SyncClient, SyncEvent,
    SyncServer,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// Start a server on a free port with a short presence TTL.
async fn start_test_server(presence_ttl: Duration) -> (Arc<SyncServer>, String) {
    let config = ServerConfig::new("127.0.0.1:0")
        .with_presence_ttl(presence_ttl)
        .with_grace_period(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_secs(2));
    let server = Arc::new(SyncServer::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });
    (server, url)
}

async fn join(url: &str, room: &str, presence_id: u64) -> (SyncClient, UnboundedReceiver<SyncEvent>) {
    let mut client = SyncClient::new(url, room).with_presence_id(presence_id);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    for _ in 0..300 {
        if client.connection_state().await == ConnectionState::Synced {
            return (client, events);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client {presence_id} never synced");
}

/// Next presence update, skipping document events.
async fn next_presence(events: &mut UnboundedReceiver<SyncEvent>) -> AwarenessUpdate {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(SyncEvent::Presence(update)) => return update,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no presence update arrived")
}

#[tokio::test]
async fn test_presence_broadcast_to_peers() {
    let (server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = join(&url, "design", 1).await;
    let (_bob, mut bob_events) = join(&url, "design", 2).await;

    alice.send_presence(Some("cursor:10,20".into())).await.unwrap();

    let update = next_presence(&mut bob_events).await;
    assert_eq!(
        update.records,
        vec![PresenceRecord::update(1, 1, "cursor:10,20")]
    );

    server.shutdown_handle().shutdown();
}

#[tokio::test]
async fn test_sender_does_not_receive_own_presence() {
    let (server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, mut alice_events) = join(&url, "design", 1).await;
    let (bob, mut bob_events) = join(&url, "design", 2).await;

    alice.send_presence(Some("alice".into())).await.unwrap();
    next_presence(&mut bob_events).await;
    bob.send_presence(Some("bob".into())).await.unwrap();

    // The only presence alice sees is bob's.
    let update = next_presence(&mut alice_events).await;
    assert_eq!(update.records, vec![PresenceRecord::update(2, 1, "bob")]);

    server.shutdown_handle().shutdown();
}

#[tokio::test]
async fn test_late_joiner_receives_current_presence() {
    let (server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = join(&url, "design", 1).await;
    let (_bob, mut bob_events) = join(&url, "design", 2).await;
    alice.send_presence(Some("selecting n1".into())).await.unwrap();
    next_presence(&mut bob_events).await;

    let (_carol, mut carol_events) = join(&url, "design", 3).await;
    let snapshot = next_presence(&mut carol_events).await;
    assert_eq!(
        snapshot.records,
        vec![PresenceRecord::update(1, 1, "selecting n1")]
    );

    server.shutdown_handle().shutdown();
}

#[tokio::test]
async fn test_explicit_withdrawal() {
    let (server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = join(&url, "design", 1).await;
    let (_bob, mut bob_events) = join(&url, "design", 2).await;

    alice.send_presence(Some("here".into())).await.unwrap();
    next_presence(&mut bob_events).await;
    alice.send_presence(None).await.unwrap();

    let update = next_presence(&mut bob_events).await;
    assert_eq!(update.records, vec![PresenceRecord::removal(1, 2)]);

    server.shutdown_handle().shutdown();
}

#[tokio::test]
async fn test_presence_expires_after_disconnect() {
    let (server, url) = start_test_server(Duration::from_millis(300)).await;
    let (mut alice, _alice_events) = join(&url, "design", 1).await;
    let (_bob, mut bob_events) = join(&url, "design", 2).await;

    alice.send_presence(Some("cursor".into())).await.unwrap();
    next_presence(&mut bob_events).await;
    alice.disconnect().await;

    let removal = next_presence(&mut bob_events).await;
    assert_eq!(removal.records, vec![PresenceRecord::removal(1, 2)]);

    let room = server.registry().get("design").await.unwrap();
    assert!(room.replica().lock().await.awareness().is_empty());

    server.shutdown_handle().shutdown();
}

#[tokio::test]
async fn test_presence_isolated_between_rooms() {
    let (server, url) = start_test_server(Duration::from_secs(30)).await;
    let (alice, _alice_events) = join(&url, "room-a", 1).await;
    let (_bob, mut bob_events) = join(&url, "room-b", 2).await;
    let (_carol, mut carol_events) = join(&url, "room-a", 3).await;

    alice.send_presence(Some("in a".into())).await.unwrap();
    next_presence(&mut carol_events).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = bob_events.try_recv() {
        assert!(!matches!(event, SyncEvent::Presence(_)), "presence leaked: {event:?}");
    }

    server.shutdown_handle().shutdown();
}
