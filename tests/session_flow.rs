//! End-to-end session flows between two users over the in-process relay.

use spruce_core::{
    crypto::SignatureAlgorithm,
    storage::{MemoryStore, SESSION_RECORD},
    utils::{SessionError, TransportError},
    FileStore, HandshakeState, InMemoryRelay, KeyValueStore, SessionEvent, SessionManager,
    SpruceConfig, SpruceError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn config() -> SpruceConfig {
    let mut config = SpruceConfig::default();
    config.crypto.signature = SignatureAlgorithm::Ed25519;
    config.polling.interval_ms = 20;
    config
}

async fn user(
    name: &str,
    config: &SpruceConfig,
    relay: &Arc<InMemoryRelay>,
    persistence: Arc<dyn KeyValueStore>,
) -> (SessionManager, UnboundedReceiver<SessionEvent>) {
    SessionManager::register(name, config, relay.as_ref(), persistence.clone())
        .await
        .unwrap();
    SessionManager::init(config.clone(), relay.clone(), persistence)
        .await
        .unwrap()
}

async fn pair(
    config: &SpruceConfig,
) -> (
    Arc<InMemoryRelay>,
    (SessionManager, UnboundedReceiver<SessionEvent>),
    (SessionManager, UnboundedReceiver<SessionEvent>),
) {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = user("alice", config, &relay, Arc::new(MemoryStore::new())).await;
    let bob = user("bob", config, &relay, Arc::new(MemoryStore::new())).await;
    (relay, alice, bob)
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_hello_round_trip() {
    let (_relay, (alice, mut alice_events), (bob, mut bob_events)) = pair(&config()).await;

    alice.connect("bob").await.unwrap();
    alice.send("bob", "hello").await.unwrap();
    bob.poll_once().await.unwrap();

    let received: Vec<_> = drain(&mut bob_events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::MessageReceived {
                sender, content, ..
            } => Some((sender, content)),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![("alice".to_string(), "hello".to_string())]);

    bob.send("alice", "hi alice").await.unwrap();
    alice.poll_once().await.unwrap();
    assert!(drain(&mut alice_events).iter().any(|event| matches!(
        event,
        SessionEvent::MessageReceived { content, .. } if content == "hi alice"
    )));
}

#[tokio::test]
async fn test_both_sides_derive_the_same_key() {
    let (_relay, (alice, _), (bob, _)) = pair(&config()).await;

    alice.connect("bob").await.unwrap();
    bob.poll_once().await.unwrap();

    assert_eq!(alice.status("bob"), HandshakeState::Established);
    assert_eq!(bob.status("alice"), HandshakeState::Established);
    assert_eq!(bob.current_peer().await.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_ml_dsa_handshake() {
    let mut config = config();
    config.crypto.signature = SignatureAlgorithm::MlDsa65;
    let (_relay, (alice, _), (bob, mut bob_events)) = pair(&config).await;

    alice.connect("bob").await.unwrap();
    alice.send("bob", "post-quantum").await.unwrap();

    let summary = bob.poll_once().await.unwrap();
    assert_eq!(summary.handshakes, 1);
    assert_eq!(summary.messages, 1);
    assert!(drain(&mut bob_events).iter().any(|event| matches!(
        event,
        SessionEvent::MessageReceived { content, .. } if content == "post-quantum"
    )));
}

#[tokio::test]
async fn test_flipped_ciphertext_goes_to_retry_queue() {
    let (relay, (alice, _), (bob, mut bob_events)) = pair(&config()).await;
    alice.connect("bob").await.unwrap();
    bob.poll_once().await.unwrap();
    drain(&mut bob_events);

    let packet = alice.send("bob", "hello").await.unwrap();
    relay
        .tamper_messages("bob", |queued| {
            let mut bytes = queued.ciphertext().unwrap();
            if let Some(last) = bytes.last_mut() {
                *last ^= 0x01;
            }
            queued.encrypted_content = spruce_core::utils::encoding::encode(&bytes);
        })
        .await;

    let summary = bob.poll_once().await.unwrap();
    assert_eq!(summary.messages, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(relay.pending_messages("bob").await, 0);

    let events = drain(&mut bob_events);
    let entry_id = match events.as_slice() {
        [SessionEvent::DecryptionFailed {
            message_id,
            entry_id,
            retry_count,
            ..
        }] => {
            assert_eq!(message_id, &packet.message_id);
            assert_eq!(*retry_count, 1);
            entry_id.clone()
        }
        other => panic!("unexpected events {other:?}"),
    };

    // The tampered ciphertext never authenticates, so retries only count up
    assert_eq!(bob.retry_failed(&entry_id).await.unwrap(), None);
    assert_eq!(bob.retry_failed(&entry_id).await.unwrap(), None);
    assert!(bob.retryable_messages().await.is_empty());
    assert_eq!(bob.failed_messages().await[0].retry_count, 3);

    bob.clear_failed().await.unwrap();
    assert!(bob.failed_messages().await.is_empty());
}

#[tokio::test]
async fn test_tampered_handshake_is_rejected() {
    let (relay, (alice, _), (bob, mut bob_events)) = pair(&config()).await;

    alice.connect("bob").await.unwrap();
    relay
        .tamper_handshakes("bob", |packet| {
            let mut content: serde_json::Value =
                serde_json::from_str(&packet.encrypted_content).unwrap();
            let timestamp = content["timestamp"].as_i64().unwrap();
            content["timestamp"] = serde_json::json!(timestamp - 1);
            packet.encrypted_content = content.to_string();
        })
        .await;

    let summary = bob.poll_once().await.unwrap();
    assert_eq!(summary.handshakes, 0);
    assert_eq!(bob.current_peer().await, None);
    assert_eq!(bob.status("alice"), HandshakeState::Failed);

    let events = drain(&mut bob_events);
    assert!(matches!(
        events.as_slice(),
        [SessionEvent::HandshakeFailed { peer, reason }]
            if peer == "alice" && reason.contains("signature")
    ));
}

#[tokio::test]
async fn test_messages_wait_for_a_session() {
    let (relay, (alice, _), (bob, _)) = pair(&config()).await;
    alice.connect("bob").await.unwrap();
    alice.send("bob", "early").await.unwrap();

    // Break the handshake so bob has no session when the message arrives
    relay.tamper_handshakes("bob", |packet| packet.signature.clear()).await;
    let summary = bob.poll_once().await.unwrap();
    assert_eq!(summary.messages, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(relay.pending_messages("bob").await, 1);
}

#[tokio::test]
async fn test_idle_timeout_clears_session() {
    let mut config = config();
    config.session.idle_timeout_secs = 1;
    let (_relay, (alice, mut alice_events), (_bob, _)) = pair(&config).await;

    alice.connect("bob").await.unwrap();
    assert!(alice.current_peer().await.is_some());

    let expired = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SessionEvent::SessionExpired { peer }) = alice_events.recv().await {
                return peer;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(expired, "bob");
    assert_eq!(alice.current_peer().await, None);
    assert_eq!(alice.status("bob"), HandshakeState::Idle);
    assert!(matches!(
        alice.send("bob", "too late").await,
        Err(SpruceError::Session(SessionError::NoActiveSession))
    ));
}

#[tokio::test]
async fn test_session_restored_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let relay = Arc::new(InMemoryRelay::new());

    let alice_store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let (alice, _) = user("alice", &config, &relay, alice_store).await;
    let (bob, mut bob_events) = user("bob", &config, &relay, Arc::new(MemoryStore::new())).await;

    alice.connect("bob").await.unwrap();
    bob.poll_once().await.unwrap();
    alice.teardown().await;
    drop(alice);
    assert!(dir.path().join(format!("{SESSION_RECORD}.json")).exists());

    let reopened: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let (alice, _) = SessionManager::init(config, relay.clone(), reopened)
        .await
        .unwrap();
    assert_eq!(alice.status("bob"), HandshakeState::Established);

    alice.send("bob", "still here").await.unwrap();
    bob.poll_once().await.unwrap();
    assert!(drain(&mut bob_events).iter().any(|event| matches!(
        event,
        SessionEvent::MessageReceived { content, .. } if content == "still here"
    )));
}

#[tokio::test]
async fn test_unreachable_relay() {
    let (relay, (alice, _), (bob, _)) = pair(&config()).await;
    alice.connect("bob").await.unwrap();

    relay.set_reachable(false);
    let err = bob.poll_once().await.unwrap_err();
    assert!(matches!(
        err,
        SpruceError::Transport(TransportError::Unreachable { .. })
    ));
    assert!(err.is_recoverable());

    let err = alice.send("bob", "offline").await.unwrap_err();
    assert!(err.is_recoverable());

    relay.set_reachable(true);
    assert_eq!(bob.poll_once().await.unwrap().handshakes, 1);
}

#[tokio::test]
async fn test_init_without_identity() {
    let relay = Arc::new(InMemoryRelay::new());
    let result = SessionManager::init(config(), relay, Arc::new(MemoryStore::new())).await;
    assert!(matches!(
        result.err(),
        Some(SpruceError::Session(SessionError::NoIdentity))
    ));
}

#[tokio::test]
async fn test_background_polling_stops() {
    let (relay, (alice, _), (bob, mut bob_events)) = pair(&config()).await;

    assert!(bob.start_polling());
    alice.connect("bob").await.unwrap();
    alice.send("bob", "one").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SessionEvent::MessageReceived { .. }) = bob_events.recv().await {
                break;
            }
        }
    })
    .await
    .unwrap();

    bob.stop_polling().await;
    alice.send("bob", "two").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.pending_messages("bob").await, 1);
}
