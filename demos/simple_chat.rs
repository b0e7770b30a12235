//! Simple chat example demonstrating the session layer.
//!
//! This example shows how to:
//! - Register two users against an in-process relay
//! - Establish a hybrid session and exchange messages
//! - Observe a tampered message landing in the retry queue
//! - Persist identity and session state with a file store

use spruce_core::{
    session::CipherSuite, FileStore, InMemoryRelay, SessionEvent, SessionManager, SpruceConfig,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("🌲 Spruce - Simple Chat Example");
    println!("===============================");

    let mut config = SpruceConfig::default();
    config.storage.data_dir = std::env::current_dir()?.join("example-data");
    config.crypto.cipher_suite = CipherSuite::ChaCha20Poly1305;
    config.polling.interval_ms = 100;
    config.ensure_directories()?;

    let relay = Arc::new(InMemoryRelay::new());

    println!("👤 Registering users...");
    let alice_store = Arc::new(FileStore::open(config.storage.data_dir.join("alice"))?);
    let bob_store = Arc::new(FileStore::open(config.storage.data_dir.join("bob"))?);
    for (name, store) in [("alice", alice_store.clone()), ("bob", bob_store.clone())] {
        let bundle = SessionManager::register(name, &config, relay.as_ref(), store).await?;
        println!("   {}: {}", name, bundle.fingerprint());
    }

    let (alice, _) = SessionManager::init(config.clone(), relay.clone(), alice_store).await?;
    let (bob, mut bob_events) = SessionManager::init(config, relay.clone(), bob_store).await?;

    println!("\n🤝 Establishing session...");
    let version = alice.connect("bob").await?;
    println!("   alice -> bob, version {}", version);

    bob.start_polling();

    println!("\n💬 Exchanging messages...");
    for text in ["Hi Bob!", "This travels under a hybrid session key."] {
        alice.send("bob", text).await?;
        wait_for_message(&mut bob_events).await;
    }

    println!("\n🧪 Tampering with a message in transit...");
    bob.stop_polling().await;
    alice.send("bob", "this one gets corrupted").await?;
    relay
        .tamper_messages("bob", |packet| {
            packet.encrypted_content = packet.encrypted_content.chars().rev().collect();
        })
        .await;
    let summary = bob.poll_once().await?;
    println!("   poll: {:?}", summary);
    for entry in bob.failed_messages().await {
        println!(
            "   queued {} (attempts: {}, error: {})",
            entry.original_packet.message_id, entry.retry_count, entry.error_description
        );
    }

    println!("\n🛑 Shutting down...");
    bob.clear_failed().await?;
    alice.teardown().await;
    bob.teardown().await;
    println!("✅ Session state kept in {}", std::env::current_dir()?.join("example-data").display());

    Ok(())
}

async fn wait_for_message(events: &mut UnboundedReceiver<SessionEvent>) {
    let received = timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::MessageReceived {
                    sender, content, ..
                } => {
                    println!("   {} -> bob: {}", sender, content);
                    return;
                }
                other => println!("   event: {:?}", other),
            }
        }
    })
    .await;

    if received.is_err() {
        println!("   ⚠️  no message within 5s");
    }
}
