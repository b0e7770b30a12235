//! Session lifecycle and coordination.
//!
//! [`SessionManager`] owns one identity's handshake protocol, session key
//! store, secure channel and retry queue, and drives them against a relay.
//! It is created with [`SessionManager::init`] and shut down with
//! [`SessionManager::teardown`]; cloning it yields another handle to the
//! same session.

use crate::{
    crypto::{
        IdentityKeyPair, KeyEncapsulationMechanism, KeyMaterialManager, MlKem768, PublicKeyBundle,
        SignatureScheme,
    },
    session::{
        ExpiryGate, FailedMessageEntry, HandshakeProtocol, HandshakeRegistry, HandshakeState,
        RetryQueue, SecureChannel, SessionKey, SessionKeyStore,
    },
    storage::KeyValueStore,
    transport::{HandshakePacket, MessagePacket, Transport, MAX_MESSAGE_SIZE},
    utils::{
        CryptoError, HandshakeError, Result, SessionError, SpruceConfig, SpruceError,
        TransportError,
    },
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Events reported to the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session key was published
    HandshakeCompleted {
        /// Peer the session is bound to
        peer: String,
        /// Session version
        version: i64,
    },
    /// A handshake attempt failed; no session was published
    HandshakeFailed {
        /// Peer of the failed attempt
        peer: String,
        /// Why it failed
        reason: String,
    },
    /// A message was decrypted
    MessageReceived {
        /// Message id from the packet
        message_id: String,
        /// Sender's username
        sender: String,
        /// Plaintext
        content: String,
        /// Sender's timestamp
        timestamp: DateTime<Utc>,
    },
    /// A message could not be decrypted and was queued for retry
    DecryptionFailed {
        /// Message id from the packet
        message_id: String,
        /// Retry queue entry id
        entry_id: String,
        /// Failed attempts so far
        retry_count: u32,
        /// Why it failed
        reason: String,
    },
    /// The session was cleared after the idle timeout
    SessionExpired {
        /// Peer the session was bound to
        peer: String,
    },
}

/// Counts from one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Handshakes that completed
    pub handshakes: usize,
    /// Messages decrypted
    pub messages: usize,
    /// Messages queued for retry
    pub failed: usize,
}

/// Forwards idle expiry to the handshake registry and the event channel
struct ExpiryHook {
    registry: Arc<HandshakeRegistry>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ExpiryGate for ExpiryHook {
    fn may_expire(&self) -> bool {
        self.registry.may_expire()
    }

    fn expired(&self, peer: &str) {
        self.registry.expired(peer);
        if self
            .events
            .send(SessionEvent::SessionExpired {
                peer: peer.to_string(),
            })
            .is_err()
        {
            trace!("No listener for session expiry");
        }
    }
}

struct Poller {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    config: SpruceConfig,
    identity: Arc<IdentityKeyPair>,
    keys: KeyMaterialManager,
    handshake: HandshakeProtocol,
    registry: Arc<HandshakeRegistry>,
    store: SessionKeyStore,
    channel: SecureChannel,
    retry: Mutex<RetryQueue>,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<SessionEvent>,
    poll_lock: Mutex<()>,
    poller: StdMutex<Option<Poller>>,
}

/// Handle to one identity's session layer
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Generate an identity and publish its public keys
    ///
    /// Replaces any identity already stored in `persistence`.
    ///
    /// # Errors
    ///
    /// Returns a key generation, storage or transport error
    pub async fn register(
        username: &str,
        config: &SpruceConfig,
        transport: &dyn Transport,
        persistence: Arc<dyn KeyValueStore>,
    ) -> Result<PublicKeyBundle> {
        let keys = KeyMaterialManager::new(
            persistence,
            Arc::new(MlKem768),
            config.crypto.signature.scheme(),
        );
        let (bundle, _) = keys.generate_identity(username)?;
        transport.publish_keys(bundle.clone()).await?;

        info!("Registered {} ({})", username, bundle.fingerprint());
        Ok(bundle)
    }

    /// Start the session layer for the stored identity
    ///
    /// Restores a persisted session if one is still within its idle
    /// timeout, and the failed-message queue.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoIdentity` if no identity was generated,
    /// or a configuration or storage error
    pub async fn init(
        config: SpruceConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn KeyValueStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let signer = config.crypto.signature.scheme();
        Self::init_with(config, transport, persistence, Arc::new(MlKem768), signer).await
    }

    /// Like [`SessionManager::init`] with explicit primitives
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::init`]
    pub async fn init_with(
        config: SpruceConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn KeyValueStore>,
        kem: Arc<dyn KeyEncapsulationMechanism>,
        signer: Arc<dyn SignatureScheme>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;

        let keys = KeyMaterialManager::new(persistence.clone(), kem.clone(), signer.clone());
        let identity = Arc::new(keys.load()?.ok_or(SessionError::NoIdentity)?);

        let (events, receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(HandshakeRegistry::new());
        let hook: Arc<dyn ExpiryGate> = Arc::new(ExpiryHook {
            registry: registry.clone(),
            events: events.clone(),
        });
        let store = SessionKeyStore::new(
            persistence.clone(),
            config.session.idle_timeout(),
            config.session.refresh_on_activity,
            Some(hook),
        );
        let handshake = HandshakeProtocol::new(
            identity.clone(),
            kem,
            signer,
            store.clone(),
            registry.clone(),
        )
        .with_max_age(Duration::from_secs(config.session.handshake_max_age_secs));
        let channel = SecureChannel::new(config.crypto.cipher_suite, config.crypto.track_nonces);
        let retry = RetryQueue::load(persistence, config.retry.max_retries)?;

        match store.reload().await {
            Ok(Some(key)) => registry.set(key.peer(), HandshakeState::Established),
            Ok(None) => {}
            Err(e) if e.requires_reset() => {
                warn!("Persisted session discarded, a new handshake is required: {}", e);
            }
            Err(e) => return Err(e),
        }

        info!(
            "Session layer ready for {} ({}, {})",
            identity.username(),
            config.crypto.cipher_suite,
            config.crypto.signature
        );

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                identity,
                keys,
                handshake,
                registry,
                store,
                channel,
                retry: Mutex::new(retry),
                transport,
                events,
                poll_lock: Mutex::new(()),
                poller: StdMutex::new(None),
            }),
        };
        Ok((manager, receiver))
    }

    /// Local username
    pub fn username(&self) -> &str {
        self.inner.identity.username()
    }

    /// Local public keys
    pub fn public_bundle(&self) -> PublicKeyBundle {
        self.inner.identity.public_bundle()
    }

    /// Handshake state for `peer`
    pub fn status(&self, peer: &str) -> HandshakeState {
        self.inner.handshake.status(peer)
    }

    /// Peer of the current session, if any
    pub async fn current_peer(&self) -> Option<String> {
        self.inner
            .store
            .current()
            .await
            .map(|key| key.peer().to_string())
    }

    /// Open a session with `peer`
    ///
    /// Runs the initiator side of the handshake and delivers it through the
    /// relay. If delivery fails the new session is discarded.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownUser` for unregistered peers, any
    /// handshake error, or the transport's error
    pub async fn connect(&self, peer: &str) -> Result<i64> {
        let inner = &self.inner;
        if peer == self.username() {
            return Err(HandshakeError::InvalidPacket {
                reason: "cannot open a session with yourself".to_string(),
            }
            .into());
        }
        if !inner.transport.verify_user(peer).await? {
            return Err(TransportError::UnknownUser {
                username: peer.to_string(),
            }
            .into());
        }
        let peer_keys = inner.transport.get_public_keys(peer).await?;

        let message = match inner.handshake.initiate(peer, &peer_keys).await {
            Ok(message) => message,
            Err(e) => {
                error!("Handshake with {} failed: {}", peer, e);
                self.emit(SessionEvent::HandshakeFailed {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let delivered = match HandshakePacket::new(self.username(), peer, &message) {
            Ok(packet) => inner
                .transport
                .send_handshake(packet)
                .await
                .map_err(SpruceError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            warn!("Handshake to {} not delivered, discarding session: {}", peer, e);
            inner.store.clear().await?;
            inner.registry.set(peer, HandshakeState::Failed);
            return Err(e);
        }

        let version = inner
            .store
            .current()
            .await
            .map_or(message.timestamp, |key| key.version());
        self.emit(SessionEvent::HandshakeCompleted {
            peer: peer.to_string(),
            version,
        });
        Ok(version)
    }

    /// Encrypt `text` for `peer` and hand it to the relay
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoActiveSession` without a session,
    /// `SessionError::PeerMismatch` if the session is bound to someone else,
    /// an encryption error, or the transport's error
    pub async fn send(&self, peer: &str, text: &str) -> Result<MessagePacket> {
        let inner = &self.inner;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::Encryption {
                reason: format!("message exceeds {MAX_MESSAGE_SIZE} bytes"),
            }
            .into());
        }

        let key = inner
            .store
            .current()
            .await
            .ok_or(SessionError::NoActiveSession)?;
        if key.peer() != peer {
            return Err(SessionError::PeerMismatch {
                expected: key.peer().to_string(),
                actual: peer.to_string(),
            }
            .into());
        }

        let sealed = inner.channel.encrypt(text.as_bytes(), &key)?;
        let packet = MessagePacket::new(self.username(), peer, &sealed, &[]);
        inner.transport.send_message(packet.clone()).await?;
        inner.store.touch().await;

        debug!("Sent message {} to {}", packet.message_id, peer);
        Ok(packet)
    }

    /// Run one poll cycle
    ///
    /// Completes pending handshakes first, then decrypts queued messages
    /// under the resulting session. Messages that fail go to the retry
    /// queue. Without a session, messages stay on the relay.
    ///
    /// # Errors
    ///
    /// Returns the transport's error or a storage error; handshake and
    /// decryption failures are reported as events
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let inner = &self.inner;
        let _cycle = inner.poll_lock.lock().await;
        let username = self.username();
        let mut summary = PollSummary::default();

        // Handshakes are drained on receipt, so finish them before anything
        // else can fail
        for packet in inner.transport.receive_handshakes(username).await? {
            if self.accept_handshake(&packet).await {
                summary.handshakes += 1;
            }
        }

        let messages = inner.transport.receive_messages(username).await?;

        if messages.is_empty() {
            return Ok(summary);
        }
        let Some(key) = inner.store.current().await else {
            debug!("{} messages waiting for a session", messages.len());
            return Ok(summary);
        };

        for packet in messages {
            match self.open(&packet, &key) {
                Ok(content) => {
                    summary.messages += 1;
                    self.emit(SessionEvent::MessageReceived {
                        message_id: packet.message_id,
                        sender: packet.sender,
                        content,
                        timestamp: packet.timestamp,
                    });
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!("Could not decrypt message {}: {}", packet.message_id, e);
                    let message_id = packet.message_id.clone();
                    let (entry_id, retry_count) = {
                        let mut queue = inner.retry.lock().await;
                        let entry = queue.add_failed(packet, &e)?;
                        (entry.id.clone(), entry.retry_count)
                    };
                    self.emit(SessionEvent::DecryptionFailed {
                        message_id,
                        entry_id,
                        retry_count,
                        reason: e.to_string(),
                    });
                }
            }
        }

        inner.transport.clear_messages(username).await?;
        if summary.messages > 0 {
            inner.store.touch().await;
        }
        Ok(summary)
    }

    /// Retry decrypting a queued message under the current session
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoActiveSession` without a session, or a
    /// storage error
    pub async fn retry_failed(&self, entry_id: &str) -> Result<Option<String>> {
        let key = self
            .inner
            .store
            .current()
            .await
            .ok_or(SessionError::NoActiveSession)?;
        let mut queue = self.inner.retry.lock().await;
        queue.retry(entry_id, |packet| self.open(packet, &key))
    }

    /// Every queued failed message
    pub async fn failed_messages(&self) -> Vec<FailedMessageEntry> {
        self.inner.retry.lock().await.entries().to_vec()
    }

    /// Queued failed messages still below the retry cap
    pub async fn retryable_messages(&self) -> Vec<FailedMessageEntry> {
        self.inner
            .retry
            .lock()
            .await
            .retryable()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Empty the failed-message queue
    ///
    /// # Errors
    ///
    /// Returns a storage error
    pub async fn clear_failed(&self) -> Result<()> {
        self.inner.retry.lock().await.clear()
    }

    /// Start the background poll loop; returns false if already running
    pub fn start_polling(&self) -> bool {
        let mut slot = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let manager = self.clone();
        let period = self.inner.config.polling.interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.poll_once().await {
                            warn!("Poll cycle failed: {}", e);
                        }
                    }
                }
            }
            debug!("Polling stopped for {}", manager.username());
        });

        *slot = Some(Poller { stop, handle });
        info!("Polling every {:?}", period);
        true
    }

    /// Stop the background poll loop and wait for the running cycle
    pub async fn stop_polling(&self) {
        let poller = self
            .inner
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Poller { stop, handle }) = poller {
            if stop.send(true).is_err() {
                debug!("Poll loop already gone");
            }
            if let Err(e) = handle.await {
                warn!("Poll loop ended abnormally: {}", e);
            }
        }
    }

    /// Drop the current session and return to `Idle`
    ///
    /// # Errors
    ///
    /// Returns a storage error
    pub async fn reset_session(&self) -> Result<()> {
        self.inner.store.clear().await?;
        self.inner.registry.reset_all();
        info!("Session reset");
        Ok(())
    }

    /// Stop background work; persisted state is kept for the next `init`
    pub async fn teardown(&self) {
        self.stop_polling().await;
        self.inner.store.cancel_timer();
        debug!("Session layer torn down for {}", self.username());
    }

    /// Tear down and erase the session, failed messages and identity
    ///
    /// # Errors
    ///
    /// Returns a storage error
    pub async fn logout(&self) -> Result<()> {
        self.teardown().await;
        self.reset_session().await?;
        self.clear_failed().await?;
        self.inner.keys.destroy()?;
        info!("Logged out {}", self.username());
        Ok(())
    }

    /// Last-resort recovery for unrecoverable session errors
    ///
    /// For errors that require a reset, erases the session and identity so
    /// the caller can register again, and returns true. Other errors are
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns a storage error
    pub async fn recover(&self, error: &SpruceError) -> Result<bool> {
        if !error.requires_reset() {
            return Ok(false);
        }
        error!("Unrecoverable session error, erasing key material: {}", error);
        self.teardown().await;
        self.reset_session().await?;
        self.inner.keys.destroy()?;
        Ok(true)
    }

    async fn accept_handshake(&self, packet: &HandshakePacket) -> bool {
        let inner = &self.inner;
        let peer = packet.sender.as_str();

        let result = match inner.transport.get_public_keys(peer).await {
            Ok(peer_keys) => {
                inner
                    .handshake
                    .complete_with(peer, || packet.to_message(), &peer_keys)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(key) => {
                self.emit(SessionEvent::HandshakeCompleted {
                    peer: peer.to_string(),
                    version: key.version(),
                });
                true
            }
            Err(e) => {
                if e.is_security_violation() {
                    error!("Rejected handshake from {}: {}", peer, e);
                } else {
                    warn!("Handshake from {} failed: {}", peer, e);
                }
                self.emit(SessionEvent::HandshakeFailed {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn open(&self, packet: &MessagePacket, key: &SessionKey) -> Result<String> {
        let ciphertext = packet.ciphertext()?;
        let nonce = packet.nonce()?;
        let aad = packet.associated_data()?;

        let plaintext = self
            .inner
            .channel
            .decrypt_with_aad(&ciphertext, &nonce, key, &aad)?;
        String::from_utf8(plaintext).map_err(|_| {
            CryptoError::Decryption {
                reason: "plaintext is not valid UTF-8".to_string(),
            }
            .into()
        })
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("No listener for session events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519;
    use crate::storage::{MemoryStore, IDENTITY_RECORD, SESSION_RECORD};
    use crate::transport::{InMemoryRelay, TransportResult};

    fn fast_config() -> SpruceConfig {
        let mut config = SpruceConfig::default();
        config.crypto.signature = crate::crypto::SignatureAlgorithm::Ed25519;
        config.polling.interval_ms = 20;
        config
    }

    async fn user(
        name: &str,
        relay: &Arc<InMemoryRelay>,
    ) -> (
        SessionManager,
        mpsc::UnboundedReceiver<SessionEvent>,
        Arc<MemoryStore>,
    ) {
        let store = Arc::new(MemoryStore::new());
        SessionManager::register(name, &fast_config(), relay.as_ref(), store.clone())
            .await
            .unwrap();
        let (manager, events) = SessionManager::init(fast_config(), relay.clone(), store.clone())
            .await
            .unwrap();
        (manager, events, store)
    }

    #[tokio::test]
    async fn test_init_requires_identity() {
        let relay = Arc::new(InMemoryRelay::new());
        let result =
            SessionManager::init(fast_config(), relay, Arc::new(MemoryStore::new())).await;
        assert!(matches!(
            result.err(),
            Some(SpruceError::Session(SessionError::NoIdentity))
        ));
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, _) = user("alice", &relay).await;
        let (bob, mut bob_events, _) = user("bob", &relay).await;

        alice.connect("bob").await.unwrap();
        alice.send("bob", "hello").await.unwrap();

        let summary = bob.poll_once().await.unwrap();
        assert_eq!(summary.handshakes, 1);
        assert_eq!(summary.messages, 1);
        assert_eq!(relay.pending_messages("bob").await, 0);

        assert!(matches!(
            bob_events.recv().await,
            Some(SessionEvent::HandshakeCompleted { ref peer, .. }) if peer == "alice"
        ));
        match bob_events.recv().await {
            Some(SessionEvent::MessageReceived {
                sender, content, ..
            }) => {
                assert_eq!(sender, "alice");
                assert_eq!(content, "hello");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_to_unknown_user() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, store) = user("alice", &relay).await;

        let err = alice.connect("nobody").await.unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Transport(TransportError::UnknownUser { .. })
        ));
        assert!(!store.contains(SESSION_RECORD));
    }

    #[tokio::test]
    async fn test_send_requires_matching_session() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, _) = user("alice", &relay).await;
        let (_bob, _, _) = user("bob", &relay).await;

        assert!(matches!(
            alice.send("bob", "hi").await,
            Err(SpruceError::Session(SessionError::NoActiveSession))
        ));

        alice.connect("bob").await.unwrap();
        assert!(matches!(
            alice.send("carol", "hi").await,
            Err(SpruceError::Session(SessionError::PeerMismatch { .. }))
        ));
    }

    /// Relay with injectable faults
    #[derive(Default)]
    struct FaultyRelay {
        inner: InMemoryRelay,
        lose_handshakes: bool,
        inbox_failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Transport for FaultyRelay {
        async fn publish_keys(&self, bundle: PublicKeyBundle) -> TransportResult<()> {
            self.inner.publish_keys(bundle).await
        }
        async fn get_public_keys(&self, username: &str) -> TransportResult<PublicKeyBundle> {
            self.inner.get_public_keys(username).await
        }
        async fn verify_user(&self, username: &str) -> TransportResult<bool> {
            self.inner.verify_user(username).await
        }
        async fn send_handshake(&self, packet: HandshakePacket) -> TransportResult<()> {
            if self.lose_handshakes {
                return Err(TransportError::Unreachable {
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.send_handshake(packet).await
        }
        async fn receive_handshakes(&self, username: &str) -> TransportResult<Vec<HandshakePacket>> {
            self.inner.receive_handshakes(username).await
        }
        async fn send_message(&self, packet: MessagePacket) -> TransportResult<()> {
            self.inner.send_message(packet).await
        }
        async fn receive_messages(&self, username: &str) -> TransportResult<Vec<MessagePacket>> {
            use std::sync::atomic::Ordering;
            let pending = self.inbox_failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.inbox_failures.store(pending - 1, Ordering::SeqCst);
                return Err(TransportError::Unreachable {
                    reason: "inbox timed out".to_string(),
                });
            }
            self.inner.receive_messages(username).await
        }
        async fn clear_messages(&self, username: &str) -> TransportResult<()> {
            self.inner.clear_messages(username).await
        }
    }

    async fn faulty_pair(
        relay: &Arc<FaultyRelay>,
    ) -> (SessionManager, Arc<MemoryStore>, SessionManager) {
        let mut users = Vec::new();
        for name in ["alice", "bob"] {
            let store = Arc::new(MemoryStore::new());
            SessionManager::register(name, &fast_config(), relay.as_ref(), store.clone())
                .await
                .unwrap();
            let (manager, _) = SessionManager::init(fast_config(), relay.clone(), store.clone())
                .await
                .unwrap();
            users.push((manager, store));
        }
        let (bob, _) = users.pop().unwrap();
        let (alice, alice_store) = users.pop().unwrap();
        (alice, alice_store, bob)
    }

    #[tokio::test]
    async fn test_undelivered_handshake_discards_session() {
        let relay = Arc::new(FaultyRelay {
            lose_handshakes: true,
            ..FaultyRelay::default()
        });
        let (alice, store, _bob) = faulty_pair(&relay).await;

        let err = alice.connect("bob").await.unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Transport(TransportError::Unreachable { .. })
        ));
        assert_eq!(alice.current_peer().await, None);
        assert_eq!(alice.status("bob"), HandshakeState::Failed);
        assert!(!store.contains(SESSION_RECORD));
    }

    #[tokio::test]
    async fn test_inbox_failure_keeps_drained_handshakes() {
        let relay = Arc::new(FaultyRelay::default());
        let (alice, _, bob) = faulty_pair(&relay).await;

        alice.connect("bob").await.unwrap();
        relay
            .inbox_failures
            .store(1, std::sync::atomic::Ordering::SeqCst);

        let err = bob.poll_once().await.unwrap_err();
        assert!(matches!(
            err,
            SpruceError::Transport(TransportError::Unreachable { .. })
        ));
        assert_eq!(bob.status("alice"), HandshakeState::Established);
        assert_eq!(bob.current_peer().await.as_deref(), Some("alice"));

        alice.send("bob", "after the blip").await.unwrap();
        assert_eq!(bob.poll_once().await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_session_survives_restart() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, alice_store) = user("alice", &relay).await;
        let (bob, _, _) = user("bob", &relay).await;

        alice.connect("bob").await.unwrap();
        bob.poll_once().await.unwrap();
        alice.teardown().await;

        let (restarted, _) = SessionManager::init(fast_config(), relay.clone(), alice_store)
            .await
            .unwrap();
        assert_eq!(restarted.status("bob"), HandshakeState::Established);
        restarted.send("bob", "after restart").await.unwrap();

        assert_eq!(bob.poll_once().await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_polling_delivers_in_background() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, _) = user("alice", &relay).await;
        let (bob, mut bob_events, _) = user("bob", &relay).await;

        assert!(bob.start_polling());
        assert!(!bob.start_polling());

        alice.connect("bob").await.unwrap();
        alice.send("bob", "ping").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(SessionEvent::MessageReceived { content, .. }) = bob_events.recv().await {
                    return content;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, "ping");

        bob.teardown().await;
        assert!(bob.start_polling());
        bob.stop_polling().await;
    }

    #[tokio::test]
    async fn test_logout_erases_everything() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, store) = user("alice", &relay).await;
        let (_bob, _, _) = user("bob", &relay).await;
        alice.connect("bob").await.unwrap();

        alice.logout().await.unwrap();
        assert!(!store.contains(SESSION_RECORD));
        assert!(!store.contains(IDENTITY_RECORD));
        assert_eq!(alice.status("bob"), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn test_recover_only_on_reset_errors() {
        let relay = Arc::new(InMemoryRelay::new());
        let (alice, _, store) = user("alice", &relay).await;

        let transient: SpruceError = TransportError::Unreachable {
            reason: "timeout".to_string(),
        }
        .into();
        assert!(!alice.recover(&transient).await.unwrap());
        assert!(store.contains(IDENTITY_RECORD));

        let fatal: SpruceError = SessionError::Derivation {
            reason: "corrupt".to_string(),
        }
        .into();
        assert!(alice.recover(&fatal).await.unwrap());
        assert!(!store.contains(IDENTITY_RECORD));
    }

    #[tokio::test]
    async fn test_explicit_primitives() {
        let relay = Arc::new(InMemoryRelay::new());
        let store = Arc::new(MemoryStore::new());
        SessionManager::register("alice", &fast_config(), relay.as_ref(), store.clone())
            .await
            .unwrap();

        let (manager, _) = SessionManager::init_with(
            fast_config(),
            relay,
            store,
            Arc::new(MlKem768),
            Arc::new(Ed25519),
        )
        .await
        .unwrap();
        assert_eq!(manager.username(), "alice");
    }
}
