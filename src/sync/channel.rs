//! Push Channel - Sync Status Message Stream
//!
//! Persistent server-to-client stream delivering sync updates without
//! polling. Explicit pub/sub service object (no ambient singleton):
//! - Injectable transport (`PushTransport`), WebSocket in production
//! - Broadcast fan-out: every subscriber receives every frame
//! - Auto-reconnect with capped backoff; gives up after a configured
//!   number of attempts and reports `Exhausted` (degraded mode)
//! - `subscribe`/`unsubscribe`/`connect`/`disconnect` are the only
//!   mutation surface

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::models::PushMessage;

/// Channel configuration.
///
/// Reconnect delay is `backoff_step_secs * attempt`, capped at
/// `max_backoff_secs`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChannelConfig {
    pub max_attempts: u32,
    pub backoff_step_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step_secs: 2,
            max_backoff_secs: 30,
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; live updates stop until a fresh
    /// `connect()`.
    Exhausted,
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel is already connected")]
    AlreadyConnected,
}

/// Stream of raw text frames from one transport connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Duplex transport the channel runs over.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Establish one connection and return its frame stream. Called again
    /// for every reconnect attempt.
    async fn connect(&self) -> Result<FrameStream, ChannelError>;
}

/// WebSocket transport against a well-known endpoint path.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self) -> Result<FrameStream, ChannelError> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let frames = ws.filter_map(|msg| {
            futures::future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                // Binary/ping/pong frames are not part of the contract.
                Ok(Message::Close(_)) => None,
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            })
        });

        Ok(Box::pin(frames))
    }
}

// ============================================================================
// Push Channel
// ============================================================================

struct ChannelInner {
    transport: Arc<dyn PushTransport>,
    config: ChannelConfig,
    subscribers: RwLock<HashMap<Uuid, mpsc::UnboundedSender<PushMessage>>>,
    state_tx: watch::Sender<ChannelState>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared broadcast channel for push messages.
///
/// Clones share the underlying connection; many subscribe/unsubscribe cycles
/// do not touch it. Only `disconnect()` tears the connection down.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<ChannelInner>,
}

impl PushChannel {
    pub fn new(transport: Arc<dyn PushTransport>, config: ChannelConfig) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                config,
                subscribers: RwLock::new(HashMap::new()),
                state_tx,
                running: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    /// Start the connection loop.
    pub fn connect(&self) -> Result<(), ChannelError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChannelError::AlreadyConnected);
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            run_loop(inner).await;
        });

        *self.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Tear the connection down. Subscribers stay registered.
    pub fn disconnect(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.inner.state_tx.send_replace(ChannelState::Disconnected);
        log::info!("Push channel disconnected");
    }

    /// Register a subscriber. Every subscriber receives every frame.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        Subscription {
            id,
            rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Does not close the connection even when it was
    /// the last one.
    pub fn unsubscribe(&self, id: Uuid) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    /// Watch connection state changes (degraded-mode indicators).
    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }
}

/// One subscriber's view of the channel.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<PushMessage>,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next pushed message, or `None` once unsubscribed from a dropped
    /// channel.
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PushMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner
                .subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

// ============================================================================
// Connection Loop
// ============================================================================

async fn run_loop(inner: Arc<ChannelInner>) {
    let mut attempt: u32 = 0;

    loop {
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        if attempt == 0 {
            inner.state_tx.send_replace(ChannelState::Connecting);
        }

        match inner.transport.connect().await {
            Ok(mut frames) => {
                attempt = 0;
                inner.state_tx.send_replace(ChannelState::Connected);
                log::info!("Push channel connected");

                while let Some(frame) = frames.next().await {
                    if !inner.running.load(Ordering::Acquire) {
                        break;
                    }
                    match frame {
                        Ok(text) => dispatch(&inner, &text),
                        Err(e) => {
                            log::warn!("Push channel read error: {}", e);
                            break;
                        }
                    }
                }

                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                log::warn!("Push channel connection lost");
            }
            Err(e) => {
                log::warn!("Push channel connect failed: {}", e);
            }
        }

        attempt += 1;
        if attempt > inner.config.max_attempts {
            log::error!(
                "Push channel gave up after {} reconnect attempts",
                inner.config.max_attempts
            );
            inner.state_tx.send_replace(ChannelState::Exhausted);
            inner.running.store(false, Ordering::Release);
            break;
        }

        let delay_secs =
            (inner.config.backoff_step_secs * attempt as u64).min(inner.config.max_backoff_secs);
        inner
            .state_tx
            .send_replace(ChannelState::Reconnecting { attempt });
        log::info!(
            "Push channel reconnecting in {}s (attempt {}/{})",
            delay_secs,
            attempt,
            inner.config.max_attempts
        );
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    }
}

/// Parse one frame and fan it out to every live subscriber.
fn dispatch(inner: &ChannelInner, raw: &str) {
    let message: PushMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(e) => {
            // Unknown payloads are tolerated; the contract only requires a
            // `type` field.
            log::debug!("Ignoring unparseable push frame: {}", e);
            return;
        }
    };

    let mut dead = Vec::new();
    {
        let subscribers = inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for (id, tx) in subscribers.iter() {
            if tx.send(message.clone()).is_err() {
                dead.push(*id);
            }
        }
    }

    if !dead.is_empty() {
        let mut subscribers = inner.subscribers.write().unwrap_or_else(|e| e.into_inner());
        for id in dead {
            subscribers.remove(&id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: each `connect()` consumes the next script entry.
    struct MockTransport {
        scripts: Mutex<VecDeque<Result<Vec<String>, ChannelError>>>,
    }

    impl MockTransport {
        fn new(scripts: Vec<Result<Vec<String>, ChannelError>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl PushTransport for MockTransport {
        async fn connect(&self) -> Result<FrameStream, ChannelError> {
            let next = self
                .scripts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match next {
                Some(Ok(frames)) => {
                    let stream =
                        futures::stream::iter(frames.into_iter().map(Ok).collect::<Vec<_>>());
                    // Keep the connection open after the scripted frames so
                    // the loop does not immediately reconnect.
                    Ok(Box::pin(stream.chain(futures::stream::pending())))
                }
                Some(Err(e)) => Err(e),
                None => Err(ChannelError::Transport("script exhausted".to_string())),
            }
        }
    }

    fn frame(entity_id: &str, status: &str) -> String {
        format!(
            r#"{{"type":"sync_update","entity_type":"task","entity_id":"{}","status":"{}"}}"#,
            entity_id, status
        )
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_frame() {
        let transport = MockTransport::new(vec![Ok(vec![frame("T1", "pending")])]);
        let channel = PushChannel::new(transport, ChannelConfig::default());

        let mut sub_a = channel.subscribe();
        let mut sub_b = channel.subscribe();
        channel.connect().unwrap();

        let got_a = sub_a.recv().await.unwrap();
        let got_b = sub_b.recv().await.unwrap();
        assert_eq!(got_a.entity_id.as_deref(), Some("T1"));
        assert_eq!(got_b.entity_id.as_deref(), Some("T1"));

        channel.disconnect();
    }

    #[tokio::test]
    async fn test_non_sync_frames_are_fanned_out_verbatim() {
        let transport = MockTransport::new(vec![Ok(vec![
            r#"{"type":"document_updated","entity_id":"D1"}"#.to_string(),
            frame("T1", "synced"),
        ])]);
        let channel = PushChannel::new(transport, ChannelConfig::default());

        let mut sub = channel.subscribe();
        channel.connect().unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.kind, "document_updated");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.kind, "sync_update");

        channel.disconnect();
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let transport = MockTransport::new(vec![Ok(vec![
            "not json at all".to_string(),
            frame("T2", "error"),
        ])]);
        let channel = PushChannel::new(transport, ChannelConfig::default());

        let mut sub = channel.subscribe();
        channel.connect().unwrap();

        let got = sub.recv().await.unwrap();
        assert_eq!(got.entity_id.as_deref(), Some("T2"));

        channel.disconnect();
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_receives_nothing() {
        let transport = MockTransport::new(vec![Ok(vec![frame("T1", "synced")])]);
        let channel = PushChannel::new(transport, ChannelConfig::default());

        let mut kept = channel.subscribe();
        let dropped = channel.subscribe();
        let dropped_id = dropped.id();
        drop(dropped);
        channel.unsubscribe(dropped_id); // idempotent

        channel.connect().unwrap();

        // The kept subscriber proves delivery happened; the dropped one is
        // gone from the registry entirely.
        kept.recv().await.unwrap();
        assert!(!channel
            .inner
            .subscribers
            .read()
            .unwrap()
            .contains_key(&dropped_id));

        channel.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let transport = MockTransport::new(vec![]); // every connect fails
        let config = ChannelConfig {
            max_attempts: 5,
            backoff_step_secs: 2,
            max_backoff_secs: 30,
        };
        let channel = PushChannel::new(transport, config);
        let mut states = channel.state_watch();

        channel.connect().unwrap();

        // Paused clock auto-advances through the backoff sleeps.
        loop {
            states.changed().await.unwrap();
            let state = *states.borrow();
            if state == ChannelState::Exhausted {
                break;
            }
        }

        assert_eq!(channel.state(), ChannelState::Exhausted);

        // Gave up: a fresh connect() is allowed again.
        assert!(channel.connect().is_ok());
        channel.disconnect();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delay_is_capped() {
        let transport = MockTransport::new(vec![]); // every connect fails
        let config = ChannelConfig {
            max_attempts: 10,
            backoff_step_secs: 2,
            max_backoff_secs: 5,
        };
        let channel = PushChannel::new(transport, config);
        let mut states = channel.state_watch();

        channel.connect().unwrap();

        // Timestamp each reconnect announcement; the paused clock advances
        // exactly by the loop's sleeps, so the gaps are the actual delays.
        let mut seen: Vec<(u32, tokio::time::Instant)> = Vec::new();
        while seen.last().map(|(attempt, _)| *attempt) != Some(4) {
            states.changed().await.unwrap();
            if let ChannelState::Reconnecting { attempt } = *states.borrow() {
                seen.push((attempt, tokio::time::Instant::now()));
            }
        }

        assert_eq!(
            seen.iter().map(|(attempt, _)| *attempt).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        // Attempt 1 waits 2s, attempt 2 waits 4s.
        assert_eq!(seen[1].1 - seen[0].1, Duration::from_secs(2));
        assert_eq!(seen[2].1 - seen[1].1, Duration::from_secs(4));
        // Attempt 3 would wait 6s uncapped; the cap holds it at 5s.
        assert_eq!(seen[3].1 - seen[2].1, Duration::from_secs(5));

        channel.disconnect();
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let transport = MockTransport::new(vec![Ok(vec![])]);
        let channel = PushChannel::new(transport, ChannelConfig::default());

        channel.connect().unwrap();
        assert!(matches!(
            channel.connect(),
            Err(ChannelError::AlreadyConnected)
        ));
        channel.disconnect();
    }
}
