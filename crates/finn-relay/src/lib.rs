//! Control-channel transport.
//!
//! One authenticated WebSocket to the relay carrying [`Envelope`] frames in
//! both directions. The client keeps itself alive across network trouble:
//! a read pump delivers frames to the handler, a keepalive pings the relay
//! every 30 s and demands a pong within 10 s, and the first pump to die
//! triggers a single-flight reconnect loop with 1.5x backoff capped at 30 s.
//! Outgoing writes are serialized through one mutex so frames from unrelated
//! subsystems never interleave; sends while disconnected fail immediately
//! and are never buffered or replayed.

use finn_core::Envelope;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const MAX_MESSAGE_SIZE: usize = 512 * 1024;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not connected")]
    NotConnected,
    #[error("client shutting down")]
    Shutdown,
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("write timed out")]
    WriteTimeout,
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Called on the read pump's task for every decoded frame.
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

pub struct RelayClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    token: String,
    device_id: String,
    handler: MessageHandler,

    /// Write half of the live connection; `None` while disconnected.
    sink: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    /// Check-and-set guard making the reconnect loop single-flight.
    reconnecting: AtomicBool,
    closed: AtomicBool,
    /// Counts reconnect loops that actually started; one per outage.
    reconnect_rounds: AtomicU64,

    /// Serializes connection state transitions (dial, pump teardown).
    conn_state: Mutex<ConnState>,
    last_pong: StdMutex<Instant>,
}

#[derive(Default)]
struct ConnState {
    cancel: Option<watch::Sender<bool>>,
    pumps: Vec<JoinHandle<()>>,
}

impl RelayClient {
    pub fn new(
        url: &str,
        token: &str,
        device_id: &str,
        handler: MessageHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.to_string(),
                token: token.to_string(),
                device_id: device_id.to_string(),
                handler,
                sink: Mutex::new(None),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reconnect_rounds: AtomicU64::new(0),
                conn_state: Mutex::new(ConnState::default()),
                last_pong: StdMutex::new(Instant::now()),
            }),
        }
    }

    /// Dials once; the caller decides what a failure means.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let mut state = self.inner.conn_state.lock().await;
        self.inner.clone().connect_locked(&mut state).await
    }

    /// Dials until it sticks, backing off 1 s · 1.5ⁿ capped at 30 s.
    /// Returns early only on shutdown.
    pub async fn connect_with_retry(&self) {
        let mut delay = INITIAL_BACKOFF;
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.connect().await {
                Ok(()) => return,
                Err(err) => {
                    warn!("relay connect failed: {err}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay);
                }
            }
        }
    }

    /// Writes one frame. Fails immediately while disconnected; callers
    /// choose whether to drop or retry later.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), RelayError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        let text = serde_json::to_string(envelope)?;

        let mut sink = self.inner.sink.lock().await;
        let sink = sink.as_mut().ok_or(RelayError::NotConnected)?;
        tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(text)))
            .await
            .map_err(|_| RelayError::WriteTimeout)?
            .map_err(RelayError::Connect)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Stops reconnection, tears down the pumps and closes the socket.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut state = self.inner.conn_state.lock().await;
        Inner::drain_pumps(&mut state).await;
        let mut sink = self.inner.sink.lock().await;
        if let Some(mut ws) = sink.take() {
            let _ = ws.send(WsMessage::Close(None)).await;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        info!(event = "relay_closed");
    }

    #[cfg(test)]
    fn reconnect_rounds(&self) -> u64 {
        self.inner.reconnect_rounds.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn trigger_reconnect_for_test(&self) {
        self.inner.clone().trigger_reconnect("test");
    }
}

impl Inner {
    /// Dials a new connection. Must run under the `conn_state` lock so that
    /// only one transition happens at a time; the pumps of any previous
    /// connection are cancelled and awaited (with a 2 s escape hatch) before
    /// the new socket exists.
    async fn connect_locked(self: Arc<Self>, state: &mut ConnState) -> Result<(), RelayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }

        Self::drain_pumps(state).await;
        self.sink.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);

        let url = format!(
            "{}?token={}&device_type=desktop&device_id={}",
            self.url, self.token, self.device_id
        );
        let config = WebSocketConfig {
            max_message_size: Some(MAX_MESSAGE_SIZE),
            ..WebSocketConfig::default()
        };
        let (ws, _) = connect_async_with_config(&url, Some(config), false).await?;
        let (sink, source) = ws.split();

        *self.sink.lock().await = Some(sink);
        *self.last_pong.lock().expect("pong clock") = Instant::now();
        self.connected.store(true, Ordering::SeqCst);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let reader = tokio::spawn(self.clone().read_pump(source, cancel_rx.clone()));
        let keepalive = tokio::spawn(self.clone().keepalive_pump(cancel_rx));
        state.cancel = Some(cancel_tx);
        state.pumps = vec![reader, keepalive];

        info!(event = "relay_connected");
        Ok(())
    }

    /// Signals the current pumps and waits for them to exit. Stale pumps
    /// that miss the 2 s window are left to die on their cancel signal; the
    /// host never deadlocks on them.
    async fn drain_pumps(state: &mut ConnState) {
        if let Some(cancel) = state.cancel.take() {
            let _ = cancel.send(true);
        }
        let pumps = std::mem::take(&mut state.pumps);
        if pumps.is_empty() {
            return;
        }
        let wait = async {
            for pump in pumps {
                let _ = pump.await;
            }
        };
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, wait).await.is_err() {
            warn!("timeout waiting for pumps to exit, proceeding anyway");
        }
    }

    async fn read_pump(self: Arc<Self>, mut source: WsSource, mut cancel: watch::Receiver<bool>) {
        loop {
            let frame = tokio::select! {
                _ = cancel.changed() => return,
                frame = source.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!("relay read error: {err}");
                    break;
                }
                None => break,
            };
            match frame {
                WsMessage::Text(text) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => (self.handler)(envelope),
                    Err(err) => warn!("failed to parse relay frame: {err}"),
                },
                WsMessage::Pong(_) => {
                    *self.last_pong.lock().expect("pong clock") = Instant::now();
                }
                WsMessage::Ping(payload) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        let _ = sink.send(WsMessage::Pong(payload)).await;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        self.trigger_reconnect("read pump exited");
    }

    /// Pings on a 30 s cadence and verifies a pong lands within 10 s.
    async fn keepalive_pump(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                _ = cancel.changed() => return,
                _ = ticker.tick() => {}
            }

            let ping_sent = Instant::now();
            {
                let mut sink = self.sink.lock().await;
                let Some(sink) = sink.as_mut() else { break };
                if sink.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    warn!("relay ping failed");
                    break;
                }
            }

            tokio::select! {
                _ = cancel.changed() => return,
                _ = tokio::time::sleep(PONG_TIMEOUT) => {}
            }
            let last_pong = *self.last_pong.lock().expect("pong clock");
            if last_pong < ping_sent {
                warn!("relay pong deadline missed");
                break;
            }
        }
        self.trigger_reconnect("keepalive exited");
    }

    /// Both pumps funnel through here; the compare-and-swap guarantees at
    /// most one reconnect loop regardless of how many triggers race.
    fn trigger_reconnect(self: Arc<Self>, reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.reconnect_rounds.fetch_add(1, Ordering::SeqCst);
        info!(event = "relay_disconnected", reason = reason);
        tokio::spawn(self.reconnect_loop());
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            attempt += 1;
            tokio::time::sleep(delay).await;

            let result = {
                let mut state = self.conn_state.lock().await;
                self.clone().connect_locked(&mut state).await
            };
            match result {
                Ok(()) => {
                    if attempt > 1 {
                        info!(event = "relay_reconnected", attempts = attempt);
                    }
                    break;
                }
                Err(RelayError::Shutdown) => break,
                Err(err) => {
                    // Log sparsely during extended outages.
                    if attempt <= 3 || attempt % 5 == 0 {
                        debug!("reconnect attempt {attempt} failed: {err}");
                    }
                    delay = next_backoff(delay);
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

fn next_backoff(current: Duration) -> Duration {
    current.mul_f64(1.5).min(MAX_BACKOFF)
}
