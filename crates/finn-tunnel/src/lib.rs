//! Reverse HTTP tunnel.
//!
//! One tunnel per previewed folder: a second WebSocket to the relay's
//! `/tunnel` endpoint carrying framed request/response pairs. Each inbound
//! [`TunnelRequest`] is replayed against `http://127.0.0.1:<port>` and the
//! answer written back under the same id. Requests fan out onto their own
//! tasks so a slow page never blocks the read loop; response order on the
//! wire is therefore arbitrary and the id carries the correlation. Bodies
//! are capped at 10 MiB in both directions and redirects are passed through
//! untouched.

use finn_core::{TunnelRequest, TunnelResponse};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RECONNECTS: u32 = 5;
const RECONNECT_DELAYS: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),
    #[error("connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Invoked on every state transition with `(folder_id, state, attempt,
/// max_attempts)`; the daemon forwards these as preview-status updates.
pub type StateCallback = Arc<dyn Fn(&str, TunnelState, u32, u32) + Send + Sync>;

pub struct TunnelClient {
    inner: Arc<Inner>,
}

struct Inner {
    relay_url: String,
    token: String,
    user_id: String,
    device_id: String,
    folder_id: String,
    local_port: u16,

    http: reqwest::Client,
    sink: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
    max_reconnects: u32,
    on_state: Mutex<Option<StateCallback>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    pub fn new(
        relay_url: &str,
        token: &str,
        user_id: &str,
        device_id: &str,
        folder_id: &str,
        local_port: u16,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("loopback http client");
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                relay_url: relay_url.to_string(),
                token: token.to_string(),
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                folder_id: folder_id.to_string(),
                local_port,
                http,
                sink: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed,
                max_reconnects: DEFAULT_MAX_RECONNECTS,
                on_state: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    pub async fn set_state_callback(&self, callback: StateCallback) {
        *self.inner.on_state.lock().await = Some(callback);
    }

    pub async fn connect(&self) -> Result<(), TunnelError> {
        self.inner.clone().dial(false).await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn folder_id(&self) -> &str {
        &self.inner.folder_id
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port
    }

    /// Cancels any reconnection attempt, closes the socket and waits up to
    /// 5 s for the read pump. Intentional closes are not reported through
    /// the state callback.
    pub async fn close(&self) {
        let _ = self.inner.closed.send(true);
        {
            let mut sink = self.inner.sink.lock().await;
            if let Some(mut ws) = sink.take() {
                let _ = ws.send(WsMessage::Close(None)).await;
            }
        }
        if let Some(pump) = self.inner.pump.lock().await.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, pump).await.is_err() {
                warn!(event = "tunnel_close_timeout", folder_id = %self.inner.folder_id);
            }
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        info!(event = "tunnel_closed", folder_id = %self.inner.folder_id);
    }
}

impl Inner {
    fn tunnel_url(&self) -> Result<String, TunnelError> {
        let mut url = Url::parse(&self.relay_url)?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => other,
        }
        .to_string();
        // set_scheme rejects nothing we feed it here.
        let _ = url.set_scheme(&scheme);
        url.set_path("/tunnel");
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &self.token)
            .append_pair("folder_id", &self.folder_id)
            .append_pair("device_id", &self.device_id)
            .append_pair("user_id", &self.user_id)
            .append_pair("local_port", &self.local_port.to_string());
        Ok(url.to_string())
    }

    fn dial(
        self: Arc<Self>,
        is_reconnect: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TunnelError>> + Send>> {
        Box::pin(async move {
            let url = self.tunnel_url()?;
            if is_reconnect {
                debug!(event = "tunnel_redial", folder_id = %self.folder_id);
            }

            let config = WebSocketConfig {
                max_message_size: Some(MAX_BODY_BYTES + 64 * 1024),
                ..WebSocketConfig::default()
            };
            let (ws, _) = connect_async_with_config(&url, Some(config), false).await?;
            let (sink, source) = ws.split();

            *self.sink.lock().await = Some(sink);
            self.connected.store(true, Ordering::SeqCst);
            self.notify(TunnelState::Connected, if is_reconnect { 1 } else { 0 })
                .await;
            info!(
                event = "tunnel_connected",
                folder_id = %self.folder_id,
                port = self.local_port
            );

            let pump = tokio::spawn(self.clone().read_pump(source));
            *self.pump.lock().await = Some(pump);
            Ok(())
        })
    }

    async fn read_pump(
        self: Arc<Self>,
        mut source: futures_util::stream::SplitStream<
            WebSocketStream<MaybeTlsStream<TcpStream>>,
        >,
    ) {
        let mut closed = self.closed.subscribe();
        loop {
            let frame = tokio::select! {
                _ = closed.changed() => return,
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let request: TunnelRequest = match serde_json::from_str(&text) {
                        Ok(request) => request,
                        Err(err) => {
                            // No id to correlate an error response with.
                            warn!("failed to parse tunnel request: {err}");
                            continue;
                        }
                    };
                    tokio::spawn(self.clone().handle_request(request));
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    if *closed.borrow() {
                        return;
                    }
                    warn!("tunnel read error: {err}");
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.sink.lock().await.take();
        self.reconnect().await;
    }

    /// Attempts 1..=max at fixed 1,2,4,8,16 s delays. Every transition is
    /// published so remote clients can render preview status.
    async fn reconnect(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();
        for attempt in 1..=self.max_reconnects {
            if *closed.borrow() {
                return;
            }
            self.notify(TunnelState::Reconnecting, attempt).await;

            let delay = RECONNECT_DELAYS[(attempt as usize - 1).min(RECONNECT_DELAYS.len() - 1)];
            tokio::select! {
                _ = closed.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.clone().dial(true).await {
                Ok(()) => {
                    info!(
                        event = "tunnel_reconnected",
                        folder_id = %self.folder_id,
                        attempt = attempt
                    );
                    return;
                }
                Err(err) => warn!("tunnel reconnect attempt {attempt} failed: {err}"),
            }
        }
        warn!(
            event = "tunnel_gave_up",
            folder_id = %self.folder_id,
            attempts = self.max_reconnects
        );
        self.notify(TunnelState::Disconnected, self.max_reconnects).await;
    }

    async fn notify(&self, state: TunnelState, attempt: u32) {
        let callback = self.on_state.lock().await.clone();
        if let Some(callback) = callback {
            callback(&self.folder_id, state, attempt, self.max_reconnects);
        }
    }

    /// Replays one request against the loopback server and writes the
    /// response back. Runs on its own task.
    async fn handle_request(self: Arc<Self>, request: TunnelRequest) {
        debug!(
            event = "tunnel_request",
            method = %request.method,
            path = %request.path
        );
        let response = self.proxy_to_local(&request).await;
        self.write_response(response).await;
    }

    async fn proxy_to_local(&self, request: &TunnelRequest) -> TunnelResponse {
        let local_url = format!("http://127.0.0.1:{}{}", self.local_port, request.path);

        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return error_response(&request.id, format!("invalid method {}", request.method))
            }
        };

        if request.body.len() > MAX_BODY_BYTES {
            return error_response(&request.id, "request body exceeds 10 MiB".to_string());
        }

        let mut builder = self.http.request(method, &local_url);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                return error_response(&request.id, describe_local_error(&err, self.local_port))
            }
        };

        let status_code = response.status().as_u16();
        let mut headers = std::collections::HashMap::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), value.to_string());
            }
        }

        let body = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                return error_response(&request.id, format!("failed to read response: {err}"))
            }
        };
        let mut body = body.to_vec();
        body.truncate(MAX_BODY_BYTES);

        TunnelResponse {
            id: request.id.clone(),
            status_code,
            headers,
            body,
            error: None,
        }
    }

    async fn write_response(&self, response: TunnelResponse) {
        let text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to encode tunnel response: {err}");
                return;
            }
        };

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            warn!("tunnel connection gone, dropping response {}", response.id);
            return;
        };
        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(text))).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to send tunnel response: {err}"),
            Err(_) => warn!("tunnel response write timed out"),
        }
    }
}

/// Hop-by-hop headers never cross the proxy in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    static HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
}

/// Connection trouble on the loopback side becomes a 502 with a hint naming
/// the port the user's dev server was expected on.
fn describe_local_error(err: &reqwest::Error, port: u16) -> String {
    if err.is_timeout() {
        return format!(
            "Dev server at localhost:{port} not responding - make sure it's running (npm run dev)"
        );
    }
    if err.is_connect() {
        return format!("Cannot connect to localhost:{port} - dev server may not be running");
    }
    err.to_string()
}

fn error_response(id: &str, message: String) -> TunnelResponse {
    TunnelResponse {
        id: id.to_string(),
        status_code: 502,
        headers: std::collections::HashMap::new(),
        body: Vec::new(),
        error: Some(message),
    }
}
