//! Websocket connection management.
//!
//! A [`Connection`] keeps a durable, TLS-protected session with the
//! server: it re-establishes the socket with capped backoff when reads
//! fail, answers server pings under an inactivity deadline, correlates
//! responses to outstanding requests, and feeds every other inbound
//! message to a single consumer channel.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dexlink_msg::{Message, MessageKind};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message as WsFrame};
use tokio_tungstenite::{
    client_async_tls_with_config, connect_async_tls_with_config, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{WsError, WsResult};
use crate::registry::{ExpireFn, RequestRegistry, ResponseFn};
use crate::status::{ConnectEventFn, ConnectionStatus, StatusCell};
use crate::tls;

/// Capacity of the inbound message channel.
const READ_BUFFER_SIZE: usize = 128;

/// Deadline for the normal-closure frame sent when a socket is replaced
/// or shut down.
const CLOSE_WAIT: Duration = Duration::from_millis(50);

/// The longest a single frame write may take.
pub const WRITE_WAIT: Duration = Duration::from_secs(3);

/// Initial reconnect delay, and the per-failure increment.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Cap on the delay between reconnect attempts.
pub const MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

/// Default timeout for a response after a request is successfully sent.
/// Also bounds the websocket handshake.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsFrame>;
type WsSource = SplitStream<WsStream>;

/// Runs the needed resynchronization after a reconnect, e.g. renewing
/// subscriptions. The transport holds no such state itself.
pub type ReconnectSyncFn = Arc<dyn Fn() + Send + Sync>;

/// Replaces the default TCP stream establishment. Receives the
/// `host:port` authority of the current URL.
pub type NetDialFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<TcpStream>> + Send + Sync>;

/// Receives every inbound frame's bytes, bypassing envelope decoding and
/// response matching.
pub type RawHandlerFn = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Configuration for a [`Connection`]. Immutable after construction,
/// except for the URL which can be swapped at runtime with
/// [`Connection::update_url`].
#[derive(Default)]
pub struct WsCfg {
    /// Websocket endpoint URL.
    pub url: String,

    /// The maximum time to wait for a ping from the server. Should be
    /// larger than the server's ping interval to allow for network
    /// latency.
    pub ping_wait: Duration,

    /// The server's certificate, PEM-encoded, trusted in addition to the
    /// system roots.
    pub cert: Vec<u8>,

    /// Runs after every successful reconnect.
    pub reconnect_sync: Option<ReconnectSyncFn>,

    /// Runs whenever the connection status changes.
    ///
    /// NOTE: disconnect notifications may lag behind the actual
    /// disconnection.
    pub connect_event: Option<ConnectEventFn>,

    /// Custom TCP stream establishment for the handshake.
    pub net_dial: Option<NetDialFn>,

    /// Switches the connection to raw mode: inbound frames are forwarded
    /// as bytes and the envelope machinery is bypassed.
    pub raw_handler: Option<RawHandlerFn>,

    /// Single-shot connect; read errors do not schedule reconnects.
    pub disable_auto_reconnect: bool,

    /// Extra headers for the opening handshake.
    pub connect_headers: Vec<(String, String)>,

    /// Echo inbound ping payloads back as the pong payload.
    pub echo_ping_data: bool,
}

/// A client websocket connection.
///
/// Cheap to clone; all clones share the same underlying session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

struct ConnectionInner {
    cfg: WsCfg,
    tls_config: Arc<rustls::ClientConfig>,
    next_id: AtomicU64,
    status: StatusCell,
    /// Swapped by `update_url`; the next dial reads it.
    url: RwLock<String>,
    /// Maximum inbound frame size, applied at the next dial. Zero means
    /// the library default.
    read_limit: AtomicUsize,
    /// Write half of the active socket. Taken on shutdown and replaced
    /// on reconnect.
    writer: tokio::sync::Mutex<Option<WsSink>>,
    registry: RequestRegistry,
    /// Producer side of the message source. Dropped at shutdown so the
    /// consumer observes end-of-stream.
    read_tx: Mutex<Option<mpsc::Sender<Message>>>,
    read_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    /// Coalescing single-slot reconnect trigger.
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: TaskTracker,
}

/// Outcome of waiting for the next data frame.
enum ReadEvent {
    /// A text or binary frame.
    Frame(WsFrame),
    Failed(ReadFailure),
    Cancelled,
}

enum ReadFailure {
    /// No frame arrived within the ping wait.
    Timeout,
    /// The frame stream ended without a close frame.
    Ended,
    /// The server sent a close frame.
    Closed(Option<CloseFrame<'static>>),
    Ws(tungstenite::Error),
    /// A pong reply could not be written.
    Pong(WsError),
    /// An inbound frame was not decodable at all.
    Decode(serde_json::Error),
}

impl Connection {
    /// Create a client websocket connection from its configuration.
    pub fn new(cfg: WsCfg) -> WsResult<Self> {
        if cfg.ping_wait.is_zero() {
            return Err(WsError::InvalidConfig(
                "ping wait must be greater than zero".to_string(),
            ));
        }
        cfg.url
            .as_str()
            .into_client_request()
            .map_err(|err| WsError::InvalidConfig(format!("error parsing URL: {err}")))?;

        let tls_config = tls::build_tls_config(&cfg.cert)?;
        let (read_tx, read_rx) = mpsc::channel(READ_BUFFER_SIZE);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let url = RwLock::new(cfg.url.clone());
        let status = StatusCell::new(cfg.connect_event.clone());

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                cfg,
                tls_config,
                next_id: AtomicU64::new(0),
                status,
                url,
                read_limit: AtomicUsize::new(0),
                writer: tokio::sync::Mutex::new(None),
                registry: RequestRegistry::default(),
                read_tx: Mutex::new(Some(read_tx)),
                read_rx: Mutex::new(Some(read_rx)),
                reconnect_tx,
                reconnect_rx: tokio::sync::Mutex::new(Some(reconnect_rx)),
                cancel: Mutex::new(None),
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Connect the client. A failed first attempt still leaves the
    /// reconnect loop running unless the failure was a certificate
    /// rejection or auto-reconnect is disabled. The returned tracker
    /// completes once every internal task has finished after [`stop`]
    /// or cancellation of `ctx`.
    ///
    /// [`stop`]: Connection::stop
    pub async fn connect(&self, ctx: CancellationToken) -> WsResult<TaskTracker> {
        let inner = &self.inner;
        let token = ctx.child_token();
        *inner.cancel.lock() = Some(token.clone());

        if let Err(err) = inner.dial(&token).await {
            let hard = inner.cfg.disable_auto_reconnect
                || matches!(
                    err,
                    WsError::InvalidCertificate(_) | WsError::CertificateRequired(_)
                );
            if hard {
                token.cancel();
                inner.tasks.close();
                inner.tasks.wait().await;
                inner.read_tx.lock().take();
                return Err(err);
            }
            // The read loop normally feeds the keepalive, but it never
            // started; prime the trigger instead.
            error!(error = %err, "initial connection failed, starting reconnect loop");
            let trigger = inner.reconnect_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RECONNECT_INTERVAL).await;
                let _ = trigger.try_send(());
            });
        }

        if !inner.cfg.disable_auto_reconnect {
            let conn = Arc::clone(inner);
            let keepalive_token = token.clone();
            inner
                .tasks
                .spawn(async move { conn.keep_alive(keepalive_token).await });
        }

        let conn = Arc::clone(inner);
        let watcher_token = token.clone();
        inner
            .tasks
            .spawn(async move { conn.watch_shutdown(watcher_token).await });

        inner.tasks.close();
        Ok(inner.tasks.clone())
    }

    /// Close the connection and every task started by [`connect`].
    /// Equivalent to cancelling the token passed to `connect`. Safe to
    /// call more than once.
    ///
    /// [`connect`]: Connection::connect
    pub fn stop(&self) {
        let token = self.inner.cancel.lock().clone();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// The next request id. Unique for the life of this connection.
    pub fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether the connection is known to be down.
    pub fn is_down(&self) -> bool {
        self.inner.status.is_down()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.get()
    }

    /// Replace the endpoint URL used by the next (re)connect. Does not
    /// force a reconnect by itself.
    pub fn update_url(&self, url: impl Into<String>) {
        *self.inner.url.write() = url.into();
    }

    /// Cap the size of inbound frames, applied at the next (re)connect.
    pub fn set_read_limit(&self, limit: usize) {
        self.inner.read_limit.store(limit, Ordering::Release);
    }

    /// Take the inbound message source. It receives requests and
    /// notifications from the server, but not responses, which are
    /// dispatched to their registered handlers. There is exactly one
    /// consumer: the first call returns the receiver and later calls
    /// return `None`. The channel closes when the connection shuts down.
    pub fn message_source(&self) -> Option<mpsc::Receiver<Message>> {
        self.inner.read_rx.lock().take()
    }

    /// Marshal `msg` and send it. Sending is synchronous: an `Ok` return
    /// guarantees the frame was handed to the socket.
    pub async fn send(&self, msg: &Message) -> WsResult<()> {
        if self.is_down() {
            return Err(WsError::ConnectionBroken);
        }
        // Marshal first so a failure cannot emit a partial frame.
        let raw = serde_json::to_vec(msg).map_err(|err| {
            error!(error = %err, "failed to marshal message");
            WsError::Marshal(err)
        })?;
        self.send_raw(raw).await
    }

    /// Send one pre-marshalled text frame. Writes are serialized and
    /// bounded by [`WRITE_WAIT`]; there is no automatic retry.
    pub async fn send_raw(&self, raw: Vec<u8>) -> WsResult<()> {
        if self.is_down() {
            return Err(WsError::ConnectionBroken);
        }
        let text =
            String::from_utf8(raw).map_err(|err| WsError::WriteFailed(err.to_string()))?;

        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(WsError::ConnectionBroken)?;
        match timeout(WRITE_WAIT, sink.send(WsFrame::Text(text))).await {
            Err(_) => Err(WsError::WriteTimeout(WRITE_WAIT)),
            Ok(Err(err)) => {
                error!(error = %err, "write message error");
                Err(WsError::WriteFailed(err.to_string()))
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Send a request and register `f` to run on the matching response.
    /// The handler expires after [`DEFAULT_RESPONSE_TIMEOUT`], silently
    /// dropping any late response. Use [`request_with_timeout`] to
    /// observe expiry or change the deadline.
    ///
    /// [`request_with_timeout`]: Connection::request_with_timeout
    pub async fn request(&self, msg: &Message, f: ResponseFn) -> WsResult<()> {
        self.request_with_timeout(msg, f, DEFAULT_RESPONSE_TIMEOUT, Box::new(|| {}))
            .await
    }

    /// Send a request without waiting for the response. If the server
    /// responds within `expire_in`, `f` runs with a message whose id
    /// equals the request id; otherwise `on_expire` runs. An `Ok` return
    /// guarantees exactly one of the two will run; an `Err` return
    /// guarantees neither will.
    pub async fn request_with_timeout(
        &self,
        msg: &Message,
        f: ResponseFn,
        expire_in: Duration,
        on_expire: ExpireFn,
    ) -> WsResult<()> {
        if msg.kind != MessageKind::Request {
            return Err(WsError::NotARequest(msg.kind));
        }
        let raw = serde_json::to_vec(msg).map_err(|err| {
            error!(error = %err, "failed to marshal message");
            WsError::Marshal(err)
        })?;
        let res = self
            .request_raw_with_timeout(msg.id, raw, f, expire_in, on_expire)
            .await;
        if let Err(err) = &res {
            error!(
                route = %msg.route,
                id = msg.id,
                error = %err,
                "request send error, unregistering handler"
            );
        }
        res
    }

    /// Pre-marshalled variant of [`request`].
    ///
    /// [`request`]: Connection::request
    pub async fn request_raw(&self, id: u64, raw: Vec<u8>, f: ResponseFn) -> WsResult<()> {
        self.request_raw_with_timeout(id, raw, f, DEFAULT_RESPONSE_TIMEOUT, Box::new(|| {}))
            .await
    }

    /// Pre-marshalled variant of [`request_with_timeout`].
    ///
    /// [`request_with_timeout`]: Connection::request_with_timeout
    pub async fn request_raw_with_timeout(
        &self,
        id: u64,
        raw: Vec<u8>,
        f: ResponseFn,
        expire_in: Duration,
        on_expire: ExpireFn,
    ) -> WsResult<()> {
        // Register before sending so a fast response cannot miss its
        // handler.
        self.inner.registry.register(id, f, expire_in, on_expire);
        let res = self.send_raw(raw).await;
        if res.is_err() {
            // Neither the callback nor the expiry may run; the caller
            // gets the send error instead.
            drop(self.inner.registry.take(id));
        }
        res
    }
}

impl ConnectionInner {
    fn url(&self) -> String {
        self.url.read().clone()
    }

    /// Flag the connection down and wake the keepalive loop, unless
    /// auto-reconnect is disabled. The single-slot trigger coalesces
    /// redundant wakeups.
    fn trigger_reconnect(&self) {
        self.status.set(ConnectionStatus::Disconnected);
        if !self.cfg.disable_auto_reconnect {
            let _ = self.reconnect_tx.try_send(());
        }
    }

    /// Perform the TLS websocket handshake against the current URL, swap
    /// in the new socket, and start a read loop for it.
    async fn dial(self: &Arc<Self>, token: &CancellationToken) -> WsResult<()> {
        let url = self.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| WsError::InvalidConfig(format!("error parsing URL: {err}")))?;
        for (name, value) in &self.cfg.connect_headers {
            let name: HeaderName = name
                .parse()
                .map_err(|err| WsError::InvalidConfig(format!("bad header name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| WsError::InvalidConfig(format!("bad header value: {err}")))?;
            request.headers_mut().insert(name, value);
        }

        let ws_config = match self.read_limit.load(Ordering::Acquire) {
            0 => None,
            limit => {
                let mut config = WebSocketConfig::default();
                config.max_message_size = Some(limit);
                Some(config)
            }
        };
        let connector = Connector::Rustls(Arc::clone(&self.tls_config));

        let handshake = async {
            match &self.cfg.net_dial {
                Some(net_dial) => {
                    let addr = {
                        let uri = request.uri();
                        let host = uri.host().ok_or(tungstenite::Error::Url(
                            tungstenite::error::UrlError::NoHostName,
                        ))?;
                        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
                            Some("wss") => 443,
                            _ => 80,
                        });
                        format!("{host}:{port}")
                    };
                    let stream = net_dial(addr).await.map_err(tungstenite::Error::Io)?;
                    let (ws, _) =
                        client_async_tls_with_config(request, stream, ws_config, Some(connector))
                            .await?;
                    Ok(ws)
                }
                None => {
                    let (ws, _) =
                        connect_async_tls_with_config(request, ws_config, true, Some(connector))
                            .await?;
                    Ok(ws)
                }
            }
        };

        let ws: WsStream = match timeout(DEFAULT_RESPONSE_TIMEOUT, handshake).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(err)) => {
                if tls::is_invalid_cert_error(&err) {
                    self.status.set(ConnectionStatus::InvalidCert);
                    return Err(if self.cfg.cert.is_empty() {
                        WsError::CertificateRequired(err.to_string())
                    } else {
                        WsError::InvalidCertificate(err.to_string())
                    });
                }
                self.status.set(ConnectionStatus::Disconnected);
                return Err(WsError::HandshakeFailed(err.to_string()));
            }
            Err(_) => {
                self.status.set(ConnectionStatus::Disconnected);
                return Err(WsError::HandshakeTimeout);
            }
        };

        let (sink, stream) = ws.split();
        {
            let mut writer = self.writer.lock().await;
            // A reconnect may find the previous socket still installed.
            if let Some(old) = writer.take() {
                close_sink(old).await;
            }
            *writer = Some(sink);
        }
        self.status.set(ConnectionStatus::Connected);

        let conn = Arc::clone(self);
        let read_token = token.clone();
        if self.cfg.raw_handler.is_some() {
            self.tasks
                .spawn(async move { conn.read_raw(stream, read_token).await });
        } else {
            self.tasks
                .spawn(async move { conn.read_loop(stream, read_token).await });
        }
        Ok(())
    }

    /// Wait for the next text or binary frame, answering pings and
    /// enforcing the inactivity deadline along the way.
    async fn next_frame(
        &self,
        stream: &mut WsSource,
        deadline: &mut Instant,
        token: &CancellationToken,
    ) -> ReadEvent {
        loop {
            let item = tokio::select! {
                () = token.cancelled() => return ReadEvent::Cancelled,
                item = timeout_at(*deadline, stream.next()) => item,
            };
            if token.is_cancelled() {
                // Errors raised by closing the socket during shutdown
                // are dropped.
                return ReadEvent::Cancelled;
            }
            let frame = match item {
                Err(_) => return ReadEvent::Failed(ReadFailure::Timeout),
                Ok(None) => return ReadEvent::Failed(ReadFailure::Ended),
                Ok(Some(Err(err))) => return ReadEvent::Failed(ReadFailure::Ws(err)),
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                WsFrame::Ping(data) => {
                    // Every inbound ping re-arms the inactivity deadline.
                    *deadline = Instant::now() + self.cfg.ping_wait;
                    if let Err(err) = self.send_pong(data).await {
                        return ReadEvent::Failed(ReadFailure::Pong(err));
                    }
                }
                WsFrame::Pong(_) | WsFrame::Frame(_) => {}
                WsFrame::Close(frame) => return ReadEvent::Failed(ReadFailure::Closed(frame)),
                frame => return ReadEvent::Frame(frame),
            }
        }
    }

    /// Reply to a ping, echoing its payload if configured.
    async fn send_pong(&self, data: Vec<u8>) -> WsResult<()> {
        let payload = if self.cfg.echo_ping_data {
            data
        } else {
            Vec::new()
        };
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(WsError::ConnectionBroken)?;
        match timeout(WRITE_WAIT, sink.send(WsFrame::Pong(payload))).await {
            Err(_) => Err(WsError::WriteTimeout(WRITE_WAIT)),
            Ok(Err(err)) => Err(WsError::WriteFailed(err.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Log a fatal read outcome and wake the keepalive loop. Every
    /// branch reconnects; they differ only in what they record.
    fn handle_read_failure(&self, failure: ReadFailure) {
        match failure {
            ReadFailure::Timeout => error!(url = %self.url(), "read timeout on connection"),
            ReadFailure::Ended => warn!("websocket stream ended"),
            ReadFailure::Closed(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1000, String::new()));
                // The server closing is also a reason to re-establish.
                info!(code, %reason, "server closed the connection");
            }
            ReadFailure::Ws(
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
            ) => info!("close sent, re-establishing the connection"),
            ReadFailure::Ws(tungstenite::Error::Io(err)) => error!(error = %err, "read quitting"),
            ReadFailure::Ws(err) => error!(error = %err, "read error, attempting reconnection"),
            ReadFailure::Pong(err) => error!(error = %err, "pong write error"),
            ReadFailure::Decode(err) => {
                error!(error = %err, "unreadable frame, attempting reconnection");
            }
        }
        self.trigger_reconnect();
    }

    /// Structured-mode read loop: decode inbound frames, dispatch
    /// responses to their handlers, and feed everything else to the
    /// consumer channel.
    async fn read_loop(self: Arc<Self>, mut stream: WsSource, token: CancellationToken) {
        let read_tx = match self.read_tx.lock().clone() {
            Some(tx) => tx,
            None => return,
        };
        let mut deadline = Instant::now() + self.cfg.ping_wait;

        loop {
            let frame = match self.next_frame(&mut stream, &mut deadline, &token).await {
                ReadEvent::Cancelled => return,
                ReadEvent::Failed(failure) => {
                    self.handle_read_failure(failure);
                    return;
                }
                ReadEvent::Frame(frame) => frame,
            };
            let text = match frame {
                WsFrame::Text(text) => text,
                WsFrame::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(err) => {
                        error!(error = %err, "discarding non-utf8 binary frame");
                        continue;
                    }
                },
                _ => continue,
            };

            let msg: Message = match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(err) if err.classify() == serde_json::error::Category::Data => {
                    // Shape mismatches are not fatal; skip the frame.
                    error!(error = %err, "json decode error");
                    continue;
                }
                Err(err) => {
                    self.handle_read_failure(ReadFailure::Decode(err));
                    return;
                }
            };

            if msg.kind == MessageKind::Response {
                let Some(handler) = self.registry.take(msg.id) else {
                    error!(id = msg.id, "no handler found for response");
                    continue;
                };
                // Run the handler in its own task so other messages can
                // be received meanwhile.
                self.tasks.spawn(async move { (handler.f)(msg) });
                continue;
            }

            // Requests and notifications go to the consumer. A slow
            // consumer backpressures this loop.
            if read_tx.send(msg).await.is_err() {
                return;
            }
        }
    }

    /// Raw-mode read loop: forward every data frame's bytes to the
    /// configured handler.
    async fn read_raw(self: Arc<Self>, mut stream: WsSource, token: CancellationToken) {
        let Some(handler) = self.cfg.raw_handler.clone() else {
            return;
        };
        let mut deadline = Instant::now() + self.cfg.ping_wait;

        loop {
            match self.next_frame(&mut stream, &mut deadline, &token).await {
                ReadEvent::Cancelled => return,
                ReadEvent::Failed(failure) => {
                    self.handle_read_failure(failure);
                    return;
                }
                ReadEvent::Frame(WsFrame::Text(text)) => handler(text.as_bytes()),
                ReadEvent::Frame(WsFrame::Binary(data)) => handler(&data),
                ReadEvent::Frame(_) => {}
            }
        }
    }

    /// Re-establish the connection whenever the trigger fires, backing
    /// off by [`RECONNECT_INTERVAL`] per failure up to
    /// [`MAX_RECONNECT_INTERVAL`].
    async fn keep_alive(self: Arc<Self>, token: CancellationToken) {
        let Some(mut trigger_rx) = self.reconnect_rx.lock().await.take() else {
            return;
        };
        let mut interval = RECONNECT_INTERVAL;

        loop {
            tokio::select! {
                () = token.cancelled() => return,
                trigger = trigger_rx.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                    // Cancellation wins over pending triggers.
                    if token.is_cancelled() {
                        return;
                    }

                    info!(url = %self.url(), "attempting to reconnect");
                    match self.dial(&token).await {
                        Err(err) => {
                            error!(
                                error = %err,
                                delay_secs = interval.as_secs(),
                                "reconnect failed, scheduling retry"
                            );
                            let trigger = self.reconnect_tx.clone();
                            let delay = interval;
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = trigger.try_send(());
                            });
                            interval = next_backoff(interval);
                        }
                        Ok(()) => {
                            info!("successfully reconnected");
                            interval = RECONNECT_INTERVAL;
                            if let Some(sync) = &self.cfg.reconnect_sync {
                                sync();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Await cancellation, then tear the session down: close the socket,
    /// run every pending abort, and end the consumer stream.
    async fn watch_shutdown(self: Arc<Self>, token: CancellationToken) {
        token.cancelled().await;
        self.status.set(ConnectionStatus::Disconnected);

        let old = self.writer.lock().await.take();
        if let Some(sink) = old {
            debug!("sending close 1000 (normal) message");
            close_sink(sink).await;
        }

        // Run the pending aborts so request callers don't hang, then
        // close the message source.
        self.registry.drain();
        self.read_tx.lock().take();
    }
}

/// Grow the reconnect delay by one step, up to the cap.
fn next_backoff(current: Duration) -> Duration {
    (current + RECONNECT_INTERVAL).min(MAX_RECONNECT_INTERVAL)
}

/// Best-effort normal-closure frame under a short deadline; the socket
/// is then dropped regardless.
async fn close_sink(mut sink: WsSink) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    };
    let _ = timeout(CLOSE_WAIT, sink.send(WsFrame::Close(Some(frame)))).await;
}
