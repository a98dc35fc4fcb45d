//! Stateful wrapper around a raw WebSocket that survives connection loss
//!
//! The wrapper owns at most one underlying socket at a time and replaces it
//! atomically. Messages submitted while not open are queued (bounded) and
//! flushed in order on open; connect failures back off exponentially up to
//! a retry budget that [`reconnect`](ReconnectingSocket::reconnect) always
//! resets.

use super::provider::{normalize_ws_url, ProtocolsProvider, UrlProvider};
use crate::Error;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Options for [`ReconnectingSocket`]
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Connection target, evaluated before every attempt
    pub url: UrlProvider,
    /// Sub-protocols, evaluated before every attempt
    pub protocols: ProtocolsProvider,
    /// Initial reconnect delay in milliseconds (default: 1000)
    pub min_reconnect_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds (default: 10000)
    pub max_reconnect_delay_ms: u64,
    /// Delay growth factor per failed attempt (default: 1.3)
    pub reconnect_grow_factor: f64,
    /// An open shorter than this does not reset the retry count
    /// (default: 5000ms)
    pub min_uptime_ms: u64,
    /// Abort a connect attempt that has not opened within this bound
    /// (default: 4000ms)
    pub connection_timeout_ms: u64,
    /// Give up after this many consecutive failed attempts
    /// (default: unbounded)
    pub max_retries: u32,
    /// Bound on the pre-open send queue; overflow is silently dropped
    /// (default: unbounded)
    pub max_enqueued_messages: usize,
    /// Construct without connecting; `reconnect()` starts the first attempt
    pub start_closed: bool,
}

impl SocketOptions {
    pub fn new(url: impl Into<UrlProvider>) -> Self {
        Self {
            url: url.into(),
            protocols: ProtocolsProvider::None,
            min_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 10_000,
            reconnect_grow_factor: 1.3,
            min_uptime_ms: 5_000,
            connection_timeout_ms: 4_000,
            max_retries: u32::MAX,
            max_enqueued_messages: usize::MAX,
            start_closed: false,
        }
    }
}

/// Connection lifetime states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Outgoing or incoming payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl SocketMessage {
    /// Payload size as counted against `buffered_amount`
    pub fn byte_len(&self) -> u64 {
        match self {
            SocketMessage::Text(text) => text.len() as u64,
            SocketMessage::Binary(bytes) => bytes.len() as u64,
        }
    }
}

/// Transport-neutral replay of the underlying socket's events
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Open,
    Message(SocketMessage),
    Close { code: u16, reason: String },
    Error(String),
}

enum WriterCmd {
    Send(SocketMessage),
    Close { code: u16, reason: String },
}

struct Ctl {
    state: SocketState,
    retry_count: u32,
    connect_lock: bool,
    should_reconnect: bool,
    /// Bumped whenever the underlying socket is replaced; io tasks from a
    /// previous socket compare before touching shared state
    epoch: u64,
    queue: VecDeque<SocketMessage>,
    writer: Option<mpsc::UnboundedSender<WriterCmd>>,
}

struct SocketShared {
    options: SocketOptions,
    events: broadcast::Sender<SocketEvent>,
    ctl: Mutex<Ctl>,
    buffered: AtomicU64,
}

/// Auto-reconnecting WebSocket
pub struct ReconnectingSocket {
    shared: Arc<SocketShared>,
}

impl ReconnectingSocket {
    pub fn new(options: SocketOptions) -> Arc<Self> {
        let start_closed = options.start_closed;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SocketShared {
            options,
            events,
            ctl: Mutex::new(Ctl {
                state: if start_closed {
                    SocketState::Closed
                } else {
                    SocketState::Connecting
                },
                retry_count: 0,
                connect_lock: false,
                should_reconnect: true,
                epoch: 0,
                queue: VecDeque::new(),
                writer: None,
            }),
            buffered: AtomicU64::new(0),
        });

        if !start_closed {
            begin_connect(&shared);
        }
        Arc::new(Self { shared })
    }

    pub fn state(&self) -> SocketState {
        self.shared.ctl.lock().state
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.ctl.lock().retry_count
    }

    /// Bytes accepted but not yet handed to the transport, including the
    /// pre-open queue
    pub fn buffered_amount(&self) -> u64 {
        self.shared.buffered.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.shared.events.subscribe()
    }

    /// Send now if open, otherwise queue up to the configured bound;
    /// overflow is dropped silently
    pub fn send(&self, message: SocketMessage) {
        let len = message.byte_len();
        let mut ctl = self.shared.ctl.lock();
        if ctl.state == SocketState::Open {
            if let Some(writer) = &ctl.writer {
                self.shared.buffered.fetch_add(len, Ordering::Relaxed);
                if writer.send(WriterCmd::Send(message)).is_err() {
                    self.shared.buffered.fetch_sub(len, Ordering::Relaxed);
                }
                return;
            }
        }
        if ctl.queue.len() < self.shared.options.max_enqueued_messages {
            self.shared.buffered.fetch_add(len, Ordering::Relaxed);
            ctl.queue.push_back(message);
        }
    }

    /// Close and stay closed until `reconnect()` is called
    pub fn close(&self, code: u16, reason: &str) {
        let writer = {
            let mut ctl = self.shared.ctl.lock();
            ctl.should_reconnect = false;
            let writer = ctl.writer.take();
            ctl.state = if writer.is_some() {
                SocketState::Closing
            } else {
                SocketState::Closed
            };
            writer
        };
        if let Some(writer) = writer {
            let _ = writer.send(WriterCmd::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop the current connection (if any) and start a fresh attempt with
    /// a reset retry budget
    pub fn reconnect(&self) {
        let writer = {
            let mut ctl = self.shared.ctl.lock();
            ctl.should_reconnect = true;
            ctl.retry_count = 0;
            // invalidate in-flight attempts and io tasks for the old socket
            ctl.epoch += 1;
            ctl.connect_lock = false;
            ctl.state = SocketState::Connecting;
            ctl.writer.take()
        };
        if let Some(writer) = writer {
            let _ = writer.send(WriterCmd::Close {
                code: 1000,
                reason: "reconnect".to_string(),
            });
        }
        begin_connect(&self.shared);
    }
}

fn retry_delay(options: &SocketOptions, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1);
    let ms = (options.min_reconnect_delay_ms as f64)
        * options.reconnect_grow_factor.powi(exponent as i32);
    Duration::from_millis(ms.min(options.max_reconnect_delay_ms as f64) as u64)
}

fn begin_connect(shared: &Arc<SocketShared>) {
    let epoch = {
        let mut ctl = shared.ctl.lock();
        if ctl.connect_lock {
            return;
        }
        ctl.connect_lock = true;
        if ctl.retry_count >= shared.options.max_retries {
            // The lock must be released on this early return, or a later
            // reconnect() would be silently ignored.
            ctl.connect_lock = false;
            ctl.state = SocketState::Closed;
            drop(ctl);
            let _ = shared
                .events
                .send(SocketEvent::Error("connect retries exhausted".to_string()));
            return;
        }
        ctl.state = SocketState::Connecting;
        ctl.epoch += 1;
        ctl.epoch
    };

    let shared = shared.clone();
    tokio::spawn(async move {
        connect_attempt(shared, epoch).await;
    });
}

async fn connect_attempt(shared: Arc<SocketShared>, epoch: u64) {
    let timeout = Duration::from_millis(shared.options.connection_timeout_ms);

    let attempt = async {
        let url = shared.options.url.resolve().await?;
        let url = normalize_ws_url(&url)?;
        let protocols = shared.options.protocols.resolve().await?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Socket(format!("invalid URL {url}: {e}")))?;
        if !protocols.is_empty() {
            let value = HeaderValue::from_str(&protocols.join(", "))
                .map_err(|e| Error::Socket(format!("invalid sub-protocol: {e}")))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        debug!(%url, "connecting");
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request)).await {
            Err(_) => Err(Error::Timeout(format!(
                "socket did not open within {}ms",
                timeout.as_millis()
            ))),
            Ok(Err(e)) => Err(Error::Socket(e.to_string())),
            Ok(Ok((stream, _response))) => Ok(stream),
        }
    }
    .await;

    match attempt {
        Err(err) => {
            let fatal = !err.is_retryable();
            {
                let mut ctl = shared.ctl.lock();
                if ctl.epoch != epoch {
                    return;
                }
                ctl.connect_lock = false;
                ctl.retry_count += 1;
                if fatal {
                    ctl.state = SocketState::Closed;
                }
            }
            let _ = shared.events.send(SocketEvent::Error(err.to_string()));
            if !fatal {
                schedule_retry(&shared);
            }
        }
        Ok(stream) => on_open(shared, epoch, stream).await,
    }
}

fn schedule_retry(shared: &Arc<SocketShared>) {
    let delay = {
        let ctl = shared.ctl.lock();
        if !ctl.should_reconnect {
            return;
        }
        retry_delay(&shared.options, ctl.retry_count)
    };
    debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        begin_connect(&shared);
    });
}

async fn on_open(
    shared: Arc<SocketShared>,
    epoch: u64,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut sink, mut reader) = stream.split();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();

    {
        let mut ctl = shared.ctl.lock();
        if ctl.epoch != epoch || !ctl.should_reconnect {
            // superseded or closed while connecting
            drop(ctl);
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
            return;
        }
        ctl.connect_lock = false;
        ctl.state = SocketState::Open;
        // pre-open queue flushes in order ahead of any new sends
        for message in ctl.queue.drain(..) {
            let _ = cmd_tx.send(WriterCmd::Send(message));
        }
        ctl.writer = Some(cmd_tx);
    }

    info!("socket open");
    let _ = shared.events.send(SocketEvent::Open);

    // a short-lived open must not reset the retry budget
    {
        let shared = shared.clone();
        let min_uptime = Duration::from_millis(shared.options.min_uptime_ms);
        tokio::spawn(async move {
            tokio::time::sleep(min_uptime).await;
            let mut ctl = shared.ctl.lock();
            if ctl.epoch == epoch && ctl.state == SocketState::Open {
                ctl.retry_count = 0;
            }
        });
    }

    // writer half
    {
        let shared = shared.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    WriterCmd::Send(message) => {
                        let len = message.byte_len();
                        let frame = match message {
                            SocketMessage::Text(text) => Message::Text(text),
                            SocketMessage::Binary(bytes) => Message::Binary(bytes),
                        };
                        let result = sink.send(frame).await;
                        shared.buffered.fetch_sub(len, Ordering::Relaxed);
                        if result.is_err() {
                            break;
                        }
                    }
                    WriterCmd::Close { code, reason } => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: code.into(),
                                reason: reason.into(),
                            })))
                            .await;
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });
    }

    // reader half
    {
        let shared = shared.clone();
        tokio::spawn(async move {
            let mut close_frame: Option<(u16, String)> = None;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = shared
                            .events
                            .send(SocketEvent::Message(SocketMessage::Text(text)));
                    }
                    Ok(Message::Binary(bytes)) => {
                        let _ = shared
                            .events
                            .send(SocketEvent::Message(SocketMessage::Binary(bytes)));
                    }
                    Ok(Message::Close(frame)) => {
                        close_frame = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()));
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "socket read failed");
                        let _ = shared.events.send(SocketEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            on_disconnect(&shared, epoch, close_frame);
        });
    }
}

fn on_disconnect(shared: &Arc<SocketShared>, epoch: u64, close_frame: Option<(u16, String)>) {
    let reconnecting = {
        let mut ctl = shared.ctl.lock();
        if ctl.epoch != epoch {
            return;
        }
        ctl.writer = None;
        let reconnecting =
            ctl.should_reconnect && ctl.retry_count < shared.options.max_retries;
        if reconnecting {
            ctl.retry_count += 1;
            ctl.state = SocketState::Connecting;
        } else {
            ctl.state = SocketState::Closed;
        }
        reconnecting
    };

    let (code, reason) = close_frame.unwrap_or((1006, String::new()));
    debug!(code, %reason, reconnecting, "socket disconnected");
    let _ = shared.events.send(SocketEvent::Close { code, reason });

    if reconnecting {
        schedule_retry(shared);
    }
}
