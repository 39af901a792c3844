use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelState};
use crate::codec::Codec;
use crate::config::ConnectOptions;
use crate::error::{CableError, Result};
use crate::message::Message;
use crate::protocol::{canonical_identifier, channel_identifier, CableCommand, InboundFrame};
use crate::transport::await_welcome;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Default)]
pub struct ConnectionStats {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    callback_failures: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub callback_failures: u64,
    pub evictions: u64,
}

impl StatsSnapshot {
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.sent += other.sent;
        self.received += other.received;
        self.dropped += other.dropped;
        self.callback_failures += other.callback_failures;
        self.evictions += other.evictions;
    }
}

impl ConnectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(WsMessage),
    Close,
}

type Registry = Mutex<HashMap<String, Channel>>;

#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Outbound>,
    codec: Codec,
    stats: Arc<ConnectionStats>,
    registry: Weak<Registry>,
}

impl Outbox {
    pub(crate) async fn send(&self, command: &CableCommand) -> Result<()> {
        let frame = self.codec.encode(command)?;
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| CableError::ConnectionClosed)?;
        self.stats.record_sent();
        Ok(())
    }

    pub(crate) fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    #[cfg(test)]
    pub(crate) fn stats_handle(&self) -> Arc<ConnectionStats> {
        self.stats.clone()
    }

    pub(crate) fn forget(&self, identifier: &str) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(identifier);
        }
    }

    fn request_close(&self) {
        let _ = self.tx.try_send(Outbound::Close);
    }
}

struct ConnectionShared {
    label: String,
    state: Mutex<ConnectionState>,
    registry: Arc<Registry>,
    outbox: Outbox,
    options: ConnectOptions,
}

impl ConnectionShared {
    fn lookup(&self, identifier: &str) -> Option<Channel> {
        let channels = lock(&self.registry);
        channels
            .get(identifier)
            .or_else(|| channels.get(&canonical_identifier(identifier)))
            .cloned()
    }

    /// Returns a close reason when the frame ends the connection.
    fn handle_frame(&self, decoded: Result<InboundFrame>) -> Option<String> {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(err) => {
                warn!("[{}] undecodable frame: {err}", self.label);
                return None;
            }
        };
        match frame {
            InboundFrame::Welcome => debug!("[{}] repeated welcome ignored", self.label),
            InboundFrame::Ping => trace!("[{}] ping", self.label),
            InboundFrame::Confirm { identifier } => match self.lookup(&identifier) {
                Some(channel) => {
                    channel.confirm();
                    debug!("[{}] subscribed to {}", self.label, channel.identifier());
                }
                None => debug!("[{}] confirmation for unknown {identifier}", self.label),
            },
            InboundFrame::Reject { identifier } => {
                let removed = {
                    let mut channels = lock(&self.registry);
                    match channels.remove(&identifier) {
                        Some(channel) => Some(channel),
                        None => channels.remove(&canonical_identifier(&identifier)),
                    }
                };
                match removed {
                    Some(channel) => {
                        warn!("[{}] subscription to {identifier} rejected", self.label);
                        channel.reject();
                    }
                    None => debug!("[{}] rejection for unknown {identifier}", self.label),
                }
            }
            InboundFrame::Disconnect { reason, reconnect } => {
                return Some(format!(
                    "server disconnect (reason: {}, reconnect: {reconnect})",
                    reason.as_deref().unwrap_or("none")
                ));
            }
            InboundFrame::Message { identifier, body } => {
                self.outbox.stats().record_received();
                match self.lookup(&identifier) {
                    Some(channel) if channel.state() == ChannelState::Confirmed => {
                        channel.dispatch(Message::new(channel.shared_identifier(), body));
                    }
                    Some(channel) => {
                        self.outbox.stats().record_dropped();
                        debug!(
                            "[{}] dropping message for {:?} subscription {identifier}",
                            self.label,
                            channel.state()
                        );
                    }
                    None => {
                        self.outbox.stats().record_dropped();
                        debug!("[{}] dropping message for unknown {identifier}", self.label);
                    }
                }
            }
            InboundFrame::Unknown(kind) => debug!("[{}] ignoring `{kind}` frame", self.label),
        }
        None
    }

    fn shut_down(&self, reason: &str) {
        let previous = std::mem::replace(&mut *lock(&self.state), ConnectionState::Closed);
        if previous != ConnectionState::Closed {
            info!("[{}] connection closed: {reason}", self.label);
        }
        let channels = lock(&self.registry)
            .drain()
            .map(|(_, channel)| channel)
            .collect::<Vec<_>>();
        for channel in channels {
            channel.close();
        }
        self.outbox.request_close();
    }
}

pub struct Connection {
    shared: Arc<ConnectionShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub async fn open<S>(mut ws: WebSocketStream<S>, options: ConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        options.validate()?;
        await_welcome(&mut ws, options.codec, options.handshake_timeout()).await?;

        let label = match options.tag_summary() {
            tags if tags.is_empty() => "cable".to_owned(),
            tags => format!("cable {tags}"),
        };
        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(options.send_queue_capacity.max(1));
        let registry: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        let outbox = Outbox {
            tx,
            codec: options.codec,
            stats: Arc::new(ConnectionStats::default()),
            registry: Arc::downgrade(&registry),
        };
        let shared = Arc::new(ConnectionShared {
            label,
            state: Mutex::new(ConnectionState::Open),
            registry,
            outbox,
            options,
        });

        let writer = tokio::spawn(write_loop(sink, rx, shared.label.clone()));
        let reader = tokio::spawn(read_loop(stream, shared.clone()));
        info!("[{}] connection open", shared.label);

        Ok(Self {
            shared,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.outbox.stats().snapshot()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.shared.options
    }

    pub fn subscriptions(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    pub async fn subscribe(&self, name: &str, params: Map<String, Value>) -> Result<Channel> {
        if !self.is_open() {
            return Err(CableError::ConnectionClosed);
        }
        let identifier = channel_identifier(name, &params);
        let (channel, confirmed) = {
            let mut channels = lock(&self.shared.registry);
            if let Some(existing) = channels.get(&identifier) {
                if existing.state() == ChannelState::Confirmed {
                    warn!("[{}] already subscribed to {identifier}", self.shared.label);
                    return Ok(existing.clone());
                }
                return Err(CableError::SubscriptionPending(identifier));
            }
            let (channel, confirmed) = Channel::new(
                name,
                params,
                &identifier,
                self.shared.outbox.clone(),
                self.shared.options.receive_timeout(),
                self.shared.options.inbox_capacity,
            );
            channels.insert(identifier.clone(), channel.clone());
            (channel, confirmed)
        };

        if let Err(err) = self
            .shared
            .outbox
            .send(&CableCommand::subscribe(&identifier))
            .await
        {
            self.shared.outbox.forget(&identifier);
            channel.close();
            return Err(err);
        }

        let limit = self.shared.options.subscribe_timeout();
        match timeout(limit, confirmed).await {
            Ok(Ok(true)) => Ok(channel),
            Ok(Ok(false)) => Err(CableError::SubscriptionRejected(identifier)),
            Ok(Err(_)) => Err(CableError::ConnectionClosed),
            Err(_) => {
                warn!(
                    "[{}] no confirmation for {identifier} within {}ms",
                    self.shared.label,
                    limit.as_millis()
                );
                self.shared.outbox.forget(&identifier);
                channel.close();
                Err(CableError::SubscribeTimeout(identifier))
            }
        }
    }

    pub async fn disconnect(&self) {
        self.shared.shut_down("client disconnect");

        let writer = lock(&self.writer).take();
        if let Some(mut writer) = writer {
            if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                debug!("[{}] writer did not finish, aborting", self.shared.label);
                writer.abort();
            }
        }
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.shut_down("connection dropped");
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    label: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Frame(frame) => {
                if let Err(err) = sink.send(frame).await {
                    warn!("[{label}] websocket write failed: {err}");
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(err) = sink.close().await {
        debug!("[{label}] websocket close: {err}");
    }
}

async fn read_loop<S>(mut stream: SplitStream<WebSocketStream<S>>, shared: Arc<ConnectionShared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!("[{}] websocket read failed: {err}", shared.label);
                break format!("transport error: {err}");
            }
            None => break "stream ended".to_owned(),
        };
        let codec = shared.options.codec;
        let decoded = match frame {
            WsMessage::Text(text) => codec.decode_text(&text),
            WsMessage::Binary(bytes) => codec.decode_binary(&bytes),
            WsMessage::Close(frame) => {
                break match frame {
                    Some(frame) => format!("server closed ({}): {}", frame.code, frame.reason),
                    None => "server closed".to_owned(),
                };
            }
            _ => continue,
        };
        if let Some(reason) = shared.handle_frame(decoded) {
            break reason;
        }
    };
    shared.shut_down(&reason);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) fn detached_outbox(capacity: usize) -> (Outbox, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(capacity);
    let outbox = Outbox {
        tx,
        codec: Codec::Json,
        stats: Arc::new(ConnectionStats::default()),
        registry: Weak::new(),
    };
    (outbox, rx)
}
