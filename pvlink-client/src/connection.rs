//! Connection management.
//!
//! A [`Connection`] owns one non-blocking transport, one request
//! correlation registry, and one introspection cache pair. Requests are
//! multiplexed: any number of `get`/`put`/`monitor` calls may be in flight
//! at once, each correlated by the registry and bounded by the configured
//! request timeout. A timeout cancels the local bookkeeping only; a late
//! response is silently dropped.
//!
//! Connections are single-use. Reconnecting means building a new
//! `Connection`, which starts both type caches empty; ids never survive
//! a reconnect.

use crate::error::ClientError;
use crate::monitor::{EventItem, Monitor, MonitorSink};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use pvlink_core::{Completion, MonitorQueue, RequestId, RequestRegistry};
use pvlink_protocol::{HelloBody, Message, Opcode, Status};
use pvlink_transport::{CloseReason, NonBlockingTransport, TransportConfig, TransportHandler};
use pvlink_types::wire::put_string;
use pvlink_types::{BitSet, Descriptor, IncomingTypes, OutgoingTypes, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};

/// Default monitor queue capacity per subscription.
pub const DEFAULT_MONITOR_QUEUE_CAPACITY: usize = 16;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Per-request timeout; the caller cancels locally when it expires.
    pub request_timeout: Duration,
    /// Client name for HELLO.
    pub client_name: Option<String>,
    /// Transport and framing knobs.
    pub transport: TransportConfig,
    /// Monitor queue capacity per subscription (minimum 2).
    pub monitor_queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: None,
            transport: TransportConfig::default(),
            monitor_queue_capacity: DEFAULT_MONITOR_QUEUE_CAPACITY,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_monitor_queue_capacity(mut self, capacity: usize) -> Self {
        self.monitor_queue_capacity = capacity.max(pvlink_core::monitor::MIN_CAPACITY);
        self
    }
}

/// One decoded response, delivered through the registry.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) status: Status,
    pub(crate) value: Option<(Arc<Descriptor>, Value)>,
    pub(crate) raw: Bytes,
}

pub(crate) struct ConnState {
    pub(crate) registry: RequestRegistry<Reply>,
    pub(crate) outgoing: Mutex<OutgoingTypes>,
    incoming: Mutex<IncomingTypes>,
    pub(crate) monitors: Mutex<HashMap<RequestId, MonitorSink>>,
    pub(crate) connected: AtomicBool,
    pub(crate) transport: OnceLock<NonBlockingTransport>,
    pub(crate) request_timeout: Duration,
    /// Serializes type-id assignment with the send enqueue: the receiver
    /// must see a full definition before any id-only reference to it, so
    /// encode order has to match wire order.
    send_lock: Mutex<()>,
}

/// Opens a request, sends it, and waits for the terminal completion with
/// the connection's request timeout. Shared by [`Connection`] and
/// [`Monitor`].
pub(crate) async fn roundtrip<F>(
    state: &Arc<ConnState>,
    opcode: Opcode,
    build: F,
) -> Result<Reply, ClientError>
where
    F: FnOnce(RequestId, &mut BytesMut) -> Result<(), ClientError>,
{
    if !state.connected.load(Ordering::SeqCst) {
        return Err(ClientError::NotConnected);
    }
    let transport = state.transport.get().ok_or(ClientError::NotConnected)?;

    let (tx, rx) = oneshot::channel();
    let id = state.registry.open(Box::new(move |completion| {
        let _ = tx.send(completion);
    }));

    {
        let _ordered = state.send_lock.lock();
        let mut buf = BytesMut::new();
        buf.put_u32(id);
        if let Err(e) = build(id, &mut buf) {
            drop(_ordered);
            state.registry.cancel(id);
            return Err(e);
        }
        if let Err(e) = transport.send(&Message::new(opcode, buf.freeze())) {
            drop(_ordered);
            state.registry.cancel(id);
            return Err(e.into());
        }
    }

    match tokio::time::timeout(state.request_timeout, rx).await {
        Err(_) => {
            // Local deadline expired: remove the bookkeeping. A response
            // still in flight will find no waiter and be dropped.
            state.registry.cancel(id);
            Err(ClientError::Timeout)
        }
        Ok(Err(_)) => Err(ClientError::ConnectionLost("waiter dropped".to_string())),
        Ok(Ok(Completion::Response(reply))) => Ok(reply),
        Ok(Ok(Completion::Cancelled)) => Err(ClientError::Cancelled),
        Ok(Ok(Completion::Failed(reason))) => Err(ClientError::ConnectionLost(reason)),
    }
}

fn status_text(status: &Status) -> String {
    status
        .message
        .clone()
        .unwrap_or_else(|| "unspecified server error".to_string())
}

/// Dispatches decoded messages from the transport threads: responses to
/// the registry, monitor events to their subscription's queue.
struct ConnectionHandler {
    state: Arc<ConnState>,
}

impl ConnectionHandler {
    fn on_reply(&self, message: Message) {
        let mut buf = message.payload;
        if buf.remaining() < 4 {
            tracing::warn!("response with no request id, dropping");
            return;
        }
        let id = buf.get_u32();
        let status = match Status::decode(&mut buf) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("undecodable status for request id={}: {}", id, e);
                return;
            }
        };

        let value = if message.opcode == Opcode::ChannelGet && status.is_ok() && buf.has_remaining()
        {
            match self.state.incoming.lock().decode(&mut buf) {
                Ok(value) => value,
                Err(e) => {
                    // The waiter still gets its terminal notification
                    let fatal = e.is_cache_desync();
                    self.state.registry.complete(
                        id,
                        Reply {
                            status: Status::error(format!("value decode failed: {e}")),
                            value: None,
                            raw: Bytes::new(),
                        },
                    );
                    if fatal {
                        tracing::error!("type cache desynchronized, closing connection: {}", e);
                        if let Some(transport) = self.state.transport.get() {
                            transport.close();
                        }
                    }
                    return;
                }
            }
        } else {
            None
        };

        let raw = buf.copy_to_bytes(buf.remaining());
        self.state.registry.complete(id, Reply { status, value, raw });
    }

    fn on_monitor_event(&self, payload: Bytes) {
        let mut buf = payload;
        if buf.remaining() < 4 {
            tracing::warn!("monitor event with no subscription id, dropping");
            return;
        }
        let sub_id = buf.get_u32();
        let (changed, overrun) = match (BitSet::decode(&mut buf), BitSet::decode(&mut buf)) {
            (Ok(changed), Ok(overrun)) => (changed, overrun),
            _ => {
                tracing::warn!("undecodable masks for subscription id={}", sub_id);
                return;
            }
        };

        match self.state.incoming.lock().decode(&mut buf) {
            Ok(Some((descriptor, value))) => {
                let monitors = self.state.monitors.lock();
                if let Some(sink) = monitors.get(&sub_id) {
                    sink.queue.update(
                        EventItem {
                            descriptor,
                            value,
                            server_overrun: overrun,
                        },
                        &changed,
                    );
                    sink.notify.notify_one();
                } else {
                    // Stopped locally while events were still in flight
                    tracing::debug!("event for unknown subscription id={}", sub_id);
                }
            }
            Ok(None) => {
                tracing::debug!("empty monitor event for subscription id={}", sub_id);
            }
            Err(e) => {
                if e.is_cache_desync() {
                    tracing::error!("type cache desynchronized, closing connection: {}", e);
                    if let Some(transport) = self.state.transport.get() {
                        transport.close();
                    }
                } else {
                    tracing::warn!("undecodable monitor event: {}", e);
                }
            }
        }
    }
}

impl TransportHandler for ConnectionHandler {
    fn on_message(&self, message: Message) {
        match message.opcode {
            Opcode::MonitorEvent => self.on_monitor_event(message.payload),
            _ => self.on_reply(message),
        }
    }

    fn on_closed(&self, reason: CloseReason) {
        self.state.connected.store(false, Ordering::SeqCst);
        let text = match reason {
            CloseReason::Local => "connection closed".to_string(),
            CloseReason::PeerClosed => "connection closed by server".to_string(),
            CloseReason::ProtocolViolation(e) => format!("protocol violation: {e}"),
            CloseReason::Io(e) => format!("I/O error: {e}"),
        };
        self.state.registry.fail_all(&text);
        // Wake every monitor consumer so it observes the close
        for sink in self.state.monitors.lock().values() {
            sink.notify.notify_waiters();
        }
    }
}

/// A connection to a pvlink server.
pub struct Connection {
    config: ConnectionConfig,
    state: Arc<ConnState>,
}

impl Connection {
    /// Connects, spawns the transport, and performs the HELLO handshake.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        tracing::debug!("connecting to {}", config.addr);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| ClientError::Timeout)??;

        let state = Arc::new(ConnState {
            registry: RequestRegistry::new(),
            outgoing: Mutex::new(OutgoingTypes::new()),
            incoming: Mutex::new(IncomingTypes::new()),
            monitors: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            transport: OnceLock::new(),
            request_timeout: config.request_timeout,
            send_lock: Mutex::new(()),
        });

        let handler = Arc::new(ConnectionHandler {
            state: state.clone(),
        });
        let transport = NonBlockingTransport::spawn(stream, config.transport, handler);
        state
            .transport
            .set(transport)
            .unwrap_or_else(|_| unreachable!("transport installed once"));

        let conn = Self { config, state };
        if let Err(e) = conn.handshake().await {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let body = HelloBody::new(self.config.client_name.clone()).to_bytes()?;
        let reply = roundtrip(&self.state, Opcode::Hello, move |_, buf| {
            buf.put_slice(&body);
            Ok(())
        })
        .await?;
        if !reply.status.is_ok() {
            return Err(ClientError::Server(status_text(&reply.status)));
        }
        let server = HelloBody::from_bytes(&reply.raw)?;
        tracing::info!(
            "connected to {} (protocol v{})",
            server.peer_name.as_deref().unwrap_or("unnamed server"),
            server.protocol_version
        );
        Ok(())
    }

    /// Reads a channel's current value.
    pub async fn get(&self, channel: &str) -> Result<(Arc<Descriptor>, Value), ClientError> {
        let reply = roundtrip(&self.state, Opcode::ChannelGet, |_, buf| {
            put_string(buf, channel);
            Ok(())
        })
        .await?;
        if !reply.status.is_ok() {
            return Err(ClientError::Server(status_text(&reply.status)));
        }
        reply.value.ok_or(ClientError::MissingValue)
    }

    /// Writes a channel's value.
    pub async fn put(
        &self,
        channel: &str,
        descriptor: &Arc<Descriptor>,
        value: &Value,
    ) -> Result<(), ClientError> {
        let reply = roundtrip(&self.state, Opcode::ChannelPut, |_, buf| {
            put_string(buf, channel);
            self.state.outgoing.lock().encode(descriptor, value, buf)?;
            Ok(())
        })
        .await?;
        if !reply.status.is_ok() {
            return Err(ClientError::Server(status_text(&reply.status)));
        }
        Ok(())
    }

    /// Diagnostic echo; the server returns the payload verbatim.
    pub async fn echo(&self, data: Bytes) -> Result<Bytes, ClientError> {
        let reply = roundtrip(&self.state, Opcode::Echo, |_, buf| {
            buf.put_slice(&data);
            Ok(())
        })
        .await?;
        if !reply.status.is_ok() {
            return Err(ClientError::Server(status_text(&reply.status)));
        }
        Ok(reply.raw)
    }

    /// Starts a subscription and returns the consumer handle.
    ///
    /// The request id doubles as the subscription id, and the sink is
    /// registered before the request leaves so the first event cannot
    /// outrun it.
    pub async fn monitor(&self, channel: &str) -> Result<Monitor, ClientError> {
        let queue = Arc::new(MonitorQueue::new(self.config.monitor_queue_capacity));
        let notify = Arc::new(Notify::new());
        let sink = MonitorSink {
            queue: queue.clone(),
            notify: notify.clone(),
        };

        let sub_id = std::cell::Cell::new(0);
        let result = roundtrip(&self.state, Opcode::MonitorStart, |id, buf| {
            sub_id.set(id);
            self.state.monitors.lock().insert(id, sink);
            put_string(buf, channel);
            Ok(())
        })
        .await;
        let sub_id = sub_id.get();

        match result {
            Ok(reply) if reply.status.is_ok() => Ok(Monitor::new(
                self.state.clone(),
                sub_id,
                queue,
                notify,
            )),
            Ok(reply) => {
                self.state.monitors.lock().remove(&sub_id);
                Err(ClientError::Server(status_text(&reply.status)))
            }
            Err(e) => {
                if sub_id != 0 {
                    self.state.monitors.lock().remove(&sub_id);
                }
                Err(e)
            }
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.state.registry.len()
    }

    /// Closes the connection. Idempotent; every pending request fails with
    /// a connection-lost notification, delivered exactly once.
    pub fn close(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        if let Some(transport) = self.state.transport.get() {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new("127.0.0.1:5085".parse().unwrap());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.monitor_queue_capacity, DEFAULT_MONITOR_QUEUE_CAPACITY);
        assert!(config.client_name.is_none());
    }

    #[test]
    fn test_config_builders() {
        let config = ConnectionConfig::new("127.0.0.1:5085".parse().unwrap())
            .with_client_name("beamline-7")
            .with_request_timeout(Duration::from_secs(2))
            .with_monitor_queue_capacity(0);
        assert_eq!(config.client_name.as_deref(), Some("beamline-7"));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        // Clamped to the queue minimum
        assert_eq!(config.monitor_queue_capacity, 2);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(&Status::error("no such channel")), "no such channel");
        assert!(status_text(&Status::ok()).contains("unspecified"));
    }
}
