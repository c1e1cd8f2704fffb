//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::policy::{AccessMode, AccessPolicy, AccessRequest, AllowAll};
use crate::provider::{all_fields_mask, ChannelProvider, ChannelUpdate};
use crate::session::Session;
use crate::subscription::{self, ForwardedEvent, Subscription};
use bytes::{Buf, BufMut, BytesMut};
use pvlink_protocol::{
    CodecConfig, HelloBody, Message, MessageDecoder, MessageEncoder, Opcode, Status,
    PROTOCOL_VERSION,
};
use pvlink_types::wire::get_string;
use pvlink_types::{IncomingTypes, OutgoingTypes};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Capacity of the per-connection event channel from subscription tasks
/// to the connection writer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Runtime server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Framing parameters.
    pub codec: CodecConfig,
    /// Slots per subscription queue.
    pub monitor_queue_capacity: usize,
    /// Name announced in the HELLO handshake.
    pub server_name: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds runtime settings from a loaded configuration file.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            read_buffer_size: config.protocol.read_buffer_size,
            codec: config.protocol.codec(),
            monitor_queue_capacity: config.monitor.queue_capacity(),
            server_name: config.network.server_name.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server hosting channels from a [`ChannelProvider`].
pub struct Server {
    config: ServerConfig,
    provider: Arc<dyn ChannelProvider>,
    policy: Arc<dyn AccessPolicy>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server with the pass-through access policy.
    pub fn new(config: ServerConfig, provider: Arc<dyn ChannelProvider>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            provider,
            policy: Arc::new(AllowAll),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Replaces the access policy.
    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let provider = self.provider.clone();
                            let policy = self.policy.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = handle_connection(
                                    stream,
                                    addr,
                                    provider,
                                    policy,
                                    stats.clone(),
                                    config,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

/// Handles a single connection, including subscription event delivery.
///
/// The loop owns the socket, the codec state, and the connection's
/// introspection cache pair. Subscription tasks hand ready slots over the
/// event channel; encoding happens here so type-id assignment order always
/// matches wire order.
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    provider: Arc<dyn ChannelProvider>,
    policy: Arc<dyn AccessPolicy>,
    stats: Arc<ServerStats>,
    config: ServerConfig,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    tracing::info!("client connected: {}", addr);
    stream.set_nodelay(true).ok();

    let mut session = Session::new(addr);
    let encoder = MessageEncoder::new(config.codec);
    let mut decoder = MessageDecoder::new(config.codec);
    let mut outgoing = OutgoingTypes::new();
    let mut incoming = IncomingTypes::new();
    let mut buf = vec![0u8; config.read_buffer_size];

    let (event_tx, mut event_rx) = mpsc::channel::<ForwardedEvent>(EVENT_CHANNEL_CAPACITY);
    let mut subscriptions: HashMap<u32, Subscription> = HashMap::new();

    loop {
        tokio::select! {
            biased;

            Some(event) = event_rx.recv() => {
                let message = match encode_monitor_event(&mut outgoing, event) {
                    Ok(message) => message,
                    Err(e) => {
                        // Id space exhaustion or a provider value that no
                        // longer matches its descriptor; the cache cannot
                        // be trusted past this point
                        tracing::error!("[{}] monitor event encoding failed: {}", addr, e);
                        return Err(e.into());
                    }
                };
                write_message(&mut stream, &encoder, &message).await?;
            }

            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("[{}] connection closed by client", addr);
                        return Ok(());
                    }
                    Ok(n) => {
                        tracing::debug!("[{}] received {} bytes", addr, n);
                        decoder.extend(&buf[..n]);
                    }
                    Err(e) => {
                        return Err(ServerError::Io(e));
                    }
                }
            }

            _ = tokio::time::sleep(config.idle_timeout) => {
                if session.idle_duration() > config.idle_timeout {
                    tracing::debug!("[{}] idle timeout", addr);
                    return Ok(());
                }
            }

            _ = shutdown.recv() => {
                tracing::debug!("[{}] shutdown signal received", addr);
                return Err(ServerError::ShuttingDown);
            }
        }

        // Process any complete requests
        loop {
            let message = match decoder.next_message() {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    // Byte alignment is unrecoverable on a stream; close
                    tracing::warn!("[{}] protocol violation: {}", addr, e);
                    return Err(e.into());
                }
            };

            session.record_request();
            stats.requests_total.fetch_add(1, Ordering::Relaxed);

            let reply = match handle_message(
                message,
                &mut session,
                &mut outgoing,
                &mut incoming,
                provider.as_ref(),
                policy.as_ref(),
                &config,
                &event_tx,
                &mut subscriptions,
            ) {
                Ok(reply) => reply,
                Err(e) => return Err(e),
            };

            write_message(&mut stream, &encoder, &reply).await?;
        }
    }
}

/// Dispatches one request and produces its reply. Returning an error
/// closes the connection; recoverable problems are answered as error
/// statuses instead.
#[allow(clippy::too_many_arguments)]
fn handle_message(
    message: Message,
    session: &mut Session,
    outgoing: &mut OutgoingTypes,
    incoming: &mut IncomingTypes,
    provider: &dyn ChannelProvider,
    policy: &dyn AccessPolicy,
    config: &ServerConfig,
    event_tx: &mpsc::Sender<ForwardedEvent>,
    subscriptions: &mut HashMap<u32, Subscription>,
) -> Result<Message, ServerError> {
    let opcode = message.opcode;
    let mut buf = message.payload;
    if buf.remaining() < 4 {
        return Err(ServerError::InvalidRequest(
            "request with no identifier".to_string(),
        ));
    }
    let id = buf.get_u32();
    tracing::debug!(
        "[{}] request {:?} (id={})",
        session.remote_addr,
        opcode,
        id
    );

    if opcode == Opcode::MonitorEvent {
        return Err(ServerError::InvalidRequest(
            "monitor event from client".to_string(),
        ));
    }

    if opcode == Opcode::Hello {
        let hello = HelloBody::from_bytes(&buf)?;
        tracing::info!(
            "[{}] hello from {} (protocol v{})",
            session.remote_addr,
            hello.peer_name.as_deref().unwrap_or("unnamed client"),
            hello.protocol_version
        );
        if hello.protocol_version != PROTOCOL_VERSION {
            return Ok(reply(
                opcode,
                id,
                Status::error(format!(
                    "unsupported protocol version {}",
                    hello.protocol_version
                )),
            ));
        }
        session.complete_handshake(hello.protocol_version, hello.peer_name);
        let body = HelloBody {
            protocol_version: PROTOCOL_VERSION,
            peer_name: config.server_name.clone(),
        }
        .to_bytes()?;
        return Ok(reply_with(opcode, id, Status::ok(), &body));
    }

    if !session.is_ready() {
        return Ok(reply(opcode, id, Status::error("handshake required")));
    }

    match opcode {
        Opcode::Echo => Ok(reply_with(opcode, id, Status::ok(), &buf)),

        Opcode::ChannelGet => {
            let channel = match get_string(&mut buf) {
                Ok(channel) => channel,
                Err(e) => {
                    return Ok(reply(opcode, id, Status::error(format!("bad channel name: {e}"))))
                }
            };
            if !allowed(policy, session, &channel, AccessMode::Read) {
                return Ok(reply(opcode, id, Status::error("access denied")));
            }
            match (provider.descriptor(&channel), provider.read(&channel)) {
                (Some(descriptor), Some(value)) => {
                    let mut out = reply_head(id, &Status::ok());
                    outgoing.encode(&descriptor, &value, &mut out)?;
                    Ok(Message::new(opcode, out.freeze()))
                }
                _ => Ok(reply(
                    opcode,
                    id,
                    Status::error(format!("no such channel: {channel}")),
                )),
            }
        }

        Opcode::ChannelPut => {
            let channel = match get_string(&mut buf) {
                Ok(channel) => channel,
                Err(e) => {
                    return Ok(reply(opcode, id, Status::error(format!("bad channel name: {e}"))))
                }
            };
            if !allowed(policy, session, &channel, AccessMode::Write) {
                return Ok(reply(opcode, id, Status::error("access denied")));
            }
            let value = match incoming.decode(&mut buf) {
                Ok(Some((_, value))) => value,
                Ok(None) => {
                    return Ok(reply(opcode, id, Status::error("put carried no value")))
                }
                // Cache desync means the peers disagree about ids; the
                // connection cannot be trusted any further
                Err(e) if e.is_cache_desync() => return Err(e.into()),
                Err(e) => {
                    return Ok(reply(opcode, id, Status::error(format!("bad value: {e}"))))
                }
            };
            match provider.write(&channel, value) {
                Ok(()) => Ok(reply(opcode, id, Status::ok())),
                Err(e) => Ok(reply(opcode, id, Status::error(e.to_string()))),
            }
        }

        Opcode::MonitorStart => {
            let channel = match get_string(&mut buf) {
                Ok(channel) => channel,
                Err(e) => {
                    return Ok(reply(opcode, id, Status::error(format!("bad channel name: {e}"))))
                }
            };
            if !allowed(policy, session, &channel, AccessMode::Monitor) {
                return Ok(reply(opcode, id, Status::error("access denied")));
            }
            let (descriptor, value, receiver) = match (
                provider.descriptor(&channel),
                provider.read(&channel),
                provider.subscribe(&channel),
            ) {
                (Some(descriptor), Some(value), Some(receiver)) => (descriptor, value, receiver),
                _ => {
                    return Ok(reply(
                        opcode,
                        id,
                        Status::error(format!("no such channel: {channel}")),
                    ))
                }
            };

            let initial = ChannelUpdate {
                changed: all_fields_mask(&descriptor),
                value,
            };
            let sub = subscription::spawn(
                id,
                descriptor,
                initial,
                receiver,
                config.monitor_queue_capacity,
                event_tx.clone(),
            );
            subscriptions.insert(id, sub);
            session.add_subscription(id, &channel);
            tracing::debug!(
                "[{}] subscription {} on '{}' started",
                session.remote_addr,
                id,
                channel
            );
            Ok(reply(opcode, id, Status::ok()))
        }

        Opcode::MonitorStop => {
            if buf.remaining() < 4 {
                return Ok(reply(opcode, id, Status::error("missing subscription id")));
            }
            let sub_id = buf.get_u32();
            match subscriptions.remove(&sub_id) {
                Some(sub) => {
                    sub.abort();
                    session.remove_subscription(sub_id);
                    tracing::debug!(
                        "[{}] subscription {} stopped",
                        session.remote_addr,
                        sub_id
                    );
                    Ok(reply(opcode, id, Status::ok()))
                }
                None => Ok(reply(
                    opcode,
                    id,
                    Status::error(format!("unknown subscription: {sub_id}")),
                )),
            }
        }

        Opcode::Hello | Opcode::MonitorEvent => unreachable!("handled above"),
    }
}

fn allowed(policy: &dyn AccessPolicy, session: &Session, channel: &str, mode: AccessMode) -> bool {
    policy.allow(&AccessRequest {
        channel,
        mode,
        peer: session.peer_name(),
    })
}

fn reply_head(id: u32, status: &Status) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u32(id);
    status.encode(&mut out);
    out
}

fn reply(opcode: Opcode, id: u32, status: Status) -> Message {
    Message::new(opcode, reply_head(id, &status).freeze())
}

fn reply_with(opcode: Opcode, id: u32, status: Status, body: &[u8]) -> Message {
    let mut out = reply_head(id, &status);
    out.put_slice(body);
    Message::new(opcode, out.freeze())
}

fn encode_monitor_event(
    outgoing: &mut OutgoingTypes,
    event: ForwardedEvent,
) -> Result<Message, pvlink_types::TypeError> {
    let mut out = BytesMut::new();
    out.put_u32(event.sub_id);
    event.changed.encode(&mut out);
    event.overrun.encode(&mut out);
    outgoing.encode(&event.descriptor, &event.value, &mut out)?;
    Ok(Message::new(Opcode::MonitorEvent, out.freeze()))
}

async fn write_message(
    stream: &mut TcpStream,
    encoder: &MessageEncoder,
    message: &Message,
) -> Result<(), ServerError> {
    let mut out = BytesMut::new();
    encoder.encode(message, &mut out);
    stream.write_all(&out).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticProvider;
    use bytes::Bytes;
    use pvlink_client::{ClientError, Connection, ConnectionConfig};
    use pvlink_types::{Descriptor, Scalar, ScalarKind, Value};
    use std::time::Duration;

    fn reading_descriptor() -> Arc<Descriptor> {
        Arc::new(Descriptor::Structure {
            name: "reading_t".to_string(),
            fields: vec![
                (
                    "value".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Float64)),
                ),
                (
                    "severity".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Int32)),
                ),
            ],
        })
    }

    fn reading(v: f64, severity: i32) -> Value {
        Value::Structure(vec![
            Value::Scalar(Scalar::Float64(v)),
            Value::Scalar(Scalar::Int32(severity)),
        ])
    }

    fn demo_provider() -> Arc<StaticProvider> {
        let provider = Arc::new(StaticProvider::new());
        provider.add_channel("beam:current", reading_descriptor(), reading(101.5, 0));
        provider
    }

    async fn start_server(provider: Arc<StaticProvider>) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(ServerConfig::new(addr), provider));
        {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(listener).await.ok();
            });
        }
        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Connection {
        Connection::connect(
            ConnectionConfig::new(addr)
                .with_client_name("test-client")
                .with_request_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (server, addr) = start_server(demo_provider()).await;
        let conn = connect(addr).await;

        let reply = conn.echo(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(reply.as_ref(), b"ping");

        conn.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_put_get() {
        let (server, addr) = start_server(demo_provider()).await;
        let conn = connect(addr).await;

        let (descriptor, value) = conn.get("beam:current").await.unwrap();
        assert_eq!(*descriptor, *reading_descriptor());
        assert_eq!(value, reading(101.5, 0));

        conn.put("beam:current", &descriptor, &reading(99.0, 1))
            .await
            .unwrap();

        // The second get reuses the cached type id in both directions
        let (_, after) = conn.get("beam:current").await.unwrap();
        assert_eq!(after, reading(99.0, 1));

        conn.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_get_unknown_channel() {
        let (server, addr) = start_server(demo_provider()).await;
        let conn = connect(addr).await;

        let result = conn.get("no:such:channel").await;
        assert!(matches!(result, Err(ClientError::Server(_))));

        conn.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_monitor_initial_snapshot_and_updates() {
        let provider = demo_provider();
        let (server, addr) = start_server(provider.clone()).await;
        let conn = connect(addr).await;

        let monitor = conn.monitor("beam:current").await.unwrap();

        // First event is the current snapshot with every field marked
        let first = monitor.next().await.unwrap();
        assert_eq!(first.value, reading(101.5, 0));
        assert!(first.changed.get(0) && first.changed.get(1));
        assert!(first.overrun.is_empty());

        // Post an update from the data source side
        let mut changed = pvlink_types::BitSet::new();
        changed.set(0);
        provider
            .post("beam:current", reading(102.0, 0), &changed)
            .unwrap();

        let second = tokio::time::timeout(Duration::from_secs(5), monitor.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.value, reading(102.0, 0));
        assert!(second.changed.get(0));
        assert!(second.overrun.is_subset_of(&second.changed));

        monitor.stop().await.unwrap();
        conn.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_monitor_unknown_channel() {
        let (server, addr) = start_server(demo_provider()).await;
        let conn = connect(addr).await;

        let result = conn.monitor("no:such:channel").await;
        assert!(matches!(result, Err(ClientError::Server(_))));

        conn.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_monitor_ends() {
        let (server, addr) = start_server(demo_provider()).await;
        let conn = connect(addr).await;
        let monitor = conn.monitor("beam:current").await.unwrap();

        // Drain the initial snapshot, then close underneath the monitor
        let _ = monitor.next().await.unwrap();
        conn.close();

        let next = tokio::time::timeout(Duration::from_secs(5), monitor.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(!conn.is_connected());
        assert_eq!(conn.pending_requests(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_server_stats_and_shutdown() {
        let (server, addr) = start_server(demo_provider()).await;
        let conn = connect(addr).await;
        conn.echo(Bytes::from_static(b"x")).await.unwrap();

        assert!(server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        assert!(server.stats().requests_total.load(Ordering::Relaxed) >= 2);

        conn.close();
        server.shutdown();
    }
}
