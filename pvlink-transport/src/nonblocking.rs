//! Non-blocking discipline: per-connection tasks on the shared runtime.
//!
//! The tokio reactor is the central readiness poller: the reader task
//! awaits readability, the writer task awaits writability, and neither
//! ever blocks a shared thread. A socket that refuses bytes parks the
//! writer task in the reactor until the next writable notification, it
//! does not spin. `send` is a plain enqueue onto a channel and is not
//! async, so it can be called from anywhere.

use crate::error::TransportError;
use crate::{CloseReason, TransportConfig, TransportHandler};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use pvlink_protocol::{Message, MessageDecoder, MessageEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Shared {
    handler: Arc<dyn TransportHandler>,
    notified: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Stops both tasks and delivers `reason` exactly once. Aborting the
    /// current task from inside it only takes effect at its next await,
    /// after the caller has already returned.
    fn finish(&self, reason: CloseReason) {
        if !self.notified.swap(true, Ordering::SeqCst) {
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            tracing::debug!("connection closed: {:?}", reason);
            self.handler.on_closed(reason);
        }
    }

    fn is_closed(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

/// Shared-runtime transport over a `tokio::net::TcpStream`.
pub struct NonBlockingTransport {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Bytes>,
    encoder: MessageEncoder,
}

impl NonBlockingTransport {
    /// Takes ownership of a connected stream and spawns the reader and
    /// writer tasks on the current runtime.
    pub fn spawn(
        stream: TcpStream,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Self {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            handler,
            notified: AtomicBool::new(false),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let reader = tokio::spawn(read_loop(read_half, config, shared.clone()));
        let writer = tokio::spawn(write_loop(write_half, receiver, shared.clone()));
        shared.tasks.lock().extend([reader, writer]);

        Self {
            shared,
            sender,
            encoder: MessageEncoder::new(config.codec),
        }
    }

    /// Enqueues a message for transmission and returns immediately; this
    /// is deliberately not async. Unwritable-socket periods park the
    /// writer task in the reactor, never the caller.
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut out = BytesMut::new();
        self.encoder.encode(message, &mut out);
        self.sender
            .send(out.freeze())
            .map_err(|_| TransportError::Closed)
    }

    /// Closes the connection. Idempotent, callable from any thread or
    /// task; both transport tasks stop and the handler hears the close
    /// exactly once.
    pub fn close(&self) {
        self.shared.finish(CloseReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, config: TransportConfig, shared: Arc<Shared>) {
    let mut decoder = MessageDecoder::new(config.codec);
    let mut buf = vec![0u8; config.read_buffer_size];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                shared.finish(CloseReason::PeerClosed);
                return;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => shared.handler.on_message(message),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("protocol violation, closing: {}", e);
                            shared.finish(CloseReason::ProtocolViolation(e.to_string()));
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                shared.finish(CloseReason::Io(e.to_string()));
                return;
            }
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
) {
    while let Some(chunk) = receiver.recv().await {
        if let Err(e) = write_half.write_all(&chunk).await {
            shared.finish(CloseReason::Io(e.to_string()));
            return;
        }
    }
}
