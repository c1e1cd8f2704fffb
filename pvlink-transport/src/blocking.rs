//! Blocking discipline: one reader thread and one writer thread per
//! connection.
//!
//! The reader blocks in `read` until bytes arrive and feeds the decoder;
//! the writer blocks on a condvar until the send queue has work, then
//! pushes bytes into the socket, sleeping with bounded exponential backoff
//! whenever the OS send buffer refuses them. `send` only enqueues, so the
//! caller never touches the socket. Closing shuts the socket down in both
//! directions, which is what actually wakes the two threads.

use crate::backoff::Backoff;
use crate::error::TransportError;
use crate::{CloseReason, TransportConfig, TransportHandler};
use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use pvlink_protocol::{Message, MessageDecoder, MessageEncoder};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

struct SendQueue {
    chunks: VecDeque<Bytes>,
    bytes: usize,
}

struct Shared {
    stream: TcpStream,
    queue: Mutex<SendQueue>,
    queue_cv: Condvar,
    handler: Arc<dyn TransportHandler>,
    /// Set once a local close was requested, so socket errors that follow
    /// are reported as a local close rather than I/O failures.
    closing: AtomicBool,
    /// Guards the single on_closed delivery.
    notified: AtomicBool,
}

impl Shared {
    /// Tears the connection down and delivers `reason` exactly once.
    /// Safe to call from either thread or an external caller.
    fn finish(&self, reason: CloseReason) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.queue_cv.notify_all();
        if !self.notified.swap(true, Ordering::SeqCst) {
            tracing::debug!("connection closed: {:?}", reason);
            self.handler.on_closed(reason);
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Thread-pair transport over a `std::net::TcpStream`.
pub struct BlockingTransport {
    shared: Arc<Shared>,
    encoder: MessageEncoder,
}

impl BlockingTransport {
    /// Takes ownership of a connected stream and starts the reader and
    /// writer threads. `handler` sees every reassembled message and the
    /// final close notification.
    pub fn spawn(
        stream: TcpStream,
        config: TransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true).ok();
        let reader_stream = stream.try_clone()?;

        let shared = Arc::new(Shared {
            stream,
            queue: Mutex::new(SendQueue {
                chunks: VecDeque::new(),
                bytes: 0,
            }),
            queue_cv: Condvar::new(),
            handler,
            closing: AtomicBool::new(false),
            notified: AtomicBool::new(false),
        });

        {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pvlink-read".to_string())
                .spawn(move || read_loop(reader_stream, config, shared))?;
        }
        {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pvlink-write".to_string())
                .spawn(move || write_loop(config, shared))?;
        }

        Ok(Self {
            shared,
            encoder: MessageEncoder::new(config.codec),
        })
    }

    /// Enqueues a message for transmission and returns immediately.
    /// Backpressure is applied at the socket by the writer thread, not
    /// here; [`queued_bytes`] exposes the queue depth to callers that want
    /// their own throttling.
    ///
    /// [`queued_bytes`]: BlockingTransport::queued_bytes
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.shared.is_closing() {
            return Err(TransportError::Closed);
        }
        let mut out = BytesMut::new();
        self.encoder.encode(message, &mut out);
        let chunk = out.freeze();

        let mut queue = self.shared.queue.lock();
        queue.bytes += chunk.len();
        queue.chunks.push_back(chunk);
        drop(queue);
        self.shared.queue_cv.notify_one();
        Ok(())
    }

    /// Bytes accepted by [`send`] but not yet written to the socket.
    ///
    /// [`send`]: BlockingTransport::send
    pub fn queued_bytes(&self) -> usize {
        self.shared.queue.lock().bytes
    }

    /// Closes the connection. Idempotent, callable from any thread
    /// (including the handler), and wakes both transport threads.
    pub fn close(&self) {
        self.shared.finish(CloseReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }
}

fn read_loop(mut stream: TcpStream, config: TransportConfig, shared: Arc<Shared>) {
    let mut decoder = MessageDecoder::new(config.codec);
    let mut buf = vec![0u8; config.read_buffer_size];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                let reason = if shared.is_closing() {
                    CloseReason::Local
                } else {
                    CloseReason::PeerClosed
                };
                shared.finish(reason);
                return;
            }
            Ok(n) => {
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => shared.handler.on_message(message),
                        Ok(None) => break,
                        Err(e) => {
                            // Stream alignment is unrecoverable
                            tracing::warn!("protocol violation, closing: {}", e);
                            shared.finish(CloseReason::ProtocolViolation(e.to_string()));
                            return;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let reason = if shared.is_closing() {
                    CloseReason::Local
                } else {
                    CloseReason::Io(e.to_string())
                };
                shared.finish(reason);
                return;
            }
        }
    }
}

fn write_loop(config: TransportConfig, shared: Arc<Shared>) {
    let mut backoff = Backoff::new(config.backoff);
    loop {
        let chunk = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.is_closing() {
                    return;
                }
                if let Some(chunk) = queue.chunks.pop_front() {
                    queue.bytes -= chunk.len();
                    break chunk;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        let mut offset = 0;
        while offset < chunk.len() {
            if shared.is_closing() {
                return;
            }
            match (&shared.stream).write(&chunk[offset..]) {
                Ok(0) => {
                    shared.finish(CloseReason::Io("write returned zero bytes".to_string()));
                    return;
                }
                Ok(n) => {
                    offset += n;
                    backoff.reset();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // OS send buffer is full; transient, never surfaced
                    thread::sleep(backoff.next_delay());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let reason = if shared.is_closing() {
                        CloseReason::Local
                    } else {
                        CloseReason::Io(e.to_string())
                    };
                    shared.finish(reason);
                    return;
                }
            }
        }
    }
}
