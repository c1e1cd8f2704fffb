//! # pvlink-transport
//!
//! The two I/O disciplines carrying PVP messages over TCP:
//! - [`blocking`]: one dedicated reader thread and one writer thread per
//!   connection over `std::net::TcpStream`; the writer retries a full OS
//!   send buffer with bounded exponential backoff
//! - [`nonblocking`]: per-connection tasks on the shared tokio runtime,
//!   whose reactor plays the role of the central readiness poller; codec
//!   code never blocks a shared thread
//!
//! Both expose the same contract: `send` enqueues and returns immediately,
//! and the [`TransportHandler`] sees each fully reassembled message exactly
//! once, in the order sent. Close is idempotent from any thread and wakes
//! anything blocked on the socket.

pub mod backoff;
pub mod blocking;
pub mod error;
pub mod nonblocking;

pub use backoff::{Backoff, BackoffConfig};
pub use blocking::BlockingTransport;
pub use error::TransportError;
pub use nonblocking::NonBlockingTransport;

use pvlink_protocol::{CodecConfig, Message};

/// Default socket read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Knobs shared by both disciplines.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Framing parameters (segment capacity, max message size).
    pub codec: CodecConfig,
    /// Socket read buffer size.
    pub read_buffer_size: usize,
    /// Retry bounds for the blocking writer when the OS send buffer is
    /// full; the non-blocking writer parks in the reactor instead.
    pub backoff: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Why a connection stopped. Delivered to the handler exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Close was requested on this side.
    Local,
    /// The peer shut the stream down cleanly.
    PeerClosed,
    /// A wire-level violation; stream transports cannot recover alignment.
    ProtocolViolation(String),
    /// The socket failed.
    Io(String),
}

/// Receives decoded messages and the final close notification.
///
/// Callbacks run on transport threads (or tasks) and must not block;
/// hand work off through a channel if it can take time.
pub trait TransportHandler: Send + Sync + 'static {
    /// Called once per fully reassembled message, in receive order.
    fn on_message(&self, message: Message);

    /// Called exactly once when the connection stops, whatever the cause.
    fn on_closed(&self, reason: CloseReason);
}
