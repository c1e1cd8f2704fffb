//! Session management.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for HELLO.
    Connected,
    /// Handshake complete, ready for requests.
    Ready,
}

/// A client session.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    /// Negotiated protocol version.
    protocol_version: u16,

    /// Peer name from HELLO.
    peer_name: Option<String>,

    /// Request counter.
    request_count: AtomicU64,

    /// Session creation time.
    created_at: Instant,

    /// Last activity time.
    last_activity: parking_lot::Mutex<Instant>,

    /// Active subscriptions: subscription id -> channel name.
    subscriptions: parking_lot::Mutex<HashMap<u32, String>>,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Connected,
            protocol_version: 0,
            peer_name: None,
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            subscriptions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns whether the HELLO handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Returns the negotiated protocol version.
    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    /// Returns the peer name.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }

    /// Completes the handshake.
    pub fn complete_handshake(&mut self, protocol_version: u16, peer_name: Option<String>) {
        self.protocol_version = protocol_version;
        self.peer_name = peer_name;
        self.state = SessionState::Ready;
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Returns the request count.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Tracks a subscription on this session.
    pub fn add_subscription(&self, subscription_id: u32, channel: impl Into<String>) {
        self.subscriptions
            .lock()
            .insert(subscription_id, channel.into());
    }

    /// Removes a subscription; returns whether it existed.
    pub fn remove_subscription(&self, subscription_id: u32) -> bool {
        self.subscriptions.lock().remove(&subscription_id).is_some()
    }

    /// The channel a subscription watches.
    pub fn subscription_channel(&self, subscription_id: u32) -> Option<String> {
        self.subscriptions.lock().get(&subscription_id).cloned()
    }

    /// Active subscription ids.
    pub fn subscription_ids(&self) -> Vec<u32> {
        self.subscriptions.lock().keys().copied().collect()
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}
