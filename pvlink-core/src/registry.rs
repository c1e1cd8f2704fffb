//! Request correlation registry.
//!
//! One connection multiplexes arbitrarily many in-flight request/response
//! exchanges. The registry hands out identifiers, remembers who is waiting
//! on each, and guarantees every waiter exactly one terminal notification:
//! a response, a cancellation, or a connection-loss failure. Late or
//! duplicate responses for identifiers no longer registered are silently
//! dropped.
//!
//! Timeout policy is caller-driven: the registry never schedules its own
//! timers. A caller wanting a deadline pairs [`open`] with its own timer
//! and calls [`cancel`] if no completion arrives in time.
//!
//! [`open`]: RequestRegistry::open
//! [`cancel`]: RequestRegistry::cancel

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-connection integer correlating a request with its response.
pub type RequestId = u32;

/// Terminal notification delivered to a waiter, exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    /// The matching response arrived.
    Response(T),
    /// The caller gave up locally; a late response will be discarded.
    Cancelled,
    /// The connection was lost with every listed request still in flight.
    Failed(String),
}

/// Callback invoked with a waiter's single terminal notification.
pub type Waiter<T> = Box<dyn FnOnce(Completion<T>) + Send>;

struct Inner<T> {
    next_id: RequestId,
    pending: HashMap<RequestId, Waiter<T>>,
}

/// Tracks identifiers for in-flight requests and routes completions to the
/// right waiter.
///
/// Waiters are boxed callbacks so both disciplines share one registry: the
/// async client hands in a oneshot sender, blocking callers a
/// [`SyncWaiter`]. Callbacks run outside the registry lock and must not
/// block the calling thread; they fire on whatever thread delivers the
/// completion.
pub struct RequestRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for RequestRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
            }),
        }
    }

    /// Allocates a fresh identifier, not currently in use on this
    /// connection, and associates it with `waiter`. The caller embeds the
    /// id in the outgoing request.
    ///
    /// Identifier 0 is never handed out; allocation wraps around and skips
    /// live ids. Panics if every identifier is in flight at once, which is
    /// a caller bug long before 2^32 concurrent requests.
    pub fn open(&self, waiter: Waiter<T>) -> RequestId {
        let mut inner = self.inner.lock();
        let mut probes: u64 = 0;
        loop {
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1).max(1);
            if !inner.pending.contains_key(&id) {
                inner.pending.insert(id, waiter);
                return id;
            }
            probes += 1;
            assert!(
                probes <= RequestId::MAX as u64,
                "request identifier space exhausted"
            );
        }
    }

    /// Delivers `result` to the waiter for `id` and removes the mapping.
    ///
    /// Returns whether a waiter was notified. An unknown or already-removed
    /// id is a no-op: late and duplicate network responses are expected
    /// and must not raise.
    pub fn complete(&self, id: RequestId, result: T) -> bool {
        let waiter = self.inner.lock().pending.remove(&id);
        match waiter {
            Some(waiter) => {
                waiter(Completion::Response(result));
                true
            }
            None => {
                tracing::debug!("dropping completion for unknown request id={}", id);
                false
            }
        }
    }

    /// Removes the mapping for `id` and notifies the waiter of
    /// cancellation if it had not already completed.
    pub fn cancel(&self, id: RequestId) -> bool {
        let waiter = self.inner.lock().pending.remove(&id);
        match waiter {
            Some(waiter) => {
                waiter(Completion::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Fails every still-registered waiter with `reason` and clears the
    /// registry. Called on connection loss; safe to race with
    /// [`complete`]/[`open`]/[`cancel`], and each waiter still sees
    /// exactly one terminal notification.
    ///
    /// [`complete`]: RequestRegistry::complete
    /// [`open`]: RequestRegistry::open
    /// [`cancel`]: RequestRegistry::cancel
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(RequestId, Waiter<T>)> = {
            let mut inner = self.inner.lock();
            inner.pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!("failing {} pending requests: {}", drained.len(), reason);
        }
        for (_, waiter) in drained {
            waiter(Completion::Failed(reason.to_string()));
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }
}

/// Blocking-discipline waiter: parks the calling thread until its
/// completion arrives or a caller-supplied timeout expires.
pub struct SyncWaiter<T> {
    state: Mutex<Option<Completion<T>>>,
    condvar: Condvar,
}

impl<T: Send + 'static> SyncWaiter<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        })
    }

    /// Produces the callback to register with [`RequestRegistry::open`].
    pub fn callback(self: &Arc<Self>) -> Waiter<T> {
        let waiter = Arc::clone(self);
        Box::new(move |completion| {
            *waiter.state.lock() = Some(completion);
            waiter.condvar.notify_one();
        })
    }

    /// Blocks until the completion arrives, or returns `None` on timeout.
    /// The caller is then expected to [`cancel`] the request.
    ///
    /// [`cancel`]: RequestRegistry::cancel
    pub fn wait(&self, timeout: Duration) -> Option<Completion<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.is_none() {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return state.take();
            }
        }
        state.take()
    }
}
