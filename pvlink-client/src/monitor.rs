//! Channel monitors: the consumer side of a subscription.
//!
//! Incoming monitor events land in a bounded [`MonitorQueue`] on the
//! transport task; a [`Monitor`] drains it at the consumer's own pace.
//! When the consumer falls behind, updates merge per the queue's overrun
//! policy, and the combined masks report exactly which fields lost an
//! intermediate value, with the server's own overrun accounting folded in.

use crate::connection::{roundtrip, ConnState};
use crate::error::ClientError;
use bytes::BufMut;
use pvlink_core::{Delivered, MonitorQueue, RequestId};
use pvlink_protocol::Opcode;
use pvlink_types::{BitSet, Descriptor, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One event as queued by the dispatch path.
pub(crate) struct EventItem {
    pub(crate) descriptor: Arc<Descriptor>,
    pub(crate) value: Value,
    /// Overrun already accumulated on the server side.
    pub(crate) server_overrun: BitSet,
}

/// Producer half handed to the connection's dispatch path.
pub(crate) struct MonitorSink {
    pub(crate) queue: Arc<MonitorQueue<EventItem>>,
    pub(crate) notify: Arc<Notify>,
}

/// One delivered snapshot.
#[derive(Debug)]
pub struct MonitorUpdate {
    pub descriptor: Arc<Descriptor>,
    pub value: Value,
    /// Fields that differ from the previously delivered snapshot.
    pub changed: BitSet,
    /// Fields that changed more than once since then; an intermediate
    /// value was lost. Always a subset of `changed`.
    pub overrun: BitSet,
}

fn combine(delivered: Delivered<EventItem>) -> (MonitorUpdate, pvlink_core::SlotToken) {
    let EventItem {
        descriptor,
        value,
        server_overrun,
    } = delivered.value;
    let mut overrun = delivered.overrun;
    overrun.union_with(&server_overrun);
    (
        MonitorUpdate {
            descriptor,
            value,
            changed: delivered.changed,
            overrun,
        },
        delivered.token,
    )
}

/// Consumer handle for one subscription.
pub struct Monitor {
    state: Arc<ConnState>,
    sub_id: RequestId,
    queue: Arc<MonitorQueue<EventItem>>,
    notify: Arc<Notify>,
    stopped: AtomicBool,
}

impl Monitor {
    pub(crate) fn new(
        state: Arc<ConnState>,
        sub_id: RequestId,
        queue: Arc<MonitorQueue<EventItem>>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            state,
            sub_id,
            queue,
            notify,
            stopped: AtomicBool::new(false),
        }
    }

    /// The subscription id, as carried in every event for it.
    pub fn subscription_id(&self) -> RequestId {
        self.sub_id
    }

    /// Takes the oldest pending update without waiting.
    pub fn try_next(&self) -> Option<MonitorUpdate> {
        let delivered = self.queue.take_ready()?;
        let (update, token) = combine(delivered);
        self.queue.release(token);
        Some(update)
    }

    /// Waits for the next update. Returns `None` once the subscription is
    /// stopped or the connection is gone and the queue has drained.
    pub async fn next(&self) -> Option<MonitorUpdate> {
        loop {
            if let Some(update) = self.try_next() {
                return Some(update);
            }
            if self.stopped.load(Ordering::SeqCst)
                || !self.state.connected.load(Ordering::SeqCst)
            {
                return None;
            }
            let notified = self.notify.notified();
            // An event between the drain above and this point left a
            // stored permit, so awaiting cannot miss it
            if let Some(update) = self.try_next() {
                return Some(update);
            }
            notified.await;
        }
    }

    /// Updates dropped because every queue slot was in delivery.
    pub fn dropped_updates(&self) -> u64 {
        self.queue.dropped_updates()
    }

    /// Stops the subscription: tells the server, detaches the sink, and
    /// clears the queue. Idempotent; events still in flight are discarded
    /// on arrival.
    pub async fn stop(&self) -> Result<(), ClientError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.monitors.lock().remove(&self.sub_id);

        let sub_id = self.sub_id;
        let result = roundtrip(&self.state, Opcode::MonitorStop, |_, buf| {
            buf.put_u32(sub_id);
            Ok(())
        })
        .await;

        self.queue.clear();
        self.notify.notify_waiters();

        match result {
            Ok(reply) if reply.status.is_ok() => Ok(()),
            Ok(reply) => Err(ClientError::Server(
                reply
                    .status
                    .message
                    .unwrap_or_else(|| "monitor stop rejected".to_string()),
            )),
            // The server tears subscriptions down on disconnect anyway
            Err(ClientError::NotConnected | ClientError::ConnectionLost(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
