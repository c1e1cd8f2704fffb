//! Per-subscription delivery machinery.
//!
//! Each subscription gets its own bounded [`MonitorQueue`] and two tasks:
//! a producer draining the provider's broadcast stream into the queue
//! (never blocking, merging on saturation), and a delivery task handing
//! ready slots to the connection loop, which encodes and writes them. A
//! slot stays in delivery until the connection loop has accepted the
//! event, so a burst cannot outrun the pool.

use crate::provider::ChannelUpdate;
use pvlink_core::MonitorQueue;
use pvlink_types::{BitSet, Descriptor, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

/// One event on its way from a subscription to the connection writer,
/// which owns the outgoing type cache and does the actual encoding.
pub(crate) struct ForwardedEvent {
    pub sub_id: u32,
    pub descriptor: Arc<Descriptor>,
    pub value: Value,
    pub changed: BitSet,
    pub overrun: BitSet,
}

/// Handle to one running subscription.
pub(crate) struct Subscription {
    queue: Arc<MonitorQueue<Value>>,
    producer: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl Subscription {
    /// Stops both tasks and retires the queue; a token the aborted
    /// delivery task never released is invalidated by the clear.
    pub(crate) fn abort(&self) {
        self.producer.abort();
        self.delivery.abort();
        self.queue.clear();
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &Arc<MonitorQueue<Value>> {
        &self.queue
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Starts a subscription's producer and delivery tasks. `initial` is the
/// channel's current snapshot, queued before any live update so every
/// subscriber starts from a known value.
pub(crate) fn spawn(
    sub_id: u32,
    descriptor: Arc<Descriptor>,
    initial: ChannelUpdate,
    receiver: broadcast::Receiver<ChannelUpdate>,
    queue_capacity: usize,
    event_tx: mpsc::Sender<ForwardedEvent>,
) -> Subscription {
    let queue = Arc::new(MonitorQueue::new(queue_capacity));
    let notify = Arc::new(Notify::new());

    queue.update(initial.value, &initial.changed);
    notify.notify_one();

    let producer = tokio::spawn(produce(queue.clone(), notify.clone(), receiver, sub_id));
    let delivery = tokio::spawn(deliver(
        queue.clone(),
        notify.clone(),
        sub_id,
        descriptor,
        event_tx,
    ));

    Subscription {
        queue,
        producer,
        delivery,
    }
}

async fn produce(
    queue: Arc<MonitorQueue<Value>>,
    notify: Arc<Notify>,
    mut receiver: broadcast::Receiver<ChannelUpdate>,
    sub_id: u32,
) {
    loop {
        match receiver.recv().await {
            Ok(update) => {
                // Never blocks; saturation merges into the newest
                // undelivered slot per the overrun policy
                queue.update(update.value, &update.changed);
                notify.notify_one();
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("subscription {} lagged {} updates", sub_id, n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("subscription {} source closed", sub_id);
                notify.notify_one();
                return;
            }
        }
    }
}

async fn deliver(
    queue: Arc<MonitorQueue<Value>>,
    notify: Arc<Notify>,
    sub_id: u32,
    descriptor: Arc<Descriptor>,
    event_tx: mpsc::Sender<ForwardedEvent>,
) {
    loop {
        while let Some(delivered) = queue.take_ready() {
            let pvlink_core::Delivered {
                token,
                value,
                changed,
                overrun,
            } = delivered;
            let event = ForwardedEvent {
                sub_id,
                descriptor: descriptor.clone(),
                value,
                changed,
                overrun,
            };
            // The slot is held in delivery while the connection loop
            // accepts the event; a full channel backpressures here, not
            // in the producer
            let sent = event_tx.send(event).await;
            queue.release(token);
            if sent.is_err() {
                // Connection is gone
                return;
            }
        }
        let notified = notify.notified();
        if queue.ready_len() > 0 {
            continue;
        }
        notified.await;
    }
}
