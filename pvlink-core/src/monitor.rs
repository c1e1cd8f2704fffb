//! Bounded monitor queue for subscription delivery.
//!
//! A fixed pool of reusable value slots decouples a producer that must
//! never block (the data source posting updates) from a consumer that
//! drains at its own pace (the delivery path). Slots cycle
//! free -> filled -> ready -> in-delivery -> free.
//!
//! Every slot carries two per-field bit-sets: *changed* marks fields that
//! differ from the last delivered snapshot, *overrun* marks fields that
//! changed more than once since then, meaning an intermediate value was
//! silently dropped. `overrun` is always a subset of `changed`.
//!
//! When the pool is saturated the producer does not wait: the new update
//! is merged into the newest undelivered slot (the producer's own
//! unpublished slot if it holds one, otherwise the newest ready slot),
//! replacing the value and setting the touched field bits in both masks.
//! Merging into an older slot would reorder deliveries, so the newest is
//! always the target. If every slot is in delivery the update is dropped
//! and counted.

use parking_lot::Mutex;
use pvlink_types::BitSet;
use std::collections::VecDeque;

/// Minimum slot pool size.
pub const MIN_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Acquired by the producer, not yet published.
    Filled,
    /// Published, waiting in FIFO order for the consumer.
    Ready,
    /// Handed to the consumer, awaiting release.
    InDelivery,
}

#[derive(Debug)]
struct Slot<V> {
    state: SlotState,
    value: Option<V>,
    changed: BitSet,
    overrun: BitSet,
}

impl<V> Slot<V> {
    fn empty() -> Self {
        Self {
            state: SlotState::Free,
            value: None,
            changed: BitSet::new(),
            overrun: BitSet::new(),
        }
    }
}

/// Handle to a slot held outside the queue, by the producer (between
/// acquire and publish) or the consumer (between take and release).
///
/// Tokens minted before a [`clear`] carry a stale generation and are
/// retired as no-ops when they come back, so a racing producer or consumer
/// cannot corrupt the rebuilt pool.
///
/// [`clear`]: MonitorQueue::clear
#[derive(Debug)]
pub struct SlotToken {
    index: usize,
    generation: u64,
}

/// One snapshot handed to the consumer by [`MonitorQueue::take_ready`].
///
/// The slot itself stays in the in-delivery state until the token is
/// passed back through [`MonitorQueue::release`].
#[derive(Debug)]
pub struct Delivered<V> {
    pub token: SlotToken,
    pub value: V,
    pub changed: BitSet,
    pub overrun: BitSet,
}

struct Inner<V> {
    slots: Vec<Slot<V>>,
    free: Vec<usize>,
    /// Published slots in FIFO order, oldest at the front.
    ready: VecDeque<usize>,
    /// Producer-held slots in acquisition order, newest last.
    filled: Vec<usize>,
    generation: u64,
    dropped: u64,
}

/// Fixed-capacity pool of monitor slots with producer/consumer handoff and
/// overrun tracking. All operations are non-blocking queries under one
/// mutex; none of them suspends.
pub struct MonitorQueue<V> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V> MonitorQueue<V> {
    /// Creates a pool of `capacity` slots; capacities below
    /// [`MIN_CAPACITY`] are clamped up.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: (0..capacity).map(|_| Slot::empty()).collect(),
                free: (0..capacity).rev().collect(),
                ready: VecDeque::with_capacity(capacity),
                filled: Vec::with_capacity(capacity),
                generation: 0,
                dropped: 0,
            }),
        }
    }

    /// Producer side: claims a free slot, or `None` when the pool is
    /// saturated. Saturation is the producer's backpressure signal; the
    /// caller then merges via [`update`] instead.
    ///
    /// [`update`]: MonitorQueue::update
    pub fn acquire_free(&self) -> Option<SlotToken> {
        let mut inner = self.inner.lock();
        let index = inner.free.pop()?;
        inner.slots[index].state = SlotState::Filled;
        inner.filled.push(index);
        Some(SlotToken {
            index,
            generation: inner.generation,
        })
    }

    /// Writes a snapshot into an acquired slot. Panics if the token's slot
    /// was not acquired by [`acquire_free`]; a stale token from before a
    /// clear is a no-op.
    ///
    /// [`acquire_free`]: MonitorQueue::acquire_free
    pub fn fill(&self, token: &SlotToken, value: V, changed: BitSet) {
        let mut inner = self.inner.lock();
        if token.generation != inner.generation {
            return;
        }
        let slot = &mut inner.slots[token.index];
        assert_eq!(
            slot.state,
            SlotState::Filled,
            "fill of a slot not acquired by the producer"
        );
        slot.value = Some(value);
        slot.changed = changed;
        slot.overrun.clear_all();
    }

    /// Marks a filled slot ready for delivery, preserving FIFO order
    /// relative to other published slots.
    pub fn publish(&self, token: SlotToken) {
        let mut inner = self.inner.lock();
        if token.generation != inner.generation {
            return;
        }
        let slot = &mut inner.slots[token.index];
        assert_eq!(
            slot.state,
            SlotState::Filled,
            "publish of a slot not acquired by the producer"
        );
        assert!(
            slot.value.is_some(),
            "publish of a slot that was never filled"
        );
        slot.state = SlotState::Ready;
        inner.filled.retain(|&i| i != token.index);
        inner.ready.push_back(token.index);
    }

    /// Consumer side: takes the oldest ready slot, or `None` if none is
    /// ready. The slot stays out of the free pool until [`release`].
    ///
    /// [`release`]: MonitorQueue::release
    pub fn take_ready(&self) -> Option<Delivered<V>> {
        let mut inner = self.inner.lock();
        let index = inner.ready.pop_front()?;
        let generation = inner.generation;
        let slot = &mut inner.slots[index];
        slot.state = SlotState::InDelivery;
        let value = slot.value.take().expect("ready slot with no value");
        let changed = std::mem::take(&mut slot.changed);
        let overrun = std::mem::take(&mut slot.overrun);
        Some(Delivered {
            token: SlotToken { index, generation },
            value,
            changed,
            overrun,
        })
    }

    /// Consumer signals it has fully read the slot; it returns to the free
    /// pool. Panics if the slot is not in delivery (releasing a slot the
    /// consumer does not hold is a usage error); a stale token from before
    /// a clear is a no-op.
    pub fn release(&self, token: SlotToken) {
        let mut inner = self.inner.lock();
        if token.generation != inner.generation {
            return;
        }
        let slot = &mut inner.slots[token.index];
        assert_eq!(
            slot.state,
            SlotState::InDelivery,
            "release of a slot not held by the consumer"
        );
        slot.state = SlotState::Free;
        inner.free.push(token.index);
    }

    /// Producer convenience: post one update, applying the overrun policy
    /// when the pool is saturated.
    ///
    /// With a free slot available the update fills and publishes it. With
    /// none, the update merges into the newest undelivered slot: the value
    /// is replaced and the touched field bits are set in both `changed`
    /// and `overrun`, recording that an intermediate value was lost. With
    /// every slot in delivery the update is dropped and counted.
    pub fn update(&self, value: V, changed: &BitSet) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index];
            slot.state = SlotState::Ready;
            slot.value = Some(value);
            slot.changed = changed.clone();
            slot.overrun.clear_all();
            inner.ready.push_back(index);
            return;
        }
        // Saturated: merge into the newest undelivered slot, preferring the
        // producer's own unpublished slot over the back of the ready queue.
        let target = inner.filled.last().or_else(|| inner.ready.back()).copied();
        match target {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.value = Some(value);
                slot.changed.union_with(changed);
                slot.overrun.union_with(changed);
            }
            None => {
                // Every slot is in delivery
                inner.dropped += 1;
                tracing::debug!("monitor queue saturated with all slots in delivery, update dropped");
            }
        }
    }

    /// Forcibly frees every slot (subscription restart). Tokens already
    /// out with the producer or consumer are retired safely: their
    /// generation no longer matches, so publish/release on them are
    /// no-ops rather than corrupting the rebuilt pool.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        for slot in &mut inner.slots {
            slot.state = SlotState::Free;
            slot.value = None;
            slot.changed.clear_all();
            slot.overrun.clear_all();
        }
        inner.free = (0..self.capacity).rev().collect();
        inner.ready.clear();
        inner.filled.clear();
    }

    /// Pool size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots published and awaiting the consumer.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Slots available to the producer.
    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Updates dropped because every slot was in delivery.
    pub fn dropped_updates(&self) -> u64 {
        self.inner.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(indices: &[usize]) -> BitSet {
        let mut bs = BitSet::new();
        for &i in indices {
            bs.set(i);
        }
        bs
    }

    /// overrun must be a subset of changed in every observable slot.
    fn assert_overrun_invariant<V>(delivered: &Delivered<V>) {
        assert!(delivered.overrun.is_subset_of(&delivered.changed));
    }

    #[test]
    fn test_capacity_clamped() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(0);
        assert_eq!(queue.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn test_acquire_fill_publish_take_release() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);

        let token = queue.acquire_free().unwrap();
        queue.fill(&token, 42, bits(&[0]));
        queue.publish(token);

        let delivered = queue.take_ready().unwrap();
        assert_eq!(delivered.value, 42);
        assert!(delivered.changed.get(0));
        assert!(delivered.overrun.is_empty());
        assert_overrun_invariant(&delivered);

        assert!(queue.take_ready().is_none());
        queue.release(delivered.token);
        assert_eq!(queue.free_len(), 2);
    }

    #[test]
    fn test_fifo_delivery_order() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(3);
        for v in [10, 20, 30] {
            queue.update(v, &bits(&[0]));
        }
        assert_eq!(queue.take_ready().unwrap().value, 10);
        assert_eq!(queue.take_ready().unwrap().value, 20);
        assert_eq!(queue.take_ready().unwrap().value, 30);
    }

    #[test]
    fn test_boundedness() {
        // With capacity C, at most C slots are ever outside the free pool.
        let queue: MonitorQueue<u32> = MonitorQueue::new(3);
        let a = queue.acquire_free().unwrap();
        let b = queue.acquire_free().unwrap();
        let c = queue.acquire_free().unwrap();
        assert!(queue.acquire_free().is_none());
        assert_eq!(queue.free_len(), 0);

        queue.fill(&a, 1, bits(&[0]));
        queue.publish(a);
        assert!(queue.acquire_free().is_none());

        let delivered = queue.take_ready().unwrap();
        assert!(queue.acquire_free().is_none());
        queue.release(delivered.token);
        assert!(queue.acquire_free().is_some());

        drop((b, c));
    }

    #[test]
    fn test_saturation_merges_into_newest_ready() {
        // Spec scenario: capacity 2, slot A fields {x}, slot B fields {y}
        // published, then a third update to x with no free slot merges
        // into B with changed >= {x,y} and overrun >= {x}.
        let x = 0;
        let y = 1;
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);

        queue.update(1, &bits(&[x]));
        queue.update(2, &bits(&[y]));
        assert_eq!(queue.free_len(), 0);

        queue.update(3, &bits(&[x]));

        // A is untouched
        let a = queue.take_ready().unwrap();
        assert_eq!(a.value, 1);
        assert!(a.changed.get(x));
        assert!(a.overrun.is_empty());
        assert_overrun_invariant(&a);

        // B carries the merge
        let b = queue.take_ready().unwrap();
        assert_eq!(b.value, 3);
        assert!(b.changed.get(x) && b.changed.get(y));
        assert!(b.overrun.get(x));
        assert!(!b.overrun.get(y));
        assert_overrun_invariant(&b);
    }

    #[test]
    fn test_saturation_prefers_producer_held_slot() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);
        queue.update(1, &bits(&[0]));

        // Producer acquires the last free slot and fills it, unpublished
        let token = queue.acquire_free().unwrap();
        queue.fill(&token, 2, bits(&[1]));

        // Saturated update merges into the producer-held slot, not the
        // ready one
        queue.update(3, &bits(&[2]));
        queue.publish(token);

        let first = queue.take_ready().unwrap();
        assert_eq!(first.value, 1);
        assert!(first.overrun.is_empty());

        let second = queue.take_ready().unwrap();
        assert_eq!(second.value, 3);
        assert!(second.changed.get(1) && second.changed.get(2));
        assert!(second.overrun.get(2));
        assert!(!second.overrun.get(1));
        assert_overrun_invariant(&second);
    }

    #[test]
    fn test_update_dropped_when_all_in_delivery() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);
        queue.update(1, &bits(&[0]));
        queue.update(2, &bits(&[0]));

        let a = queue.take_ready().unwrap();
        let b = queue.take_ready().unwrap();

        // Both slots are with the consumer; nowhere to merge
        queue.update(3, &bits(&[0]));
        assert_eq!(queue.dropped_updates(), 1);

        queue.release(a.token);
        queue.release(b.token);
        queue.update(4, &bits(&[0]));
        assert_eq!(queue.take_ready().unwrap().value, 4);
    }

    #[test]
    fn test_repeated_merges_accumulate_overrun() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);
        queue.update(1, &bits(&[0]));
        queue.update(2, &bits(&[1]));

        // Field 1 changes twice more while saturated
        queue.update(3, &bits(&[1]));
        queue.update(4, &bits(&[1]));

        queue.take_ready().unwrap();
        let merged = queue.take_ready().unwrap();
        assert_eq!(merged.value, 4);
        assert!(merged.overrun.get(1));
        assert_overrun_invariant(&merged);
    }

    #[test]
    #[should_panic(expected = "release of a slot not held by the consumer")]
    fn test_release_unheld_slot_panics() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);
        let token = queue.acquire_free().unwrap();
        // Filled, not in delivery: releasing it is a usage error
        queue.release(token);
    }

    #[test]
    #[should_panic(expected = "publish of a slot that was never filled")]
    fn test_publish_unfilled_slot_panics() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);
        let token = queue.acquire_free().unwrap();
        queue.publish(token);
    }

    #[test]
    fn test_clear_retires_stale_tokens() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(2);

        let producer_token = queue.acquire_free().unwrap();
        queue.fill(&producer_token, 1, bits(&[0]));
        queue.update(2, &bits(&[0]));
        let delivered = queue.take_ready().unwrap();

        queue.clear();
        assert_eq!(queue.free_len(), 2);
        assert_eq!(queue.ready_len(), 0);

        // Stale tokens from before the clear are no-ops, not corruption
        queue.publish(producer_token);
        queue.release(delivered.token);
        assert_eq!(queue.free_len(), 2);
        assert_eq!(queue.ready_len(), 0);

        // Pool is fully usable afterwards
        queue.update(9, &bits(&[3]));
        assert_eq!(queue.take_ready().unwrap().value, 9);
    }

    proptest::proptest! {
        // Any interleaving of updates, takes, and releases keeps
        // overrun a subset of changed in every delivered slot, and
        // never puts more than `capacity` slots outside the free pool.
        #[test]
        fn prop_overrun_subset_of_changed(
            ops in proptest::collection::vec((0u8..3, proptest::collection::vec(0usize..8, 1..3)), 1..60),
            capacity in 2usize..5,
        ) {
            let queue: MonitorQueue<u32> = MonitorQueue::new(capacity);
            let mut held: Vec<SlotToken> = Vec::new();
            let mut counter = 0u32;

            for (op, fields) in ops {
                match op {
                    0 => {
                        counter += 1;
                        queue.update(counter, &bits(&fields));
                    }
                    1 => {
                        if let Some(delivered) = queue.take_ready() {
                            assert_overrun_invariant(&delivered);
                            held.push(delivered.token);
                        }
                    }
                    _ => {
                        if let Some(token) = held.pop() {
                            queue.release(token);
                        }
                    }
                }
                let outside = capacity - queue.free_len();
                proptest::prop_assert!(outside <= capacity);
            }

            // Drain what is left; the invariant holds to the end
            while let Some(delivered) = queue.take_ready() {
                assert_overrun_invariant(&delivered);
                held.push(delivered.token);
            }
            for token in held {
                queue.release(token);
            }
        }
    }

    #[test]
    fn test_merge_keeps_publish_order() {
        let queue: MonitorQueue<u32> = MonitorQueue::new(3);
        queue.update(1, &bits(&[0]));
        queue.update(2, &bits(&[0]));
        queue.update(3, &bits(&[0]));
        // Saturated merge into newest must not reorder older slots
        queue.update(4, &bits(&[1]));

        assert_eq!(queue.take_ready().unwrap().value, 1);
        assert_eq!(queue.take_ready().unwrap().value, 2);
        let last = queue.take_ready().unwrap();
        assert_eq!(last.value, 4);
        assert!(last.overrun.get(1));
    }
}
