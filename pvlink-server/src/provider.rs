//! Channel providers.
//!
//! A [`ChannelProvider`] is the boundary with whatever actually owns the
//! data: it resolves channel names to descriptors, serves reads and
//! writes, and publishes value updates to subscribers. The engine never
//! interprets field semantics; values are opaque trees paired with their
//! descriptor.
//!
//! [`StaticProvider`] is the in-memory implementation used by tests and
//! the demo daemon.

use dashmap::DashMap;
use pvlink_types::{BitSet, Descriptor, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// One published value change.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub value: Value,
    /// Top-level fields that changed in this update.
    pub changed: BitSet,
}

/// Provider-side failures, answered as error statuses.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no such channel: {0}")]
    NoSuchChannel(String),

    #[error("value does not match the channel's type")]
    TypeMismatch,
}

/// Resolves channels and serves their values.
pub trait ChannelProvider: Send + Sync {
    /// The channel's structural type, or `None` if it does not exist.
    fn descriptor(&self, channel: &str) -> Option<Arc<Descriptor>>;

    /// Current value snapshot.
    fn read(&self, channel: &str) -> Option<Value>;

    /// Replaces the channel's value and publishes the change.
    fn write(&self, channel: &str, value: Value) -> Result<(), ProviderError>;

    /// Subscribes to the channel's update stream.
    fn subscribe(&self, channel: &str) -> Option<broadcast::Receiver<ChannelUpdate>>;
}

/// Per-channel broadcast capacity. Slow subscribers fall behind and lag,
/// which their monitor queue absorbs as overruns.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

struct ChannelEntry {
    descriptor: Arc<Descriptor>,
    value: parking_lot::RwLock<Value>,
    updates: broadcast::Sender<ChannelUpdate>,
}

/// In-memory provider with a fixed set of channels.
#[derive(Default)]
pub struct StaticProvider {
    channels: DashMap<String, ChannelEntry>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Registers a channel with its type and initial value. Panics if the
    /// initial value does not match the descriptor; channel setup is
    /// build-time configuration, not network input.
    pub fn add_channel(
        &self,
        name: impl Into<String>,
        descriptor: Arc<Descriptor>,
        initial: Value,
    ) {
        assert!(
            initial.matches(&descriptor),
            "initial value does not match channel descriptor"
        );
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        self.channels.insert(
            name.into(),
            ChannelEntry {
                descriptor,
                value: parking_lot::RwLock::new(initial),
                updates,
            },
        );
    }

    /// Posts an update from the data source side, with an explicit
    /// changed-fields mask.
    pub fn post(
        &self,
        channel: &str,
        value: Value,
        changed: &BitSet,
    ) -> Result<(), ProviderError> {
        let entry = self
            .channels
            .get(channel)
            .ok_or_else(|| ProviderError::NoSuchChannel(channel.to_string()))?;
        if !value.matches(&entry.descriptor) {
            return Err(ProviderError::TypeMismatch);
        }
        *entry.value.write() = value.clone();
        // No receivers is fine; nobody is monitoring yet
        let _ = entry.updates.send(ChannelUpdate {
            value,
            changed: changed.clone(),
        });
        Ok(())
    }

    /// Registered channel names.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Mask with every top-level field of `descriptor` set; used when a write
/// replaces the whole value.
pub fn all_fields_mask(descriptor: &Descriptor) -> BitSet {
    let mut mask = BitSet::with_capacity(descriptor.field_count());
    for i in 0..descriptor.field_count() {
        mask.set(i);
    }
    mask
}

impl ChannelProvider for StaticProvider {
    fn descriptor(&self, channel: &str) -> Option<Arc<Descriptor>> {
        self.channels.get(channel).map(|e| e.descriptor.clone())
    }

    fn read(&self, channel: &str) -> Option<Value> {
        self.channels.get(channel).map(|e| e.value.read().clone())
    }

    fn write(&self, channel: &str, value: Value) -> Result<(), ProviderError> {
        let changed = {
            let entry = self
                .channels
                .get(channel)
                .ok_or_else(|| ProviderError::NoSuchChannel(channel.to_string()))?;
            all_fields_mask(&entry.descriptor)
        };
        self.post(channel, value, &changed)
    }

    fn subscribe(&self, channel: &str) -> Option<broadcast::Receiver<ChannelUpdate>> {
        self.channels.get(channel).map(|e| e.updates.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvlink_types::{Scalar, ScalarKind};

    fn provider_with_scalar() -> StaticProvider {
        let provider = StaticProvider::new();
        provider.add_channel(
            "temperature",
            Arc::new(Descriptor::Scalar(ScalarKind::Float64)),
            Value::Scalar(Scalar::Float64(20.0)),
        );
        provider
    }

    #[test]
    fn test_descriptor_and_read() {
        let provider = provider_with_scalar();
        assert!(provider.descriptor("temperature").is_some());
        assert!(provider.descriptor("missing").is_none());
        assert_eq!(
            provider.read("temperature"),
            Some(Value::Scalar(Scalar::Float64(20.0)))
        );
    }

    #[test]
    fn test_write_updates_and_broadcasts() {
        let provider = provider_with_scalar();
        let mut receiver = provider.subscribe("temperature").unwrap();

        provider
            .write("temperature", Value::Scalar(Scalar::Float64(21.5)))
            .unwrap();

        assert_eq!(
            provider.read("temperature"),
            Some(Value::Scalar(Scalar::Float64(21.5)))
        );
        let update = receiver.try_recv().unwrap();
        assert_eq!(update.value, Value::Scalar(Scalar::Float64(21.5)));
        assert!(update.changed.get(0));
    }

    #[test]
    fn test_write_rejects_wrong_type() {
        let provider = provider_with_scalar();
        let result = provider.write("temperature", Value::Scalar(Scalar::Bool(true)));
        assert!(matches!(result, Err(ProviderError::TypeMismatch)));
    }

    #[test]
    fn test_write_unknown_channel() {
        let provider = provider_with_scalar();
        let result = provider.write("missing", Value::Scalar(Scalar::Float64(1.0)));
        assert!(matches!(result, Err(ProviderError::NoSuchChannel(_))));
    }

    #[test]
    fn test_all_fields_mask() {
        let descriptor = Descriptor::Structure {
            name: "pair_t".to_string(),
            fields: vec![
                (
                    "a".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Int32)),
                ),
                (
                    "b".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Int32)),
                ),
            ],
        };
        let mask = all_fields_mask(&descriptor);
        assert!(mask.get(0) && mask.get(1));
        assert_eq!(mask.count_ones(), 2);
    }

    #[test]
    fn test_post_with_partial_mask() {
        let provider = StaticProvider::new();
        let descriptor = Arc::new(Descriptor::Structure {
            name: "pair_t".to_string(),
            fields: vec![
                (
                    "a".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Int32)),
                ),
                (
                    "b".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Int32)),
                ),
            ],
        });
        let initial = Value::default_for(&descriptor);
        provider.add_channel("pair", descriptor, initial.clone());

        let mut receiver = provider.subscribe("pair").unwrap();
        let mut changed = BitSet::new();
        changed.set(1);

        let mut updated = initial;
        updated.set_field(1, Value::Scalar(Scalar::Int32(5)));
        provider.post("pair", updated, &changed).unwrap();

        let update = receiver.try_recv().unwrap();
        assert!(!update.changed.get(0));
        assert!(update.changed.get(1));
    }
}
