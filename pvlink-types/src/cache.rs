//! Per-connection introspection type cache.
//!
//! Re-describing a value's structural type on every message is wasted
//! bandwidth. Each direction of a connection keeps a table mapping
//! descriptors to small numeric ids: the first time a cacheable descriptor
//! is sent, the full definition goes on the wire with a fresh id; every
//! later occurrence sends the id alone.
//!
//! Tag byte ahead of every encoded value:
//! - `0x00` null, no type and no payload
//! - `0x01` inline definition, never cached (plain scalars and scalar
//!   arrays, where the definition is cheaper than a cache round-trip)
//! - `0x02` full definition with id, first occurrence of a cacheable shape
//! - `0x03` id-only reference to a previously sent definition
//!
//! Ids are valid for one connection direction and die on [`reset`]. A
//! by-reference id the receiver has never seen means the peers' caches are
//! desynchronized, which is fatal to the connection.
//!
//! [`reset`]: OutgoingTypes::reset

use crate::descriptor::Descriptor;
use crate::error::TypeError;
use crate::value::Value;
use crate::wire::need;
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::sync::Arc;

/// Compact numeric id for a descriptor, unique per connection direction.
pub type TypeId = u16;

/// Reserved id meaning "no type" (null payload).
pub const NO_TYPE: TypeId = 0;

const TAG_NULL: u8 = 0x00;
const TAG_INLINE: u8 = 0x01;
const TAG_FULL_WITH_ID: u8 = 0x02;
const TAG_ID_ONLY: u8 = 0x03;

/// Sender-side half of the cache: assigns ids and elides repeated
/// definitions.
#[derive(Debug, Default)]
pub struct OutgoingTypes {
    ids: HashMap<Arc<Descriptor>, TypeId>,
    next_id: TypeId,
}

impl OutgoingTypes {
    pub fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: NO_TYPE + 1,
        }
    }

    /// Returns the id for a structurally-equal descriptor seen before, or
    /// assigns the next sequential id. Callers must only pass cacheable
    /// descriptors.
    pub fn id_for(&mut self, descriptor: &Arc<Descriptor>) -> Result<(TypeId, bool), TypeError> {
        debug_assert!(descriptor.is_cacheable());
        if let Some(&id) = self.ids.get(descriptor) {
            return Ok((id, false));
        }
        if self.next_id == TypeId::MAX {
            return Err(TypeError::TypeIdSpaceExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(descriptor.clone(), id);
        Ok((id, true))
    }

    /// Encodes a tagged (type, value) pair, sending the full definition only
    /// the first time a structurally-equal descriptor goes out.
    pub fn encode(
        &mut self,
        descriptor: &Arc<Descriptor>,
        value: &Value,
        buf: &mut impl BufMut,
    ) -> Result<(), TypeError> {
        if !descriptor.is_cacheable() {
            buf.put_u8(TAG_INLINE);
            descriptor.encode(buf);
            return value.encode(descriptor, buf);
        }
        let (id, fresh) = self.id_for(descriptor)?;
        if fresh {
            buf.put_u8(TAG_FULL_WITH_ID);
            buf.put_u16(id);
            descriptor.encode(buf);
        } else {
            buf.put_u8(TAG_ID_ONLY);
            buf.put_u16(id);
        }
        value.encode(descriptor, buf)
    }

    /// Encodes the null tag (no type, no payload).
    pub fn encode_null(buf: &mut impl BufMut) {
        buf.put_u8(TAG_NULL);
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Clears the table. Required on reconnect; previously assigned ids are
    /// never valid across a reset.
    pub fn reset(&mut self) {
        self.ids.clear();
        self.next_id = NO_TYPE + 1;
    }
}

/// Receiver-side half of the cache: registers definitions under the sender's
/// ids and resolves by-reference encodings.
#[derive(Debug, Default)]
pub struct IncomingTypes {
    /// id -> (descriptor, encoded definition length in bytes).
    table: HashMap<TypeId, (Arc<Descriptor>, usize)>,
}

impl IncomingTypes {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Decodes a tagged (type, value) pair written by
    /// [`OutgoingTypes::encode`]. Returns `None` for the null tag.
    ///
    /// A full definition for an id already registered is skipped using the
    /// recorded definition length, without reparsing. An id-only reference
    /// to an unknown id is a cache desynchronization and fatal to the
    /// connection.
    pub fn decode(
        &mut self,
        buf: &mut impl Buf,
    ) -> Result<Option<(Arc<Descriptor>, Value)>, TypeError> {
        need(buf, 1)?;
        match buf.get_u8() {
            TAG_NULL => Ok(None),
            TAG_INLINE => {
                let descriptor = Arc::new(Descriptor::decode(buf)?);
                let value = Value::decode(&descriptor, buf)?;
                Ok(Some((descriptor, value)))
            }
            TAG_FULL_WITH_ID => {
                need(buf, 2)?;
                let id = buf.get_u16();
                let descriptor = if let Some((descriptor, def_len)) = self.table.get(&id) {
                    // Duplicate definition for a known id: skip it.
                    let (descriptor, def_len) = (descriptor.clone(), *def_len);
                    need(buf, def_len)?;
                    buf.advance(def_len);
                    descriptor
                } else {
                    let before = buf.remaining();
                    let descriptor = Arc::new(Descriptor::decode(buf)?);
                    let def_len = before - buf.remaining();
                    self.table.insert(id, (descriptor.clone(), def_len));
                    descriptor
                };
                let value = Value::decode(&descriptor, buf)?;
                Ok(Some((descriptor, value)))
            }
            TAG_ID_ONLY => {
                need(buf, 2)?;
                let id = buf.get_u16();
                let (descriptor, _) = self
                    .table
                    .get(&id)
                    .cloned()
                    .ok_or(TypeError::UnknownTypeId(id))?;
                let value = Value::decode(&descriptor, buf)?;
                Ok(Some((descriptor, value)))
            }
            other => Err(TypeError::InvalidTypeTag(other)),
        }
    }

    /// Looks up a previously registered descriptor.
    pub fn lookup(&self, id: TypeId) -> Option<Arc<Descriptor>> {
        self.table.get(&id).map(|(d, _)| d.clone())
    }

    /// Number of registered definitions.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Clears the table. Required on reconnect.
    pub fn reset(&mut self) {
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ScalarKind;
    use crate::value::Scalar;
    use bytes::BytesMut;

    fn sample_descriptor() -> Arc<Descriptor> {
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

    fn sample_value(v: f64) -> Value {
        Value::Structure(vec![
            Value::Scalar(Scalar::Float64(v)),
            Value::Scalar(Scalar::Int32(0)),
        ])
    }

    #[test]
    fn test_full_then_by_reference() {
        let mut out = OutgoingTypes::new();
        let mut incoming = IncomingTypes::new();
        let desc = sample_descriptor();

        let mut first = BytesMut::new();
        out.encode(&desc, &sample_value(1.0), &mut first).unwrap();

        // Structurally equal but a distinct allocation
        let equal = sample_descriptor();
        let mut second = BytesMut::new();
        out.encode(&equal, &sample_value(2.0), &mut second).unwrap();

        // Second encoding elides the definition entirely
        assert!(second.len() < first.len());
        assert_eq!(second[0], TAG_ID_ONLY);
        assert_eq!(out.len(), 1);

        let (d1, v1) = incoming.decode(&mut first).unwrap().unwrap();
        let (d2, v2) = incoming.decode(&mut second).unwrap().unwrap();
        assert_eq!(*d1, *desc);
        assert_eq!(*d2, *desc);
        assert_eq!(v1, sample_value(1.0));
        assert_eq!(v2, sample_value(2.0));
    }

    #[test]
    fn test_scalars_never_cached() {
        let mut out = OutgoingTypes::new();
        let desc = Arc::new(Descriptor::Scalar(ScalarKind::Int32));
        let value = Value::Scalar(Scalar::Int32(7));

        let mut buf = BytesMut::new();
        out.encode(&desc, &value, &mut buf).unwrap();
        out.encode(&desc, &value, &mut buf).unwrap();
        assert!(out.is_empty());
        assert_eq!(buf[0], TAG_INLINE);

        let mut incoming = IncomingTypes::new();
        incoming.decode(&mut buf).unwrap().unwrap();
        incoming.decode(&mut buf).unwrap().unwrap();
        assert!(incoming.is_empty());
    }

    #[test]
    fn test_reset_resends_definition() {
        let mut out = OutgoingTypes::new();
        let desc = sample_descriptor();

        let mut buf = BytesMut::new();
        out.encode(&desc, &sample_value(1.0), &mut buf).unwrap();
        assert_eq!(buf[0], TAG_FULL_WITH_ID);

        out.reset();
        let mut after = BytesMut::new();
        out.encode(&desc, &sample_value(1.0), &mut after).unwrap();
        assert_eq!(after[0], TAG_FULL_WITH_ID);
    }

    #[test]
    fn test_unknown_id_is_desync() {
        let mut incoming = IncomingTypes::new();
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_ID_ONLY);
        buf.put_u16(42);

        let err = incoming.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TypeError::UnknownTypeId(42)));
        assert!(err.is_cache_desync());
    }

    #[test]
    fn test_duplicate_definition_skipped() {
        let mut out = OutgoingTypes::new();
        let mut incoming = IncomingTypes::new();
        let desc = sample_descriptor();

        let mut first = BytesMut::new();
        out.encode(&desc, &sample_value(1.0), &mut first).unwrap();
        // Replay the identical full-definition bytes, as a sender that lost
        // its cache state would after a partial reset.
        let replay = first.clone();

        incoming.decode(&mut first).unwrap().unwrap();
        assert_eq!(incoming.len(), 1);

        let mut replayed = replay;
        let (d, v) = incoming.decode(&mut replayed).unwrap().unwrap();
        assert_eq!(*d, *desc);
        assert_eq!(v, sample_value(1.0));
        assert_eq!(incoming.len(), 1);
    }

    #[test]
    fn test_null_tag() {
        let mut buf = BytesMut::new();
        OutgoingTypes::encode_null(&mut buf);
        let mut incoming = IncomingTypes::new();
        assert!(incoming.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_distinct_descriptors_get_distinct_ids() {
        let mut out = OutgoingTypes::new();
        let a = sample_descriptor();
        let b = Arc::new(Descriptor::Structure {
            name: "other_t".to_string(),
            fields: vec![(
                "flag".to_string(),
                Arc::new(Descriptor::Scalar(ScalarKind::Bool)),
            )],
        });

        let (id_a, fresh_a) = out.id_for(&a).unwrap();
        let (id_b, fresh_b) = out.id_for(&b).unwrap();
        assert!(fresh_a && fresh_b);
        assert_ne!(id_a, id_b);
        assert_ne!(id_a, NO_TYPE);
        assert_ne!(id_b, NO_TYPE);

        // Asking again reuses without assigning
        let (again, fresh) = out.id_for(&a).unwrap();
        assert_eq!(again, id_a);
        assert!(!fresh);
    }

    #[test]
    fn test_invalid_tag() {
        let mut incoming = IncomingTypes::new();
        let mut buf = BytesMut::from(&[0x7Fu8][..]);
        assert!(matches!(
            incoming.decode(&mut buf),
            Err(TypeError::InvalidTypeTag(0x7F))
        ));
    }
}
