//! Channel values.
//!
//! A [`Value`] is a payload tree matching a [`Descriptor`]. The encoding is
//! schema-directed: no per-element tags are written, the descriptor drives
//! both sides. Arrays carry a u32 element count, unions a u16 variant index.

use crate::descriptor::{Descriptor, ScalarKind};
use crate::error::TypeError;
use crate::wire::{get_string, need, put_string};
use bytes::{Buf, BufMut};

/// A single primitive value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl Scalar {
    /// The kind this scalar satisfies.
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Int8(_) => ScalarKind::Int8,
            Scalar::Int16(_) => ScalarKind::Int16,
            Scalar::Int32(_) => ScalarKind::Int32,
            Scalar::Int64(_) => ScalarKind::Int64,
            Scalar::Float32(_) => ScalarKind::Float32,
            Scalar::Float64(_) => ScalarKind::Float64,
            Scalar::String(_) => ScalarKind::String,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Scalar::Bool(v) => buf.put_u8(*v as u8),
            Scalar::Int8(v) => buf.put_i8(*v),
            Scalar::Int16(v) => buf.put_i16(*v),
            Scalar::Int32(v) => buf.put_i32(*v),
            Scalar::Int64(v) => buf.put_i64(*v),
            Scalar::Float32(v) => buf.put_f32(*v),
            Scalar::Float64(v) => buf.put_f64(*v),
            Scalar::String(v) => put_string(buf, v),
        }
    }

    fn decode(kind: ScalarKind, buf: &mut impl Buf) -> Result<Self, TypeError> {
        Ok(match kind {
            ScalarKind::Bool => {
                need(buf, 1)?;
                Scalar::Bool(buf.get_u8() != 0)
            }
            ScalarKind::Int8 => {
                need(buf, 1)?;
                Scalar::Int8(buf.get_i8())
            }
            ScalarKind::Int16 => {
                need(buf, 2)?;
                Scalar::Int16(buf.get_i16())
            }
            ScalarKind::Int32 => {
                need(buf, 4)?;
                Scalar::Int32(buf.get_i32())
            }
            ScalarKind::Int64 => {
                need(buf, 8)?;
                Scalar::Int64(buf.get_i64())
            }
            ScalarKind::Float32 => {
                need(buf, 4)?;
                Scalar::Float32(buf.get_f32())
            }
            ScalarKind::Float64 => {
                need(buf, 8)?;
                Scalar::Float64(buf.get_f64())
            }
            ScalarKind::String => Scalar::String(get_string(buf)?),
        })
    }

    fn default_for(kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Bool => Scalar::Bool(false),
            ScalarKind::Int8 => Scalar::Int8(0),
            ScalarKind::Int16 => Scalar::Int16(0),
            ScalarKind::Int32 => Scalar::Int32(0),
            ScalarKind::Int64 => Scalar::Int64(0),
            ScalarKind::Float32 => Scalar::Float32(0.0),
            ScalarKind::Float64 => Scalar::Float64(0.0),
            ScalarKind::String => Scalar::String(String::new()),
        }
    }
}

/// A value tree matching a descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Array(Vec<Scalar>),
    /// Field values in descriptor field order.
    Structure(Vec<Value>),
    /// The active variant of a union.
    Union { index: u16, value: Box<Value> },
}

impl Value {
    /// Returns whether this value has the shape the descriptor requires.
    pub fn matches(&self, descriptor: &Descriptor) -> bool {
        match (self, descriptor) {
            (Value::Scalar(s), Descriptor::Scalar(kind)) => s.kind() == *kind,
            (Value::Array(items), Descriptor::ScalarArray(kind)) => {
                items.iter().all(|s| s.kind() == *kind)
            }
            (Value::Structure(values), Descriptor::Structure { fields, .. }) => {
                values.len() == fields.len()
                    && values
                        .iter()
                        .zip(fields.iter())
                        .all(|(v, (_, d))| v.matches(d))
            }
            (Value::Union { index, value }, Descriptor::Union { variants, .. }) => variants
                .get(*index as usize)
                .is_some_and(|(_, d)| value.matches(d)),
            _ => false,
        }
    }

    /// Encodes against `descriptor`. Errors with
    /// [`TypeError::ValueMismatch`] if the shape does not line up.
    pub fn encode(&self, descriptor: &Descriptor, buf: &mut impl BufMut) -> Result<(), TypeError> {
        match (self, descriptor) {
            (Value::Scalar(s), Descriptor::Scalar(kind)) => {
                if s.kind() != *kind {
                    return Err(TypeError::ValueMismatch { expected: "scalar" });
                }
                s.encode(buf);
                Ok(())
            }
            (Value::Array(items), Descriptor::ScalarArray(kind)) => {
                buf.put_u32(items.len() as u32);
                for item in items {
                    if item.kind() != *kind {
                        return Err(TypeError::ValueMismatch {
                            expected: "scalar array element",
                        });
                    }
                    item.encode(buf);
                }
                Ok(())
            }
            (Value::Structure(values), Descriptor::Structure { fields, .. }) => {
                if values.len() != fields.len() {
                    return Err(TypeError::ValueMismatch {
                        expected: "structure fields",
                    });
                }
                for (value, (_, desc)) in values.iter().zip(fields.iter()) {
                    value.encode(desc, buf)?;
                }
                Ok(())
            }
            (Value::Union { index, value }, Descriptor::Union { variants, .. }) => {
                let (_, desc) =
                    variants
                        .get(*index as usize)
                        .ok_or(TypeError::UnionIndexOutOfRange {
                            index: *index,
                            count: variants.len(),
                        })?;
                buf.put_u16(*index);
                value.encode(desc, buf)
            }
            (_, Descriptor::Scalar(_)) => Err(TypeError::ValueMismatch { expected: "scalar" }),
            (_, Descriptor::ScalarArray(_)) => Err(TypeError::ValueMismatch {
                expected: "scalar array",
            }),
            (_, Descriptor::Structure { .. }) => Err(TypeError::ValueMismatch {
                expected: "structure",
            }),
            (_, Descriptor::Union { .. }) => Err(TypeError::ValueMismatch { expected: "union" }),
        }
    }

    /// Decodes a value written by [`Value::encode`] with the same descriptor.
    pub fn decode(descriptor: &Descriptor, buf: &mut impl Buf) -> Result<Self, TypeError> {
        match descriptor {
            Descriptor::Scalar(kind) => Ok(Value::Scalar(Scalar::decode(*kind, buf)?)),
            Descriptor::ScalarArray(kind) => {
                need(buf, 4)?;
                let count = buf.get_u32() as usize;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(Scalar::decode(*kind, buf)?);
                }
                Ok(Value::Array(items))
            }
            Descriptor::Structure { fields, .. } => {
                let mut values = Vec::with_capacity(fields.len());
                for (_, desc) in fields {
                    values.push(Value::decode(desc, buf)?);
                }
                Ok(Value::Structure(values))
            }
            Descriptor::Union { variants, .. } => {
                need(buf, 2)?;
                let index = buf.get_u16();
                let (_, desc) =
                    variants
                        .get(index as usize)
                        .ok_or(TypeError::UnionIndexOutOfRange {
                            index,
                            count: variants.len(),
                        })?;
                Ok(Value::Union {
                    index,
                    value: Box::new(Value::decode(desc, buf)?),
                })
            }
        }
    }

    /// Builds the zero value for a descriptor (unions take variant 0).
    pub fn default_for(descriptor: &Descriptor) -> Self {
        match descriptor {
            Descriptor::Scalar(kind) => Value::Scalar(Scalar::default_for(*kind)),
            Descriptor::ScalarArray(_) => Value::Array(Vec::new()),
            Descriptor::Structure { fields, .. } => Value::Structure(
                fields
                    .iter()
                    .map(|(_, desc)| Value::default_for(desc))
                    .collect(),
            ),
            Descriptor::Union { variants, .. } => Value::Union {
                index: 0,
                value: Box::new(
                    variants
                        .first()
                        .map(|(_, desc)| Value::default_for(desc))
                        .unwrap_or(Value::Structure(Vec::new())),
                ),
            },
        }
    }

    /// Replaces the field at `index` of a structure value. Panics if this is
    /// not a structure or the index is out of range.
    pub fn set_field(&mut self, index: usize, value: Value) {
        match self {
            Value::Structure(values) => values[index] = value,
            _ => panic!("set_field on non-structure value"),
        }
    }

    /// Returns the field at `index` of a structure value.
    pub fn field(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Structure(values) => values.get(index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ScalarKind;
    use bytes::BytesMut;
    use std::sync::Arc;

    fn scalar_pair() -> (Descriptor, Value) {
        (
            Descriptor::Scalar(ScalarKind::Float64),
            Value::Scalar(Scalar::Float64(3.25)),
        )
    }

    fn structure_pair() -> (Descriptor, Value) {
        let desc = Descriptor::Structure {
            name: "reading_t".to_string(),
            fields: vec![
                (
                    "value".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Float64)),
                ),
                (
                    "units".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::String)),
                ),
                (
                    "history".to_string(),
                    Arc::new(Descriptor::ScalarArray(ScalarKind::Int32)),
                ),
            ],
        };
        let value = Value::Structure(vec![
            Value::Scalar(Scalar::Float64(21.5)),
            Value::Scalar(Scalar::String("degC".to_string())),
            Value::Array(vec![Scalar::Int32(20), Scalar::Int32(21)]),
        ]);
        (desc, value)
    }

    #[test]
    fn test_scalar_roundtrip() {
        let (desc, value) = scalar_pair();
        let mut buf = BytesMut::new();
        value.encode(&desc, &mut buf).unwrap();
        assert_eq!(Value::decode(&desc, &mut buf).unwrap(), value);
    }

    #[test]
    fn test_structure_roundtrip() {
        let (desc, value) = structure_pair();
        let mut buf = BytesMut::new();
        value.encode(&desc, &mut buf).unwrap();
        let decoded = Value::decode(&desc, &mut buf).unwrap();
        assert_eq!(decoded, value);
        assert!(decoded.matches(&desc));
    }

    #[test]
    fn test_union_roundtrip() {
        let desc = Descriptor::Union {
            name: "any_t".to_string(),
            variants: vec![
                (
                    "as_int".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::Int64)),
                ),
                (
                    "as_text".to_string(),
                    Arc::new(Descriptor::Scalar(ScalarKind::String)),
                ),
            ],
        };
        let value = Value::Union {
            index: 1,
            value: Box::new(Value::Scalar(Scalar::String("idle".to_string()))),
        };
        let mut buf = BytesMut::new();
        value.encode(&desc, &mut buf).unwrap();
        assert_eq!(Value::decode(&desc, &mut buf).unwrap(), value);
    }

    #[test]
    fn test_mismatched_shape() {
        let (desc, _) = structure_pair();
        let wrong = Value::Scalar(Scalar::Bool(true));
        let mut buf = BytesMut::new();
        assert!(matches!(
            wrong.encode(&desc, &mut buf),
            Err(TypeError::ValueMismatch { .. })
        ));
    }

    #[test]
    fn test_union_index_out_of_range() {
        let desc = Descriptor::Union {
            name: "any_t".to_string(),
            variants: vec![(
                "as_int".to_string(),
                Arc::new(Descriptor::Scalar(ScalarKind::Int64)),
            )],
        };
        let value = Value::Union {
            index: 3,
            value: Box::new(Value::Scalar(Scalar::Int64(1))),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            value.encode(&desc, &mut buf),
            Err(TypeError::UnionIndexOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn test_default_for() {
        let (desc, _) = structure_pair();
        let value = Value::default_for(&desc);
        assert!(value.matches(&desc));
        assert_eq!(value.field(0), Some(&Value::Scalar(Scalar::Float64(0.0))));
    }

    #[test]
    fn test_set_field() {
        let (desc, mut value) = structure_pair();
        value.set_field(0, Value::Scalar(Scalar::Float64(99.0)));
        assert!(value.matches(&desc));
        assert_eq!(value.field(0), Some(&Value::Scalar(Scalar::Float64(99.0))));
    }

    #[test]
    fn test_decode_truncated() {
        let (desc, value) = structure_pair();
        let mut buf = BytesMut::new();
        value.encode(&desc, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 2);
        assert!(matches!(
            Value::decode(&desc, &mut partial),
            Err(TypeError::Truncated { .. })
        ));
    }
}
