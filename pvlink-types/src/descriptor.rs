//! Structural type descriptors.
//!
//! A descriptor is an immutable schema for a channel value: a scalar, a
//! scalar array, or a recursively nested structure/union. Descriptors
//! compare and hash structurally, which is what the introspection cache
//! keys on.
//!
//! Binary layout: a tag byte, then for scalars a kind code, for
//! structures/unions a name string and a u16-counted list of
//! (name, descriptor) pairs. Strings are u16-length-prefixed UTF-8.

use crate::error::TypeError;
use crate::wire::{get_string, need, put_string};
use bytes::{Buf, BufMut};
use std::sync::Arc;

/// Maximum descriptor nesting depth accepted by the decoder.
pub const MAX_NESTING: usize = 64;

const TAG_SCALAR: u8 = 0x01;
const TAG_SCALAR_ARRAY: u8 = 0x02;
const TAG_STRUCTURE: u8 = 0x03;
const TAG_UNION: u8 = 0x04;

/// Primitive element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
}

impl ScalarKind {
    fn code(self) -> u8 {
        match self {
            ScalarKind::Bool => 0x00,
            ScalarKind::Int8 => 0x01,
            ScalarKind::Int16 => 0x02,
            ScalarKind::Int32 => 0x03,
            ScalarKind::Int64 => 0x04,
            ScalarKind::Float32 => 0x05,
            ScalarKind::Float64 => 0x06,
            ScalarKind::String => 0x07,
        }
    }

    fn from_code(code: u8) -> Result<Self, TypeError> {
        match code {
            0x00 => Ok(ScalarKind::Bool),
            0x01 => Ok(ScalarKind::Int8),
            0x02 => Ok(ScalarKind::Int16),
            0x03 => Ok(ScalarKind::Int32),
            0x04 => Ok(ScalarKind::Int64),
            0x05 => Ok(ScalarKind::Float32),
            0x06 => Ok(ScalarKind::Float64),
            0x07 => Ok(ScalarKind::String),
            other => Err(TypeError::InvalidScalarKind(other)),
        }
    }
}

/// A structural type schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// A single primitive value.
    Scalar(ScalarKind),
    /// A variable-length array of primitives.
    ScalarArray(ScalarKind),
    /// A named record with ordered, named fields.
    Structure {
        name: String,
        fields: Vec<(String, Arc<Descriptor>)>,
    },
    /// A named discriminated union.
    Union {
        name: String,
        variants: Vec<(String, Arc<Descriptor>)>,
    },
}

impl Descriptor {
    /// Whether this shape goes through the introspection cache. Plain
    /// scalars and scalar arrays are sent inline: their definition is
    /// cheaper than a cache round-trip.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Descriptor::Structure { .. } | Descriptor::Union { .. }
        )
    }

    /// Number of top-level fields, for sizing change/overrun masks.
    /// Non-structure shapes count as one field.
    pub fn field_count(&self) -> usize {
        match self {
            Descriptor::Structure { fields, .. } => fields.len(),
            _ => 1,
        }
    }

    /// Index of a top-level structure field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        match self {
            Descriptor::Structure { fields, .. } => {
                fields.iter().position(|(n, _)| n == name)
            }
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Descriptor::Scalar(kind) => {
                buf.put_u8(TAG_SCALAR);
                buf.put_u8(kind.code());
            }
            Descriptor::ScalarArray(kind) => {
                buf.put_u8(TAG_SCALAR_ARRAY);
                buf.put_u8(kind.code());
            }
            Descriptor::Structure { name, fields } => {
                buf.put_u8(TAG_STRUCTURE);
                put_string(buf, name);
                buf.put_u16(fields.len() as u16);
                for (field_name, desc) in fields {
                    put_string(buf, field_name);
                    desc.encode(buf);
                }
            }
            Descriptor::Union { name, variants } => {
                buf.put_u8(TAG_UNION);
                put_string(buf, name);
                buf.put_u16(variants.len() as u16);
                for (variant_name, desc) in variants {
                    put_string(buf, variant_name);
                    desc.encode(buf);
                }
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, TypeError> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &mut impl Buf, depth: usize) -> Result<Self, TypeError> {
        if depth > MAX_NESTING {
            return Err(TypeError::NestingTooDeep(MAX_NESTING));
        }
        if buf.remaining() < 1 {
            return Err(TypeError::Truncated { needed: 1 });
        }
        match buf.get_u8() {
            TAG_SCALAR => {
                need(buf, 1)?;
                Ok(Descriptor::Scalar(ScalarKind::from_code(buf.get_u8())?))
            }
            TAG_SCALAR_ARRAY => {
                need(buf, 1)?;
                Ok(Descriptor::ScalarArray(ScalarKind::from_code(buf.get_u8())?))
            }
            TAG_STRUCTURE => {
                let name = get_string(buf)?;
                need(buf, 2)?;
                let count = buf.get_u16() as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let field_name = get_string(buf)?;
                    let desc = Self::decode_at_depth(buf, depth + 1)?;
                    fields.push((field_name, Arc::new(desc)));
                }
                Ok(Descriptor::Structure { name, fields })
            }
            TAG_UNION => {
                let name = get_string(buf)?;
                need(buf, 2)?;
                let count = buf.get_u16() as usize;
                let mut variants = Vec::with_capacity(count);
                for _ in 0..count {
                    let variant_name = get_string(buf)?;
                    let desc = Self::decode_at_depth(buf, depth + 1)?;
                    variants.push((variant_name, Arc::new(desc)));
                }
                Ok(Descriptor::Union { name, variants })
            }
            other => Err(TypeError::InvalidDescriptorTag(other)),
        }
    }
}
