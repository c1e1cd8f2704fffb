//! # pvlink-types
//!
//! Structural value types for pvlink:
//! - Type descriptors (recursive record/array/union schemas) with structural
//!   equality and a compact binary encoding
//! - Values encoded and decoded against a descriptor
//! - Bit-sets used as per-field change/overrun masks
//! - The per-connection introspection type cache that avoids re-sending a
//!   descriptor on every message

pub mod bitset;
pub mod cache;
pub mod descriptor;
pub mod error;
pub mod value;
pub mod wire;

pub use bitset::BitSet;
pub use cache::{IncomingTypes, OutgoingTypes, TypeId, NO_TYPE};
pub use descriptor::{Descriptor, ScalarKind};
pub use error::TypeError;
pub use value::{Scalar, Value};
