//! Type system error types.

use thiserror::Error;

/// Errors from descriptor/value encoding and the introspection cache.
#[derive(Debug, Error)]
pub enum TypeError {
    #[error("truncated input: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("invalid descriptor tag: {0:#04x}")]
    InvalidDescriptorTag(u8),

    #[error("invalid scalar kind code: {0:#04x}")]
    InvalidScalarKind(u8),

    #[error("invalid type encoding tag: {0:#04x}")]
    InvalidTypeTag(u8),

    #[error("invalid UTF-8 in encoded string")]
    InvalidUtf8,

    #[error("descriptor nesting exceeds limit of {0}")]
    NestingTooDeep(usize),

    #[error("unknown type id {0} referenced before its definition was sent")]
    UnknownTypeId(u16),

    #[error("type id space exhausted, connection must reset its caches")]
    TypeIdSpaceExhausted,

    #[error("value does not match descriptor: expected {expected}")]
    ValueMismatch { expected: &'static str },

    #[error("union variant index {index} out of range ({count} variants)")]
    UnionIndexOutOfRange { index: u16, count: usize },
}

impl TypeError {
    /// Returns whether this error means the two peers' caches can no longer
    /// be trusted, which is fatal to the connection.
    pub fn is_cache_desync(&self) -> bool {
        matches!(self, TypeError::UnknownTypeId(_))
    }
}
