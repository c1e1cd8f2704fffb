//! Low-level wire helpers shared by descriptor, value, and cache encoding.
//!
//! Strings are u16-length-prefixed UTF-8.

use crate::error::TypeError;
use bytes::{Buf, BufMut};

/// Writes a u16-length-prefixed UTF-8 string.
pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Reads a u16-length-prefixed UTF-8 string.
pub fn get_string(buf: &mut impl Buf) -> Result<String, TypeError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| TypeError::InvalidUtf8)
}

/// Errors with [`TypeError::Truncated`] unless `n` bytes remain.
pub fn need(buf: &impl Buf, n: usize) -> Result<(), TypeError> {
    if buf.remaining() < n {
        Err(TypeError::Truncated {
            needed: n - buf.remaining(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_string_roundtrip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "temperature");
        assert_eq!(get_string(&mut buf).unwrap(), "temperature");
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_string_truncated() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "temperature");
        let mut partial = buf.split_to(buf.len() - 3);
        assert!(matches!(
            get_string(&mut partial),
            Err(TypeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_slice(&[0xFF, 0xFE]);
        assert!(matches!(get_string(&mut buf), Err(TypeError::InvalidUtf8)));
    }
}
