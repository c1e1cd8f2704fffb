//! Growable bit-set used for per-field change and overrun masks.
//!
//! Wire encoding is a u16 byte count followed by the packed little-endian
//! bytes, trailing zero bytes trimmed.

use crate::error::TypeError;
use bytes::{Buf, BufMut};

const WORD_BITS: usize = 64;

/// A growable set of bit indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Creates a bit-set pre-sized for `nbits` bits, all clear.
    pub fn with_capacity(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(WORD_BITS)],
        }
    }

    /// Sets bit `index`, growing as needed.
    pub fn set(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % WORD_BITS);
    }

    /// Clears bit `index`.
    pub fn clear(&mut self, index: usize) {
        if let Some(w) = self.words.get_mut(index / WORD_BITS) {
            *w &= !(1u64 << (index % WORD_BITS));
        }
    }

    /// Returns bit `index`; bits past the end read as clear.
    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .map(|w| w & (1u64 << (index % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    /// Sets every bit that is set in `other`.
    pub fn union_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
    }

    /// Returns true if every set bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &BitSet) -> bool {
        self.words.iter().enumerate().all(|(i, w)| {
            let o = other.words.get(i).copied().unwrap_or(0);
            w & !o == 0
        })
    }

    /// Returns true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Clears every bit without releasing storage.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterator over set bit indices, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            (0..WORD_BITS).filter_map(move |b| {
                if w & (1u64 << b) != 0 {
                    Some(wi * WORD_BITS + b)
                } else {
                    None
                }
            })
        })
    }

    /// Encodes as a u16 byte count plus packed little-endian bytes.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut bytes: Vec<u8> = Vec::with_capacity(self.words.len() * 8);
        for w in &self.words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        buf.put_u16(bytes.len() as u16);
        buf.put_slice(&bytes);
    }

    /// Decodes a bit-set written by [`BitSet::encode`].
    pub fn decode(buf: &mut impl Buf) -> Result<Self, TypeError> {
        if buf.remaining() < 2 {
            return Err(TypeError::Truncated {
                needed: 2 - buf.remaining(),
            });
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(TypeError::Truncated {
                needed: len - buf.remaining(),
            });
        }
        let mut words = vec![0u64; len.div_ceil(8)];
        for i in 0..len {
            let b = buf.get_u8() as u64;
            words[i / 8] |= b << ((i % 8) * 8);
        }
        Ok(Self { words })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_set_get_clear() {
        let mut bs = BitSet::new();
        assert!(!bs.get(5));
        bs.set(5);
        bs.set(130);
        assert!(bs.get(5));
        assert!(bs.get(130));
        assert!(!bs.get(129));
        bs.clear(5);
        assert!(!bs.get(5));
        assert_eq!(bs.count_ones(), 1);
    }

    #[test]
    fn test_union_and_subset() {
        let mut a = BitSet::new();
        a.set(1);
        a.set(70);

        let mut b = BitSet::new();
        b.set(70);
        assert!(b.is_subset_of(&a));
        assert!(!a.is_subset_of(&b));

        b.union_with(&a);
        assert!(a.is_subset_of(&b));
        assert_eq!(b.count_ones(), 2);
    }

    #[test]
    fn test_ones_iterator() {
        let mut bs = BitSet::with_capacity(200);
        bs.set(0);
        bs.set(63);
        bs.set(64);
        bs.set(199);
        assert_eq!(bs.ones().collect::<Vec<_>>(), vec![0, 63, 64, 199]);
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut bs = BitSet::new();
        bs.set(3);
        bs.set(100);

        let mut buf = BytesMut::new();
        bs.encode(&mut buf);
        let decoded = BitSet::decode(&mut buf).unwrap();

        assert!(decoded.get(3));
        assert!(decoded.get(100));
        assert_eq!(decoded.count_ones(), 2);
    }

    #[test]
    fn test_encode_trims_trailing_zeros() {
        let mut bs = BitSet::with_capacity(512);
        bs.set(2);

        let mut buf = BytesMut::new();
        bs.encode(&mut buf);
        // u16 length + a single significant byte
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u16(8);
        buf.put_u8(0xFF);
        let result = BitSet::decode(&mut buf);
        assert!(matches!(result, Err(TypeError::Truncated { .. })));
    }

    #[test]
    fn test_empty_roundtrip() {
        let bs = BitSet::new();
        let mut buf = BytesMut::new();
        bs.encode(&mut buf);
        let decoded = BitSet::decode(&mut buf).unwrap();
        assert!(decoded.is_empty());
    }
}
