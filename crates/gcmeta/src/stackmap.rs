//! Stack maps for precise stack scanning
//!
//! A stack map is a list of equally sized bitmaps over the words of one frame
//! region (arguments or locals). The `StackMapIndex` PCDATA channel selects
//! which bitmap is in effect at a given pc.
//!
//! # Format
//!
//! ```text
//! u32 n        number of bitmaps
//! u32 nbit     bits per bitmap (words in the region)
//! n * ceil(nbit / 8) bytes, bit i of bitmap k = word i is a live pointer
//! ```

use crate::encoder::{DecodeError, TableReader, TableWriter};
use std::fmt;

/// A fixed-length bit vector
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitVector {
    n: u32,
    bytes: Vec<u8>,
}

impl BitVector {
    /// Create an all-zero vector of `n` bits
    pub fn new(n: u32) -> Self {
        Self {
            n,
            bytes: vec![0; byte_len(n)],
        }
    }

    /// Create a vector of `n` bits with the given bits set
    pub fn with_bits(n: u32, set: &[u32]) -> Self {
        let mut bv = Self::new(n);
        for &i in set {
            bv.set(i);
        }
        bv
    }

    /// Wrap raw bytes; bits past `n` are cleared
    pub fn from_bytes(n: u32, mut bytes: Vec<u8>) -> Self {
        bytes.resize(byte_len(n), 0);
        let mut bv = Self { n, bytes };
        bv.clear_tail();
        bv
    }

    /// Number of bits
    pub fn len(&self) -> u32 {
        self.n
    }

    /// Whether the vector has no bits at all
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Backing bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Set bit `i`; out-of-range bits are ignored
    pub fn set(&mut self, i: u32) {
        if i < self.n {
            self.bytes[(i / 8) as usize] |= 1 << (i % 8);
        }
    }

    /// Read bit `i`; out-of-range bits read as zero
    pub fn get(&self, i: u32) -> bool {
        i < self.n && self.bytes[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    /// Number of set bits
    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Indices of set bits in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.n).filter(move |&i| self.get(i))
    }

    /// Copy with a different length, truncating or zero-extending
    pub fn resized(&self, n: u32) -> Self {
        Self::from_bytes(n, self.bytes.clone())
    }

    fn clear_tail(&mut self) {
        if self.n % 8 != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << (self.n % 8)) - 1;
            }
        }
    }
}

impl fmt::Display for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.n {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// A list of bitmaps over one frame region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMap {
    n_bits: u32,
    bitmaps: Vec<BitVector>,
}

impl StackMap {
    /// Create an empty stack map whose bitmaps cover `n_bits` words
    pub fn new(n_bits: u32) -> Self {
        Self {
            n_bits,
            bitmaps: Vec::new(),
        }
    }

    /// The shared "no pointers" map: two empty bitmaps, so that both the
    /// entry index and the results-initialized index resolve
    pub fn no_pointers() -> Self {
        let mut map = Self::new(0);
        map.push(BitVector::new(0));
        map.push(BitVector::new(0));
        map
    }

    /// Append a bitmap, resizing it to this map's width. Returns its index.
    pub fn push(&mut self, bitmap: BitVector) -> usize {
        let bitmap = if bitmap.len() == self.n_bits {
            bitmap
        } else {
            bitmap.resized(self.n_bits)
        };
        self.bitmaps.push(bitmap);
        self.bitmaps.len() - 1
    }

    /// Bits per bitmap
    pub fn n_bits(&self) -> u32 {
        self.n_bits
    }

    /// Number of bitmaps
    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    /// Whether the map has no bitmaps
    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Bitmap at a stack-map index. Index `-1` (function entry) selects 0.
    pub fn bitmap(&self, index: i32) -> Option<&BitVector> {
        let index = if index < 0 { 0 } else { index as usize };
        self.bitmaps.get(index)
    }

    /// All bitmaps
    pub fn bitmaps(&self) -> &[BitVector] {
        &self.bitmaps
    }

    /// Whether any bitmap marks any pointer
    pub fn has_pointers(&self) -> bool {
        self.bitmaps.iter().any(|b| b.count_ones() > 0)
    }

    /// Call `f` with the byte offset of every live pointer in bitmap `index`,
    /// relative to `base_offset`
    pub fn for_each_pointer_offset<F>(&self, index: i32, base_offset: i64, ptr_size: u32, mut f: F)
    where
        F: FnMut(i64),
    {
        if let Some(bitmap) = self.bitmap(index) {
            for i in bitmap.iter_ones() {
                f(base_offset + i as i64 * ptr_size as i64);
            }
        }
    }

    /// Encode to the wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = TableWriter::with_capacity(8 + self.bitmaps.len() * byte_len(self.n_bits));
        writer.emit_u32(self.bitmaps.len() as u32);
        writer.emit_u32(self.n_bits);
        for bitmap in &self.bitmaps {
            writer.emit_raw(bitmap.as_bytes());
        }
        writer.into_bytes()
    }

    /// Decode from the wire format
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = TableReader::new(data);
        let n = reader.read_u32()?;
        let n_bits = reader.read_u32()?;
        let per = byte_len(n_bits);

        let needed = (n as usize).checked_mul(per);
        if needed.map_or(true, |needed| needed > reader.remaining()) {
            return Err(reader.malformed(format!(
                "{} bitmaps of {} bits exceed {} remaining bytes",
                n,
                n_bits,
                reader.remaining()
            )));
        }

        let mut bitmaps = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let bytes = reader.read_slice(per)?;
            bitmaps.push(BitVector::from_bytes(n_bits, bytes.to_vec()));
        }
        Ok(Self { n_bits, bitmaps })
    }
}

impl fmt::Display for StackMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {} bits", self.bitmaps.len(), self.n_bits)?;
        for (i, bitmap) in self.bitmaps.iter().enumerate() {
            write!(f, "\n  [{}] {}", i, bitmap)?;
        }
        Ok(())
    }
}

#[inline]
fn byte_len(bits: u32) -> usize {
    (bits as usize + 7) / 8
}
