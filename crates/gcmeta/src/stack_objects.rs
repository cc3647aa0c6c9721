//! Stack object descriptors
//!
//! Stack objects are function-local values whose address is taken, so the
//! collector must treat them as objects (with their own pointer layout)
//! rather than as independent slots.

use crate::encoder::{DecodeError, TableReader, TableWriter};
use crate::stackmap::BitVector;

/// One stack object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackObjectRecord {
    /// Frame offset: negative is relative to the locals base (`varp`),
    /// non-negative relative to the args base (`argp`)
    pub offset: i32,
    /// Object size in bytes
    pub size: u32,
    /// Length of the prefix that may contain pointers, in bytes
    pub ptr_bytes: u32,
    /// One bit per pointer-sized word of the prefix
    pub ptr_mask: BitVector,
}

impl StackObjectRecord {
    /// Whether the object lives in the locals region
    pub fn in_locals(&self) -> bool {
        self.offset < 0
    }

    /// Byte offsets of pointer words, relative to the object start
    pub fn pointer_offsets(&self, ptr_size: u32) -> impl Iterator<Item = u32> + '_ {
        self.ptr_mask.iter_ones().map(move |i| i * ptr_size)
    }
}

/// All stack objects of a function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackObjects {
    /// Records ordered by offset
    pub records: Vec<StackObjectRecord>,
}

impl StackObjects {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record with pointers at the given word indices
    pub fn push(&mut self, offset: i32, size: u32, ptr_size: u32, ptr_words: &[u32]) {
        let prefix_words = ptr_words.iter().map(|&w| w + 1).max().unwrap_or(0);
        self.records.push(StackObjectRecord {
            offset,
            size,
            ptr_bytes: prefix_words * ptr_size,
            ptr_mask: BitVector::with_bits(prefix_words, ptr_words),
        });
        self.records.sort_by_key(|r| r.offset);
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Encode to the wire format
    pub fn encode(&self, ptr_size: u32) -> Vec<u8> {
        let mut writer = TableWriter::new();
        writer.emit_uvarint(self.records.len() as u32);
        for record in &self.records {
            writer.emit_svarint(record.offset);
            writer.emit_uvarint(record.size);
            writer.emit_uvarint(record.ptr_bytes);
            let words = record.ptr_bytes / ptr_size;
            writer.emit_raw(record.ptr_mask.resized(words).as_bytes());
        }
        writer.into_bytes()
    }

    /// Decode from the wire format
    pub fn decode(data: &[u8], ptr_size: u32) -> Result<Self, DecodeError> {
        let mut reader = TableReader::new(data);
        let count = reader.read_uvarint()?;
        let mut records = Vec::with_capacity((count as usize).min(reader.remaining()));
        for _ in 0..count {
            let offset = reader.read_svarint()?;
            let size = reader.read_uvarint()?;
            let ptr_bytes = reader.read_uvarint()?;
            if ptr_bytes > size {
                return Err(reader.malformed(format!(
                    "pointer prefix {} larger than object size {}",
                    ptr_bytes, size
                )));
            }
            if ptr_bytes % ptr_size != 0 {
                return Err(reader.malformed(format!(
                    "pointer prefix {} not a multiple of the pointer size",
                    ptr_bytes
                )));
            }
            let words = ptr_bytes / ptr_size;
            let mask = reader.read_slice((words as usize + 7) / 8)?;
            records.push(StackObjectRecord {
                offset,
                size,
                ptr_bytes,
                ptr_mask: BitVector::from_bytes(words, mask.to_vec()),
            });
        }
        Ok(Self { records })
    }
}
