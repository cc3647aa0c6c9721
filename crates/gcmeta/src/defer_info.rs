//! Open-coded defer state
//!
//! A function with open-coded defers keeps a one-byte bitmask below its
//! locals base recording which deferred calls are armed, followed by one
//! closure slot per defer. Bit `i` set means slot `i` holds a pending call.
//! Pending calls run in reverse order, highest bit first.

use crate::encoder::{DecodeError, TableReader, TableWriter};

/// Maximum number of open-coded defers per function
pub const MAX_OPEN_DEFERS: u32 = 8;

/// Location of the defer bitmask and closure slots, as distances below `varp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCodedDeferInfo {
    /// Distance from `varp` down to the bitmask byte
    pub defer_bits_offset: u32,
    /// Distance from `varp` down to the first closure slot
    pub slots_offset: u32,
}

/// Resolved addresses for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferLocation {
    /// Address of the bitmask byte
    pub bits_addr: u64,
    /// Address of closure slot 0
    pub slots_addr: u64,
}

impl OpenCodedDeferInfo {
    /// Resolve against a frame's locals base
    pub fn locate(&self, varp: u64) -> DeferLocation {
        DeferLocation {
            bits_addr: varp.wrapping_sub(self.defer_bits_offset as u64),
            slots_addr: varp.wrapping_sub(self.slots_offset as u64),
        }
    }

    /// Encode to the wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = TableWriter::with_capacity(4);
        writer.emit_uvarint(self.defer_bits_offset);
        writer.emit_uvarint(self.slots_offset);
        writer.into_bytes()
    }

    /// Decode from the wire format
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = TableReader::new(data);
        let defer_bits_offset = reader.read_uvarint()?;
        let slots_offset = reader.read_uvarint()?;
        Ok(Self {
            defer_bits_offset,
            slots_offset,
        })
    }
}

impl DeferLocation {
    /// Addresses of the closure slots armed in `bits`, in execution order
    pub fn pending(&self, bits: u8, ptr_size: u32) -> Vec<u64> {
        (0..MAX_OPEN_DEFERS)
            .rev()
            .filter(|i| bits & (1 << i) != 0)
            .map(|i| self.slots_addr.wrapping_add((i * ptr_size) as u64))
            .collect()
    }
}
