//! pc-value tables
//!
//! A pc-value table maps every pc offset of a function to a 32-bit value.
//! It is stored as a run-length sequence of `(value delta, pc delta)` pairs:
//!
//! - `value delta`: zigzag varint, the first one relative to `-1`
//! - `pc delta`: unsigned varint in units of the target's pc quantum
//!
//! A zero value-delta byte after the first pair ends the table. Because
//! consecutive ranges never share a value, a zero delta cannot occur anywhere
//! else. Offsets are relative to the function entry.

use crate::abi::PCDATA_NONE;
use crate::encoder::{DecodeError, TableReader, TableWriter};
use thiserror::Error;

/// Errors raised while building a pc-value table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PcValueError {
    /// Declaration earlier than one already made
    #[error("Declaration at pc {pc:#x} precedes earlier declaration at {last:#x}")]
    OutOfOrder {
        /// Offending pc offset
        pc: u32,
        /// Most recent declared pc offset
        last: u32,
    },

    /// Declaration at or past the end of the function
    #[error("Declaration at pc {pc:#x} is outside a function of length {len:#x}")]
    PastEnd {
        /// Offending pc offset
        pc: u32,
        /// Function length
        len: u32,
    },

    /// pc or length not a multiple of the pc quantum
    #[error("Offset {offset:#x} is not a multiple of the pc quantum {quantum}")]
    Misaligned {
        /// Offending offset
        offset: u32,
        /// Target pc quantum
        quantum: u32,
    },
}

/// One decoded range: `value` holds for pc offsets in `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcRange {
    /// First pc offset of the range
    pub start: u32,
    /// One past the last pc offset of the range
    pub end: u32,
    /// Channel value over the range
    pub value: i32,
}

impl PcRange {
    /// Whether `pc` falls inside the range
    #[inline]
    pub fn contains(&self, pc: u32) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// Builds a pc-value table from point-in-time declarations
///
/// Each declaration holds until the next one or until the function ends.
/// Redeclaring the value already in effect is a no-op, and a later
/// declaration at the same pc replaces an earlier one.
#[derive(Debug, Clone)]
pub struct PcValueEncoder {
    quantum: u32,
    /// Range starts and values; always non-empty, starts strictly increasing
    ranges: Vec<(u32, i32)>,
    last_pc: Option<u32>,
}

impl PcValueEncoder {
    /// Create an encoder for a target with the given pc quantum
    pub fn new(quantum: u32) -> Self {
        Self {
            quantum: quantum.max(1),
            ranges: vec![(0, PCDATA_NONE)],
            last_pc: None,
        }
    }

    /// Declare that `value` is in effect from `pc` onward
    pub fn declare(&mut self, pc: u32, value: i32) -> Result<(), PcValueError> {
        if pc % self.quantum != 0 {
            return Err(PcValueError::Misaligned {
                offset: pc,
                quantum: self.quantum,
            });
        }
        if let Some(last) = self.last_pc {
            if pc < last {
                return Err(PcValueError::OutOfOrder { pc, last });
            }
        }
        self.last_pc = Some(pc);

        let len = self.ranges.len();
        let (start, current) = self.ranges[len - 1];
        if start == pc {
            self.ranges[len - 1].1 = value;
            if len >= 2 && self.ranges[len - 2].1 == value {
                self.ranges.pop();
            }
        } else if current != value {
            self.ranges.push((pc, value));
        }
        Ok(())
    }

    /// Value in effect after the most recent declaration
    pub fn current(&self) -> i32 {
        self.ranges[self.ranges.len() - 1].1
    }

    /// Whether no declaration changed the value from its default
    pub fn is_trivial(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].1 == PCDATA_NONE
    }

    /// Encode the table for a function of `len` bytes
    pub fn finish(self, len: u32) -> Result<PcTable, PcValueError> {
        if len % self.quantum != 0 {
            return Err(PcValueError::Misaligned {
                offset: len,
                quantum: self.quantum,
            });
        }
        if let Some(last) = self.last_pc {
            if last >= len {
                return Err(PcValueError::PastEnd { pc: last, len });
            }
        }
        if len == 0 {
            return Ok(PcTable::default());
        }

        let mut writer = TableWriter::with_capacity(self.ranges.len() * 2 + 1);
        let mut prev = PCDATA_NONE;
        for (i, &(start, value)) in self.ranges.iter().enumerate() {
            let end = self.ranges.get(i + 1).map_or(len, |&(next, _)| next);
            writer.emit_svarint(value.wrapping_sub(prev));
            writer.emit_uvarint((end - start) / self.quantum);
            prev = value;
        }
        writer.emit_u8(0);

        log::trace!(
            "encoded pc-value table: {} ranges, {} bytes",
            self.ranges.len(),
            writer.offset()
        );
        Ok(PcTable::from_bytes(writer.into_bytes()))
    }
}

/// An encoded pc-value table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcTable {
    data: Vec<u8>,
}

impl PcTable {
    /// Wrap encoded bytes
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Iterate over the decoded ranges
    pub fn ranges(&self, quantum: u32) -> PcRanges<'_> {
        PcRanges::new(&self.data, quantum)
    }

    /// Value in effect at pc offset `pc`, or `None` if `pc` is past the
    /// ranges the table covers
    pub fn lookup(&self, quantum: u32, pc: u32) -> Result<Option<i32>, DecodeError> {
        for range in self.ranges(quantum) {
            let range = range?;
            if pc < range.end {
                return Ok(Some(range.value));
            }
        }
        Ok(None)
    }

    /// Number of pc bytes the table covers
    pub fn covered_len(&self, quantum: u32) -> Result<u32, DecodeError> {
        let mut end = 0;
        for range in self.ranges(quantum) {
            end = range?.end;
        }
        Ok(end)
    }
}

/// Iterator over the ranges of an encoded pc-value table
pub struct PcRanges<'a> {
    reader: TableReader<'a>,
    quantum: u32,
    pc: u32,
    value: i32,
    first: bool,
    done: bool,
}

impl<'a> PcRanges<'a> {
    fn new(data: &'a [u8], quantum: u32) -> Self {
        Self {
            reader: TableReader::new(data),
            quantum: quantum.max(1),
            pc: 0,
            value: PCDATA_NONE,
            first: true,
            done: false,
        }
    }

    fn step(&mut self) -> Result<Option<PcRange>, DecodeError> {
        match self.reader.peek_u8() {
            None => return Ok(None),
            Some(0) if !self.first => return Ok(None),
            _ => {}
        }

        let delta = self.reader.read_svarint()?;
        let at = self.reader.position();
        let pc_delta = self.reader.read_uvarint()?;
        let end = pc_delta
            .checked_mul(self.quantum)
            .and_then(|bytes| self.pc.checked_add(bytes))
            .ok_or(DecodeError::ValueOverflow(at))?;

        self.value = self.value.wrapping_add(delta);
        self.first = false;
        let range = PcRange {
            start: self.pc,
            end,
            value: self.value,
        };
        self.pc = end;
        Ok(Some(range))
    }
}

impl Iterator for PcRanges<'_> {
    type Item = Result<PcRange, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(range)) => Some(Ok(range)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
