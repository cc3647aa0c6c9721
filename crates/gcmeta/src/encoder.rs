//! Table encoding and decoding primitives
//!
//! Every side table is a flat byte string built from a handful of
//! primitives: little-endian fixed-width integers, unsigned LEB128 varints
//! and zigzag-mapped signed varints.

use thiserror::Error;

/// Errors that can occur while decoding a table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unexpected end of table
    #[error("Unexpected end of table at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Varint longer than 32 bits
    #[error("Varint overflow at offset {0}")]
    VarintOverflow(usize),

    /// Accumulated value or pc left the representable range
    #[error("Value overflow at offset {0}")]
    ValueOverflow(usize),

    /// Structurally invalid table contents
    #[error("Malformed table at offset {offset}: {reason}")]
    Malformed {
        /// Offset where decoding stopped
        offset: usize,
        /// What was wrong
        reason: String,
    },
}

/// Table writer
///
/// Appends primitives to an owned buffer.
pub struct TableWriter {
    pub(crate) buffer: Vec<u8>,
}

impl TableWriter {
    /// Create a new table writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new table writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the current buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Current length of the buffer
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    // ===== Fixed width =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 32-bit unsigned integer (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit unsigned integer (little-endian)
    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit raw bytes with no length prefix
    pub fn emit_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Overwrite a previously emitted u32
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        let bytes = value.to_le_bytes();
        self.buffer[offset..offset + 4].copy_from_slice(&bytes);
    }

    // ===== Variable width =====

    /// Emit an unsigned LEB128 varint
    pub fn emit_uvarint(&mut self, mut value: u32) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buffer.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    /// Emit a zigzag-mapped signed varint
    pub fn emit_svarint(&mut self, value: i32) {
        self.emit_uvarint(zigzag_encode(value));
    }

    /// Emit a length-prefixed byte string
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.emit_uvarint(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a length-prefixed UTF-8 string
    pub fn emit_string(&mut self, value: &str) {
        self.emit_bytes(value.as_bytes());
    }
}

impl Default for TableWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Table reader
///
/// Bounds-checked cursor over an encoded table.
pub struct TableReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> TableReader<'a> {
    /// Create a new table reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Look at the next byte without consuming it
    pub fn peek_u8(&self) -> Option<u8> {
        self.buffer.get(self.position).copied()
    }

    // ===== Fixed width =====

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let value = self
            .peek_u8()
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        self.position += 1;
        Ok(value)
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 64-bit unsigned integer (little-endian)
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_slice(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Borrow the next `len` bytes
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let slice = &self.buffer[self.position..end];
        self.position = end;
        Ok(slice)
    }

    // ===== Variable width =====

    /// Read an unsigned LEB128 varint
    pub fn read_uvarint(&mut self) -> Result<u32, DecodeError> {
        let start = self.position;
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 28 && byte > 0x0F {
                return Err(DecodeError::VarintOverflow(start));
            }
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a zigzag-mapped signed varint
    pub fn read_svarint(&mut self) -> Result<i32, DecodeError> {
        Ok(zigzag_decode(self.read_uvarint()?))
    }

    /// Read a length-prefixed byte string
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_uvarint()? as usize;
        Ok(self.read_slice(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_uvarint()? as usize;
        let start = self.position;
        let bytes = self.read_slice(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(start))
    }

    /// Build a [`DecodeError::Malformed`] at the current position
    pub fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Malformed {
            offset: self.position,
            reason: reason.into(),
        }
    }
}

/// Map a signed value onto an unsigned one so small magnitudes stay small
#[inline]
pub fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Inverse of [`zigzag_encode`]
#[inline]
pub fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_sizes() {
        let cases = [(0u32, 1usize), (127, 1), (128, 2), (16383, 2), (16384, 3), (u32::MAX, 5)];
        for (value, len) in cases {
            let mut writer = TableWriter::new();
            writer.emit_uvarint(value);
            assert_eq!(writer.offset(), len, "value {}", value);

            let bytes = writer.into_bytes();
            let mut reader = TableReader::new(&bytes);
            assert_eq!(reader.read_uvarint().unwrap(), value);
            assert!(!reader.has_more());
        }
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for v in [i32::MIN, -1000, -1, 0, 1, 1000, i32::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
    }

    #[test]
    fn test_varint_overflow() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        let mut reader = TableReader::new(&bytes);
        assert_eq!(reader.read_uvarint(), Err(DecodeError::VarintOverflow(0)));
    }

    #[test]
    fn test_truncated_varint() {
        let bytes = [0x80, 0x80];
        let mut reader = TableReader::new(&bytes);
        assert_eq!(reader.read_uvarint(), Err(DecodeError::UnexpectedEnd(2)));
    }

    #[test]
    fn test_fixed_width_and_strings() {
        let mut writer = TableWriter::new();
        writer.emit_u8(7);
        writer.emit_u32(0xDEAD_BEEF);
        writer.emit_u64(0x0102_0304_0506_0708);
        writer.emit_string("·memmove");
        writer.emit_bytes(&[1, 2, 3]);

        let bytes = writer.into_bytes();
        let mut reader = TableReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.read_string().unwrap(), "·memmove");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_invalid_utf8() {
        let bytes = [2, 0xC3, 0x28];
        let mut reader = TableReader::new(&bytes);
        assert_eq!(reader.read_string(), Err(DecodeError::InvalidUtf8(1)));
    }

    #[test]
    fn test_patch_u32() {
        let mut writer = TableWriter::new();
        writer.emit_u32(0);
        writer.emit_u8(9);
        writer.patch_u32(0, 42);
        assert_eq!(writer.buffer(), &[42, 0, 0, 0, 9]);
    }

    #[test]
    fn test_read_slice_bounds() {
        let bytes = [1, 2, 3];
        let mut reader = TableReader::new(&bytes);
        assert!(reader.read_slice(4).is_err());
        assert_eq!(reader.read_slice(3).unwrap(), &[1, 2, 3]);
    }
}
