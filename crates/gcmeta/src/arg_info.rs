//! Argument shape descriptors
//!
//! Arg info lets a consumer print (or reflectively inspect) a function's
//! arguments without knowing its signature. It is a byte stream of scalar
//! `(offset, size)` pairs, relative to the args base, and markers:
//!
//! | byte   | meaning                                   |
//! |--------|-------------------------------------------|
//! | `0xff` | end of sequence                           |
//! | `0xfe` | start of aggregate                        |
//! | `0xfd` | end of aggregate                          |
//! | `0xfc` | more arguments elided (`...`)             |
//! | `0xfb` | argument offset too large to encode (`_`) |

use crate::encoder::{DecodeError, TableReader, TableWriter};
use std::fmt::Write as _;

const END_SEQ: u8 = 0xff;
const START_AGG: u8 = 0xfe;
const END_AGG: u8 = 0xfd;
const DOTDOTDOT: u8 = 0xfc;
const OFFSET_TOO_LARGE: u8 = 0xfb;

/// Largest offset a scalar entry can carry
pub const MAX_SCALAR_OFFSET: u32 = OFFSET_TOO_LARGE as u32 - 1;

/// Maximum aggregate nesting
pub const MAX_DEPTH: usize = 5;

/// Maximum number of scalar entries before the rest is elided
pub const MAX_SCALARS: usize = 10;

/// One element of an arg info stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// A scalar value stored in the args region
    Scalar {
        /// Byte offset from the args base
        offset: u8,
        /// Size in bytes
        size: u8,
    },
    /// Opening brace of an aggregate
    StartAgg,
    /// Closing brace of an aggregate
    EndAgg,
    /// Remaining arguments elided
    Ellipsis,
    /// Argument beyond the encodable offset range
    OffsetTooLarge,
}

/// The arg info descriptor of one function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgInfo {
    /// Elements in argument order
    pub shapes: Vec<ArgShape>,
}

impl ArgInfo {
    /// Create an empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a scalar, falling back to the too-large marker when needed
    pub fn push_scalar(&mut self, offset: u32, size: u32) {
        match (u8::try_from(offset), u8::try_from(size)) {
            (Ok(offset), Ok(size)) if offset as u32 <= MAX_SCALAR_OFFSET => {
                self.shapes.push(ArgShape::Scalar { offset, size })
            }
            _ => self.shapes.push(ArgShape::OffsetTooLarge),
        }
    }

    /// Number of scalar entries
    pub fn scalar_count(&self) -> usize {
        self.shapes
            .iter()
            .filter(|s| matches!(s, ArgShape::Scalar { .. }))
            .count()
    }

    /// Encode to the wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = TableWriter::with_capacity(self.shapes.len() * 2 + 1);
        for shape in &self.shapes {
            match *shape {
                ArgShape::Scalar { offset, size } => {
                    writer.emit_u8(offset);
                    writer.emit_u8(size);
                }
                ArgShape::StartAgg => writer.emit_u8(START_AGG),
                ArgShape::EndAgg => writer.emit_u8(END_AGG),
                ArgShape::Ellipsis => writer.emit_u8(DOTDOTDOT),
                ArgShape::OffsetTooLarge => writer.emit_u8(OFFSET_TOO_LARGE),
            }
        }
        writer.emit_u8(END_SEQ);
        writer.into_bytes()
    }

    /// Decode from the wire format
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = TableReader::new(data);
        let mut shapes = Vec::new();
        let mut depth = 0usize;
        loop {
            let byte = reader.read_u8()?;
            let shape = match byte {
                END_SEQ => break,
                START_AGG => {
                    depth += 1;
                    if depth > MAX_DEPTH {
                        return Err(reader.malformed("aggregates nested too deeply"));
                    }
                    ArgShape::StartAgg
                }
                END_AGG => {
                    if depth == 0 {
                        return Err(reader.malformed("unbalanced end of aggregate"));
                    }
                    depth -= 1;
                    ArgShape::EndAgg
                }
                DOTDOTDOT => ArgShape::Ellipsis,
                OFFSET_TOO_LARGE => ArgShape::OffsetTooLarge,
                offset => ArgShape::Scalar {
                    offset,
                    size: reader.read_u8()?,
                },
            };
            shapes.push(shape);
        }
        if depth != 0 {
            return Err(reader.malformed("unterminated aggregate"));
        }
        Ok(Self { shapes })
    }

    /// Render argument values from the bytes of an args region, the way a
    /// traceback prints them: `(0x1, {0x2, 0x3}, ...)`
    pub fn format(&self, args: &[u8]) -> String {
        let mut out = String::from("(");
        let mut need_sep = false;
        for shape in &self.shapes {
            if need_sep && !matches!(shape, ArgShape::EndAgg) {
                out.push_str(", ");
            }
            need_sep = true;
            match *shape {
                ArgShape::Scalar { offset, size } => match read_scalar(args, offset, size) {
                    Some(value) => {
                        let _ = write!(out, "{:#x}", value);
                    }
                    None => out.push('_'),
                },
                ArgShape::StartAgg => {
                    out.push('{');
                    need_sep = false;
                }
                ArgShape::EndAgg => out.push('}'),
                ArgShape::Ellipsis => out.push_str("..."),
                ArgShape::OffsetTooLarge => out.push('_'),
            }
        }
        out.push(')');
        out
    }
}

fn read_scalar(args: &[u8], offset: u8, size: u8) -> Option<u64> {
    let start = offset as usize;
    let bytes = args.get(start..start + size as usize)?;
    let value = match size {
        1 => bytes[0] as u64,
        2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u64,
        4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            u64::from_le_bytes(buf)
        }
        _ => return None,
    };
    Some(value)
}
