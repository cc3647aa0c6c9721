//! Metadata image format
//!
//! An image is the unit a producer hands to a runtime: the target parameters
//! plus every function record, sorted by entry address.

use crate::abi::{FuncdataSlot, PcdataChannel, PROTOCOL_VERSION};
use crate::encoder::{DecodeError, TableReader, TableWriter};
use crate::func::{ArgsSize, FuncRecord};
use crate::pcvalue::PcTable;
use crate::target::Target;
use thiserror::Error;

/// Magic number for metadata images: "GCMT"
pub const MAGIC: [u8; 4] = *b"GCMT";

/// Header size: magic + version + checksum
const HEADER_LEN: usize = 12;

/// Image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ImageError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected GCMT, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Image built against another numbering
    #[error("Unsupported protocol version: {0} (current: {current})", current = PROTOCOL_VERSION)]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Checksum of the payload as read
        actual: u32,
    },

    /// Target parameters out of range
    #[error("Invalid target: pointer size {ptr_size}, pc quantum {pc_quantum}")]
    InvalidTarget {
        /// Pointer size
        ptr_size: u8,
        /// pc quantum
        pc_quantum: u8,
    },

    /// Two functions claim the same code
    #[error("Function {name} [{entry:#x}, {end:#x}) overlaps {other}")]
    Overlap {
        /// Function being added
        name: String,
        /// Its entry
        entry: u64,
        /// Its end
        end: u64,
        /// Function already present
        other: String,
    },
}

/// All metadata for one binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataImage {
    /// Target the tables were produced for
    pub target: Target,
    functions: Vec<FuncRecord>,
}

impl MetadataImage {
    /// Create an empty image
    pub fn new(target: Target) -> Self {
        Self {
            target,
            functions: Vec::new(),
        }
    }

    /// Functions sorted by entry
    pub fn functions(&self) -> &[FuncRecord] {
        &self.functions
    }

    /// Add a function, keeping entries sorted and ranges disjoint
    pub fn add_function(&mut self, func: FuncRecord) -> Result<(), ImageError> {
        let at = self.functions.partition_point(|f| f.entry < func.entry);
        let overlaps = |other: &FuncRecord| {
            func.entry < other.end() && other.entry < func.end()
                || other.entry == func.entry
        };
        let neighbor = at
            .checked_sub(1)
            .and_then(|i| self.functions.get(i))
            .filter(|f| overlaps(f))
            .or_else(|| self.functions.get(at).filter(|f| overlaps(f)));
        if let Some(other) = neighbor {
            return Err(ImageError::Overlap {
                name: func.name.clone(),
                entry: func.entry,
                end: func.end(),
                other: other.name.clone(),
            });
        }
        log::debug!(
            "adding {} [{:#x}, {:#x})",
            func.name,
            func.entry,
            func.end()
        );
        self.functions.insert(at, func);
        Ok(())
    }

    /// Function whose code contains `pc`
    pub fn find_func(&self, pc: u64) -> Option<&FuncRecord> {
        let at = self.functions.partition_point(|f| f.entry <= pc);
        at.checked_sub(1)
            .map(|i| &self.functions[i])
            .filter(|f| f.contains(pc))
    }

    /// Function by name
    pub fn func_by_name(&self, name: &str) -> Option<&FuncRecord> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Encode the image
    ///
    /// Format:
    /// - Header: magic (4 bytes) + version (u32) + checksum (u32)
    /// - Target: ptr_size (u8) + pc_quantum (u8)
    /// - Function table
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = TableWriter::new();
        writer.emit_raw(&MAGIC);
        writer.emit_u32(PROTOCOL_VERSION);
        let checksum_offset = writer.offset();
        writer.emit_u32(0);

        writer.emit_u8(self.target.ptr_size);
        writer.emit_u8(self.target.pc_quantum);

        writer.emit_uvarint(self.functions.len() as u32);
        for func in &self.functions {
            encode_function(func, &mut writer);
        }

        let checksum = crc32fast::hash(&writer.buffer()[HEADER_LEN..]);
        writer.patch_u32(checksum_offset, checksum);
        writer.into_bytes()
    }

    /// Decode an image, rejecting other protocol versions
    pub fn decode(data: &[u8]) -> Result<Self, ImageError> {
        let mut reader = TableReader::new(data);

        let magic = reader.read_slice(4)?;
        let magic = [magic[0], magic[1], magic[2], magic[3]];
        if magic != MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }

        let stored_checksum = reader.read_u32()?;
        let calculated_checksum = crc32fast::hash(&data[HEADER_LEN..]);
        if stored_checksum != calculated_checksum {
            return Err(ImageError::ChecksumMismatch {
                expected: stored_checksum,
                actual: calculated_checksum,
            });
        }

        let target = Target {
            ptr_size: reader.read_u8()?,
            pc_quantum: reader.read_u8()?,
        };
        if !target.is_valid() {
            return Err(ImageError::InvalidTarget {
                ptr_size: target.ptr_size,
                pc_quantum: target.pc_quantum,
            });
        }

        let count = reader.read_uvarint()?;
        let mut image = Self::new(target);
        for _ in 0..count {
            let func = decode_function(&mut reader)?;
            image.add_function(func)?;
        }
        log::debug!("decoded image with {} functions", image.functions.len());
        Ok(image)
    }
}

fn encode_function(func: &FuncRecord, writer: &mut TableWriter) {
    writer.emit_string(&func.name);
    writer.emit_u64(func.entry);
    writer.emit_u32(func.len);
    writer.emit_u32(func.args_size.to_raw());
    writer.emit_u32(func.frame_size);

    let pcdata: Vec<_> = PcdataChannel::ALL
        .iter()
        .filter_map(|&c| func.pcdata_table(c).map(|t| (c.index(), t.as_bytes())))
        .collect();
    writer.emit_uvarint(pcdata.len() as u32);
    for (index, bytes) in pcdata {
        writer.emit_u8(index as u8);
        writer.emit_bytes(bytes);
    }

    let funcdata: Vec<_> = FuncdataSlot::ALL
        .iter()
        .filter_map(|&s| func.funcdata(s).map(|t| (s.index(), t)))
        .collect();
    writer.emit_uvarint(funcdata.len() as u32);
    for (index, bytes) in funcdata {
        writer.emit_u8(index as u8);
        writer.emit_bytes(bytes);
    }
}

fn decode_function(reader: &mut TableReader<'_>) -> Result<FuncRecord, DecodeError> {
    let name = reader.read_string()?;
    let entry = reader.read_u64()?;
    let len = reader.read_u32()?;
    let mut func = FuncRecord::new(name, entry, len);
    func.args_size = ArgsSize::from_raw(reader.read_u32()?);
    func.frame_size = reader.read_u32()?;
    if entry.checked_add(len as u64).is_none() {
        return Err(reader.malformed(format!("{} wraps the address space", func.name)));
    }

    let n_pcdata = reader.read_uvarint()?;
    for _ in 0..n_pcdata {
        let index = reader.read_u8()?;
        let bytes = reader.read_bytes()?;
        match PcdataChannel::from_index(index as u32) {
            Some(channel) => func.pcdata[channel.index()] = Some(PcTable::from_bytes(bytes)),
            None => log::debug!("{}: skipping unknown PCDATA channel {}", func.name, index),
        }
    }

    let n_funcdata = reader.read_uvarint()?;
    for _ in 0..n_funcdata {
        let index = reader.read_u8()?;
        let bytes = reader.read_bytes()?;
        match FuncdataSlot::from_index(index as u32) {
            Some(slot) => func.funcdata[slot.index()] = Some(bytes),
            None => log::debug!("{}: skipping unknown FUNCDATA slot {}", func.name, index),
        }
    }
    Ok(func)
}
