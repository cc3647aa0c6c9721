//! Function records
//!
//! A function record ties a code range to its PCDATA tables and FUNCDATA
//! side tables. Tables are kept as the immutable bytes the producer emitted;
//! the typed accessors decode them on demand. An absent table is never an
//! error: accessors return `Ok(None)`.

use crate::abi::{FuncdataSlot, PcdataChannel, ARGS_SIZE_UNKNOWN, N_FUNCDATA, N_PCDATA, PCDATA_NONE};
use crate::arg_info::ArgInfo;
use crate::defer_info::OpenCodedDeferInfo;
use crate::encoder::DecodeError;
use crate::inline::InlineTree;
use crate::pcvalue::PcTable;
use crate::stack_objects::StackObjects;
use crate::stackmap::StackMap;
use crate::target::Target;
use std::fmt;

/// Size of a function's argument frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgsSize {
    /// Statically known size in bytes
    Known(u32),
    /// Not statically known; never scanned precisely
    Unknown,
}

impl ArgsSize {
    /// Decode the raw field, mapping the sentinel to `Unknown`
    pub fn from_raw(raw: u32) -> Self {
        if raw == ARGS_SIZE_UNKNOWN {
            ArgsSize::Unknown
        } else {
            ArgsSize::Known(raw)
        }
    }

    /// Raw field value
    pub fn to_raw(self) -> u32 {
        match self {
            ArgsSize::Known(size) => size,
            ArgsSize::Unknown => ARGS_SIZE_UNKNOWN,
        }
    }

    /// Size in bytes, if known
    pub fn known(self) -> Option<u32> {
        match self {
            ArgsSize::Known(size) => Some(size),
            ArgsSize::Unknown => None,
        }
    }
}

impl fmt::Display for ArgsSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsSize::Known(size) => write!(f, "{}", size),
            ArgsSize::Unknown => write!(f, "unknown"),
        }
    }
}

/// Metadata for one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncRecord {
    /// Symbol name
    pub name: String,
    /// Address of the first instruction
    pub entry: u64,
    /// Code length in bytes
    pub len: u32,
    /// Argument frame size
    pub args_size: ArgsSize,
    /// Size of the locals region below `varp`, in bytes
    pub frame_size: u32,
    /// PCDATA tables by channel index
    pub pcdata: [Option<PcTable>; N_PCDATA],
    /// FUNCDATA tables by slot index
    pub funcdata: [Option<Vec<u8>>; N_FUNCDATA],
}

impl FuncRecord {
    /// Create a record with no tables
    pub fn new(name: impl Into<String>, entry: u64, len: u32) -> Self {
        Self {
            name: name.into(),
            entry,
            len,
            args_size: ArgsSize::Known(0),
            frame_size: 0,
            pcdata: Default::default(),
            funcdata: Default::default(),
        }
    }

    /// One past the last code byte
    pub fn end(&self) -> u64 {
        self.entry.saturating_add(self.len as u64)
    }

    /// Whether `pc` lies in this function's code
    pub fn contains(&self, pc: u64) -> bool {
        self.entry <= pc && pc < self.end()
    }

    /// Table of one PCDATA channel
    pub fn pcdata_table(&self, channel: PcdataChannel) -> Option<&PcTable> {
        self.pcdata[channel.index()].as_ref()
    }

    /// Raw bytes of one FUNCDATA slot
    pub fn funcdata(&self, slot: FuncdataSlot) -> Option<&[u8]> {
        self.funcdata[slot.index()].as_deref()
    }

    /// Value of a PCDATA channel at an absolute pc
    ///
    /// An absent table, or a pc outside the function, reads as `-1`.
    pub fn pcdata_value(
        &self,
        channel: PcdataChannel,
        pc: u64,
        target: &Target,
    ) -> Result<i32, DecodeError> {
        let Some(table) = self.pcdata_table(channel) else {
            return Ok(PCDATA_NONE);
        };
        if !self.contains(pc) {
            return Ok(PCDATA_NONE);
        }
        let offset = (pc - self.entry) as u32;
        Ok(table.lookup(target.quantum(), offset)?.unwrap_or(PCDATA_NONE))
    }

    /// Args pointer maps, if present
    pub fn args_pointer_maps(&self) -> Result<Option<StackMap>, DecodeError> {
        self.funcdata(FuncdataSlot::ArgsPointerMaps)
            .map(StackMap::decode)
            .transpose()
    }

    /// Locals pointer maps, if present
    pub fn locals_pointer_maps(&self) -> Result<Option<StackMap>, DecodeError> {
        self.funcdata(FuncdataSlot::LocalsPointerMaps)
            .map(StackMap::decode)
            .transpose()
    }

    /// Stack object descriptors, if present
    pub fn stack_objects(&self, target: &Target) -> Result<Option<StackObjects>, DecodeError> {
        self.funcdata(FuncdataSlot::StackObjects)
            .map(|data| StackObjects::decode(data, target.ptr_bytes()))
            .transpose()
    }

    /// Inline tree, if present
    pub fn inline_tree(&self) -> Result<Option<InlineTree>, DecodeError> {
        self.funcdata(FuncdataSlot::InlTree)
            .map(InlineTree::decode)
            .transpose()
    }

    /// Open-coded defer info, if present
    pub fn open_coded_defer_info(&self) -> Result<Option<OpenCodedDeferInfo>, DecodeError> {
        self.funcdata(FuncdataSlot::OpenCodedDeferInfo)
            .map(OpenCodedDeferInfo::decode)
            .transpose()
    }

    /// Arg info descriptor, if present
    pub fn arg_info(&self) -> Result<Option<ArgInfo>, DecodeError> {
        self.funcdata(FuncdataSlot::ArgInfo)
            .map(ArgInfo::decode)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcvalue::PcValueEncoder;

    #[test]
    fn test_args_size_sentinel() {
        assert_eq!(ArgsSize::from_raw(0x8000_0000), ArgsSize::Unknown);
        assert_eq!(ArgsSize::from_raw(24), ArgsSize::Known(24));
        assert_eq!(ArgsSize::Unknown.to_raw(), ARGS_SIZE_UNKNOWN);
        assert_eq!(ArgsSize::Unknown.known(), None);
        assert_eq!(ArgsSize::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_contains() {
        let func = FuncRecord::new("f", 0x1000, 0x20);
        assert!(func.contains(0x1000));
        assert!(func.contains(0x101F));
        assert!(!func.contains(0x1020));
        assert!(!func.contains(0xFFF));
    }

    #[test]
    fn test_absent_tables_are_no_information() {
        let func = FuncRecord::new("leaf", 0x1000, 8);
        let target = Target::AMD64;
        assert_eq!(
            func.pcdata_value(PcdataChannel::StackMapIndex, 0x1004, &target).unwrap(),
            -1
        );
        assert!(func.args_pointer_maps().unwrap().is_none());
        assert!(func.locals_pointer_maps().unwrap().is_none());
        assert!(func.stack_objects(&target).unwrap().is_none());
        assert!(func.inline_tree().unwrap().is_none());
        assert!(func.open_coded_defer_info().unwrap().is_none());
        assert!(func.arg_info().unwrap().is_none());
    }

    #[test]
    fn test_pcdata_value() {
        let mut enc = PcValueEncoder::new(1);
        enc.declare(4, 1).unwrap();
        let mut func = FuncRecord::new("f", 0x2000, 8);
        func.pcdata[PcdataChannel::StackMapIndex.index()] = Some(enc.finish(8).unwrap());

        let target = Target::AMD64;
        let value = |pc| func.pcdata_value(PcdataChannel::StackMapIndex, pc, &target).unwrap();
        assert_eq!(value(0x2000), -1);
        assert_eq!(value(0x2004), 1);
        assert_eq!(value(0x2007), 1);
        assert_eq!(value(0x2008), -1);
    }

    #[test]
    fn test_typed_accessor_reports_malformed_table() {
        let mut func = FuncRecord::new("f", 0, 4);
        func.funcdata[FuncdataSlot::LocalsPointerMaps.index()] = Some(vec![1, 0]);
        assert!(func.locals_pointer_maps().is_err());
    }
}
