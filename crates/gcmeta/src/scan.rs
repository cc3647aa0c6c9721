//! Frame scanning
//!
//! The consumer side of the protocol. Given where a frame is suspended, the
//! scanner resolves the active PCDATA values, picks the matching bitmaps out
//! of the FUNCDATA tables and reports every stack slot the collector has to
//! treat as a root.
//!
//! Frame layout assumed here, per physical frame:
//!
//! ```text
//!   argp + args_size  +----------------+
//!                     |  args/results  |  args pointer maps, bit i = argp + i*ptr
//!   argp              +----------------+
//!                     |      ...       |
//!   varp              +----------------+
//!                     |     locals     |  locals pointer maps end at varp
//!   varp - frame_size +----------------+
//! ```

use crate::abi::{PcdataChannel, UnsafePoint};
use crate::defer_info::DeferLocation;
use crate::encoder::DecodeError;
use crate::func::{ArgsSize, FuncRecord};
use crate::image::MetadataImage;
use crate::stackmap::StackMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do with a non-empty region that has no pointer map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMapPolicy {
    /// Treat every word of the region as a possible pointer
    #[default]
    Conservative,
    /// Report nothing for the region
    Skip,
}

/// Scanner configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Policy for locals without a pointer map
    pub missing_locals: MissingMapPolicy,
    /// Policy for arguments without a pointer map
    pub missing_args: MissingMapPolicy,
    /// Scan frames stopped at unsafe points instead of refusing them
    pub allow_unsafe_points: bool,
}

/// Where a frame is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Resume pc
    pub pc: u64,
    /// Locals base (top of the locals region)
    pub varp: u64,
    /// Args base
    pub argp: u64,
    /// The frame is suspended in a call and `pc` is its return address
    pub at_call: bool,
}

/// A stack word holding a live pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSlot {
    /// Byte offset from the region base (`argp` or `varp`)
    pub offset: i64,
    /// Address of the word
    pub addr: u64,
}

/// Result of scanning one region of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionScan {
    /// Exact live pointer slots
    Precise(Vec<LiveSlot>),
    /// No map: every word in `[base, base + words * ptr)` may be a pointer
    Conservative {
        /// Lowest address of the region
        base: u64,
        /// Number of words
        words: u32,
    },
    /// No map and the policy says to ignore the region
    Skipped,
    /// Args size is not statically known; never scanned precisely
    SizeUnknown,
}

impl RegionScan {
    /// Live slots, if the region was scanned precisely
    pub fn precise(&self) -> Option<&[LiveSlot]> {
        match self {
            RegionScan::Precise(slots) => Some(slots),
            _ => None,
        }
    }

    /// Number of live pointers found precisely
    pub fn pointer_count(&self) -> usize {
        self.precise().map_or(0, <[LiveSlot]>::len)
    }
}

/// A stack object and the addresses of its pointer words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackObjectRoot {
    /// Address of the object
    pub addr: u64,
    /// Object size in bytes
    pub size: u32,
    /// Addresses of words that may hold pointers
    pub pointers: Vec<u64>,
}

/// One logical frame of a physical frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalFrame {
    /// Function name
    pub name: String,
    /// Whether the body was inlined into the physical function
    pub inlined: bool,
    /// Source line where an inlined callee starts
    pub start_line: Option<u32>,
}

/// Everything the scanner found in one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScan {
    /// Physical function name
    pub func: String,
    /// Its entry address
    pub entry: u64,
    /// pc used for table lookups
    pub lookup_pc: u64,
    /// Unsafe-point classification at `lookup_pc`
    pub unsafe_point: UnsafePoint,
    /// Stack-map index at `lookup_pc`
    pub stack_map_index: i32,
    /// Argument region
    pub args: RegionScan,
    /// Locals region
    pub locals: RegionScan,
    /// Address-taken locals and arguments
    pub stack_objects: Vec<StackObjectRoot>,
    /// Logical frames, innermost first, physical function last
    pub inline_frames: Vec<LogicalFrame>,
    /// Open-coded defer state, if the function has any
    pub defer: Option<DeferLocation>,
}

/// Scanning errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// pc outside every function
    #[error("No function contains pc {0:#x}")]
    NoFunction(u64),

    /// Frame stopped where suspension is not permitted
    #[error("{func}: pc {pc:#x} is an unsafe point ({kind:?})")]
    UnsafePoint {
        /// Function name
        func: String,
        /// Lookup pc
        pc: u64,
        /// Classification found
        kind: UnsafePoint,
    },

    /// Stack-map index without a bitmap
    #[error("{func}: stack map index {index} out of range ({count} bitmaps)")]
    StackMapIndexOutOfRange {
        /// Function name
        func: String,
        /// Index found
        index: i32,
        /// Bitmaps in the map
        count: usize,
    },

    /// Inline index without a node
    #[error("{func}: inline index {index} out of range")]
    InlineIndexOutOfRange {
        /// Function name
        func: String,
        /// Index found
        index: i32,
    },

    /// Inline node whose parent pc lies outside the function
    #[error("{func}: inline node {index} has parent pc {parent_pc:#x} outside the function")]
    InlineParentOutOfRange {
        /// Function name
        func: String,
        /// Inline tree index
        index: i32,
        /// Offending parent pc offset
        parent_pc: u32,
    },

    /// Inline parent chain does not terminate
    #[error("{func}: inline parent chain at pc {pc:#x} does not terminate")]
    InlineCycle {
        /// Function name
        func: String,
        /// Lookup pc
        pc: u64,
    },

    /// A table failed to decode
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Reads frames against one image
///
/// Scanning never mutates the image, so one image can back any number of
/// scanners on any number of threads.
#[derive(Debug, Clone, Copy)]
pub struct FrameScanner<'a> {
    image: &'a MetadataImage,
    options: ScanOptions,
}

impl<'a> FrameScanner<'a> {
    /// Create a scanner
    pub fn new(image: &'a MetadataImage, options: ScanOptions) -> Self {
        Self { image, options }
    }

    /// Options in use
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Scan the frames of one stack, innermost first
    ///
    /// Every frame but the innermost is suspended at a call.
    pub fn scan_stack(&self, frames: &[FrameContext]) -> Result<Vec<FrameScan>, ScanError> {
        frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                let frame = FrameContext {
                    at_call: frame.at_call || i > 0,
                    ..*frame
                };
                self.scan_frame(&frame)
            })
            .collect()
    }

    /// Scan one frame
    pub fn scan_frame(&self, frame: &FrameContext) -> Result<FrameScan, ScanError> {
        // A call in the last instruction returns to the next function's entry
        let func = frame
            .at_call
            .then(|| frame.pc.checked_sub(1))
            .flatten()
            .and_then(|pc| self.image.find_func(pc))
            .or_else(|| self.image.find_func(frame.pc))
            .ok_or(ScanError::NoFunction(frame.pc))?;

        // A return address belongs to the instruction after the call
        let lookup_pc = if frame.at_call && frame.pc != func.entry {
            frame.pc - 1
        } else {
            frame.pc
        };
        let target = &self.image.target;

        let raw = func.pcdata_value(PcdataChannel::UnsafePoint, lookup_pc, target)?;
        let unsafe_point = UnsafePoint::from_value(raw).unwrap_or(UnsafePoint::Unsafe);
        if !unsafe_point.is_safe() && !self.options.allow_unsafe_points {
            return Err(ScanError::UnsafePoint {
                func: func.name.clone(),
                pc: lookup_pc,
                kind: unsafe_point,
            });
        }

        let stack_map_index = func.pcdata_value(PcdataChannel::StackMapIndex, lookup_pc, target)?;
        log::trace!(
            "{}: pc {:#x} lookup {:#x} stack map index {}",
            func.name,
            frame.pc,
            lookup_pc,
            stack_map_index
        );

        let args = self.scan_args(func, frame, stack_map_index)?;
        let locals = self.scan_locals(func, frame, stack_map_index)?;
        let stack_objects = self.stack_objects(func, frame)?;
        let inline_frames = self.inline_frames(func, lookup_pc)?;
        let defer = func.open_coded_defer_info()?.map(|info| info.locate(frame.varp));

        Ok(FrameScan {
            func: func.name.clone(),
            entry: func.entry,
            lookup_pc,
            unsafe_point,
            stack_map_index,
            args,
            locals,
            stack_objects,
            inline_frames,
            defer,
        })
    }

    fn scan_args(
        &self,
        func: &FuncRecord,
        frame: &FrameContext,
        index: i32,
    ) -> Result<RegionScan, ScanError> {
        let size = match func.args_size {
            ArgsSize::Unknown => return Ok(RegionScan::SizeUnknown),
            ArgsSize::Known(0) => return Ok(RegionScan::Precise(Vec::new())),
            ArgsSize::Known(size) => size,
        };
        match func.args_pointer_maps()? {
            Some(map) => self.precise(func, &map, index, frame.argp, 0),
            None => Ok(self.missing(
                func,
                "args",
                self.options.missing_args,
                frame.argp,
                size,
            )),
        }
    }

    fn scan_locals(
        &self,
        func: &FuncRecord,
        frame: &FrameContext,
        index: i32,
    ) -> Result<RegionScan, ScanError> {
        if func.frame_size == 0 {
            return Ok(RegionScan::Precise(Vec::new()));
        }
        match func.locals_pointer_maps()? {
            Some(map) => {
                let ptr_size = self.image.target.ptr_bytes() as i64;
                let base_offset = -(map.n_bits() as i64 * ptr_size);
                self.precise(func, &map, index, frame.varp, base_offset)
            }
            None => Ok(self.missing(
                func,
                "locals",
                self.options.missing_locals,
                frame.varp.wrapping_sub(func.frame_size as u64),
                func.frame_size,
            )),
        }
    }

    fn precise(
        &self,
        func: &FuncRecord,
        map: &StackMap,
        index: i32,
        base: u64,
        base_offset: i64,
    ) -> Result<RegionScan, ScanError> {
        let mut slots = Vec::new();
        if map.n_bits() == 0 {
            return Ok(RegionScan::Precise(slots));
        }
        if map.bitmap(index).is_none() {
            return Err(ScanError::StackMapIndexOutOfRange {
                func: func.name.clone(),
                index,
                count: map.len(),
            });
        }
        map.for_each_pointer_offset(index, base_offset, self.image.target.ptr_bytes(), |offset| {
            slots.push(LiveSlot {
                offset,
                addr: base.wrapping_add_signed(offset),
            })
        });
        Ok(RegionScan::Precise(slots))
    }

    fn missing(
        &self,
        func: &FuncRecord,
        region: &str,
        policy: MissingMapPolicy,
        base: u64,
        size: u32,
    ) -> RegionScan {
        log::debug!(
            "{}: no {} pointer map for {} bytes, policy {:?}",
            func.name,
            region,
            size,
            policy
        );
        match policy {
            MissingMapPolicy::Conservative => {
                let ptr_size = self.image.target.ptr_bytes();
                RegionScan::Conservative {
                    base,
                    words: (size + ptr_size - 1) / ptr_size,
                }
            }
            MissingMapPolicy::Skip => RegionScan::Skipped,
        }
    }

    fn stack_objects(
        &self,
        func: &FuncRecord,
        frame: &FrameContext,
    ) -> Result<Vec<StackObjectRoot>, ScanError> {
        let ptr_size = self.image.target.ptr_bytes();
        let Some(objects) = func.stack_objects(&self.image.target)? else {
            return Ok(Vec::new());
        };
        Ok(objects
            .records
            .iter()
            .map(|record| {
                let base = if record.in_locals() { frame.varp } else { frame.argp };
                let addr = base.wrapping_add_signed(record.offset as i64);
                StackObjectRoot {
                    addr,
                    size: record.size,
                    pointers: record
                        .pointer_offsets(ptr_size)
                        .map(|offset| addr.wrapping_add(offset as u64))
                        .collect(),
                }
            })
            .collect())
    }

    fn inline_frames(&self, func: &FuncRecord, lookup_pc: u64) -> Result<Vec<LogicalFrame>, ScanError> {
        let mut frames = Vec::new();
        if let Some(tree) = func.inline_tree()? {
            let target = &self.image.target;
            let mut index = func.pcdata_value(PcdataChannel::InlTreeIndex, lookup_pc, target)?;
            while index >= 0 {
                if frames.len() >= tree.len() {
                    return Err(ScanError::InlineCycle {
                        func: func.name.clone(),
                        pc: lookup_pc,
                    });
                }
                let call = tree.get(index).ok_or_else(|| ScanError::InlineIndexOutOfRange {
                    func: func.name.clone(),
                    index,
                })?;
                frames.push(LogicalFrame {
                    name: call.name.clone(),
                    inlined: true,
                    start_line: Some(call.start_line),
                });
                if call.parent_pc >= func.len {
                    return Err(ScanError::InlineParentOutOfRange {
                        func: func.name.clone(),
                        index,
                        parent_pc: call.parent_pc,
                    });
                }
                let parent_pc = func.entry.wrapping_add(call.parent_pc as u64);
                index = func.pcdata_value(PcdataChannel::InlTreeIndex, parent_pc, target)?;
            }
        }
        frames.push(LogicalFrame {
            name: func.name.clone(),
            inlined: false,
            start_line: None,
        });
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::FuncdataSlot;
    use crate::annotate::{RoutineBuilder, RoutineDecl};
    use crate::defer_info::OpenCodedDeferInfo;
    use crate::inline::InlineTree;
    use crate::prototype::{ParamKind, Prototype};
    use crate::stack_objects::StackObjects;
    use crate::stackmap::BitVector;
    use crate::target::Target;

    fn image_with(func: FuncRecord) -> MetadataImage {
        let mut image = MetadataImage::new(Target::AMD64);
        image.add_function(func).unwrap();
        image
    }

    fn frame(pc: u64) -> FrameContext {
        FrameContext {
            pc,
            varp: 0x8000,
            argp: 0x8100,
            at_call: false,
        }
    }

    fn locals(bits: u32, maps: &[&[u32]]) -> Vec<u8> {
        let mut map = StackMap::new(bits);
        for set in maps {
            map.push(BitVector::with_bits(bits, set));
        }
        map.encode()
    }

    #[test]
    fn test_no_function() {
        let image = MetadataImage::new(Target::AMD64);
        let scanner = FrameScanner::new(&image, ScanOptions::default());
        assert!(matches!(
            scanner.scan_frame(&frame(0x1000)),
            Err(ScanError::NoFunction(0x1000))
        ));
    }

    #[test]
    fn test_leaf_without_tables() {
        let image = image_with(FuncRecord::new("leaf", 0x1000, 16));
        let scan = FrameScanner::new(&image, ScanOptions::default())
            .scan_frame(&frame(0x1004))
            .unwrap();
        assert_eq!(scan.args, RegionScan::Precise(vec![]));
        assert_eq!(scan.locals, RegionScan::Precise(vec![]));
        assert!(scan.stack_objects.is_empty());
        assert_eq!(scan.inline_frames.len(), 1);
        assert!(scan.defer.is_none());
        assert_eq!(scan.stack_map_index, -1);
    }

    #[test]
    fn test_precise_locals_follow_stack_map_index() {
        let mut decl = RoutineDecl::new("f", 0x1000, 32);
        decl.frame_size = 32;
        let mut builder = RoutineBuilder::new(decl, Target::AMD64);
        builder
            .funcdata(0, FuncdataSlot::LocalsPointerMaps, locals(4, &[&[0], &[1, 3]]))
            .unwrap();
        builder.pcdata(8, PcdataChannel::StackMapIndex, 1).unwrap();
        let image = image_with(builder.finish().unwrap());
        let scanner = FrameScanner::new(&image, ScanOptions::default());

        let scan = scanner.scan_frame(&frame(0x1004)).unwrap();
        assert_eq!(
            scan.locals.precise().unwrap(),
            &[LiveSlot { offset: -32, addr: 0x8000 - 32 }]
        );

        let scan = scanner.scan_frame(&frame(0x1010)).unwrap();
        let addrs: Vec<u64> = scan.locals.precise().unwrap().iter().map(|s| s.addr).collect();
        assert_eq!(addrs, vec![0x8000 - 24, 0x8000 - 8]);
    }

    #[test]
    fn test_return_address_looks_up_call_site() {
        let mut decl = RoutineDecl::new("f", 0x1000, 16);
        decl.frame_size = 8;
        let mut builder = RoutineBuilder::new(decl, Target::AMD64);
        builder
            .funcdata(0, FuncdataSlot::LocalsPointerMaps, locals(1, &[&[], &[0]]))
            .unwrap();
        builder.pcdata(4, PcdataChannel::StackMapIndex, 1).unwrap();
        builder.pcdata(8, PcdataChannel::StackMapIndex, 0).unwrap();
        let image = image_with(builder.finish().unwrap());
        let scanner = FrameScanner::new(&image, ScanOptions::default());

        // call occupies [4, 8); return address is 8
        let scan = scanner
            .scan_frame(&FrameContext { at_call: true, ..frame(0x1008) })
            .unwrap();
        assert_eq!(scan.lookup_pc, 0x1007);
        assert_eq!(scan.stack_map_index, 1);
        assert_eq!(scan.locals.pointer_count(), 1);

        let scan = scanner.scan_frame(&frame(0x1008)).unwrap();
        assert_eq!(scan.stack_map_index, 0);
        assert_eq!(scan.locals.pointer_count(), 0);
    }

    #[test]
    fn test_call_at_end_of_function() {
        let image = image_with(FuncRecord::new("noreturn", 0x1000, 8));
        let scan = FrameScanner::new(&image, ScanOptions::default())
            .scan_frame(&FrameContext { at_call: true, ..frame(0x1008) })
            .unwrap();
        assert_eq!(scan.func, "noreturn");
        assert_eq!(scan.lookup_pc, 0x1007);
    }

    #[test]
    fn test_call_at_end_of_function_before_adjacent_function() {
        let mut image = image_with(FuncRecord::new("a", 0x1000, 8));
        image.add_function(FuncRecord::new("b", 0x1008, 8)).unwrap();
        let scanner = FrameScanner::new(&image, ScanOptions::default());

        let scan = scanner
            .scan_frame(&FrameContext { at_call: true, ..frame(0x1008) })
            .unwrap();
        assert_eq!(scan.func, "a");
        assert_eq!(scan.lookup_pc, 0x1007);

        let scan = scanner.scan_frame(&frame(0x1008)).unwrap();
        assert_eq!(scan.func, "b");
        assert_eq!(scan.lookup_pc, 0x1008);
    }

    #[test]
    fn test_unsafe_point_refused() {
        let mut builder = RoutineBuilder::new(RoutineDecl::new("f", 0x1000, 16), Target::AMD64);
        builder
            .pcdata(4, PcdataChannel::UnsafePoint, UnsafePoint::Unsafe.value())
            .unwrap();
        builder
            .pcdata(8, PcdataChannel::UnsafePoint, UnsafePoint::Safe.value())
            .unwrap();
        let image = image_with(builder.finish().unwrap());

        let strict = FrameScanner::new(&image, ScanOptions::default());
        assert!(matches!(
            strict.scan_frame(&frame(0x1004)),
            Err(ScanError::UnsafePoint { kind: UnsafePoint::Unsafe, .. })
        ));
        strict.scan_frame(&frame(0x1008)).unwrap();

        let lenient = FrameScanner::new(
            &image,
            ScanOptions {
                allow_unsafe_points: true,
                ..ScanOptions::default()
            },
        );
        let scan = lenient.scan_frame(&frame(0x1004)).unwrap();
        assert_eq!(scan.unsafe_point, UnsafePoint::Unsafe);
    }

    #[test]
    fn test_missing_map_policy() {
        let mut func = FuncRecord::new("f", 0x1000, 16);
        func.args_size = ArgsSize::Known(24);
        func.frame_size = 16;
        let image = image_with(func);

        let scan = FrameScanner::new(&image, ScanOptions::default())
            .scan_frame(&frame(0x1000))
            .unwrap();
        assert_eq!(scan.args, RegionScan::Conservative { base: 0x8100, words: 3 });
        assert_eq!(scan.locals, RegionScan::Conservative { base: 0x8000 - 16, words: 2 });

        let options = ScanOptions {
            missing_locals: MissingMapPolicy::Skip,
            missing_args: MissingMapPolicy::Skip,
            allow_unsafe_points: false,
        };
        let scan = FrameScanner::new(&image, options).scan_frame(&frame(0x1000)).unwrap();
        assert_eq!(scan.args, RegionScan::Skipped);
        assert_eq!(scan.locals, RegionScan::Skipped);
    }

    #[test]
    fn test_unknown_args_size_never_scanned() {
        let mut func = FuncRecord::new("variadic", 0x1000, 16);
        func.args_size = ArgsSize::Unknown;
        func.funcdata[FuncdataSlot::ArgsPointerMaps.index()] = Some(locals(2, &[&[0, 1]]));
        let image = image_with(func);
        let scan = FrameScanner::new(&image, ScanOptions::default())
            .scan_frame(&frame(0x1000))
            .unwrap();
        assert_eq!(scan.args, RegionScan::SizeUnknown);
    }

    #[test]
    fn test_results_become_live() {
        let mut decl = RoutineDecl::new("f", 0x1000, 32);
        decl.args_size = ArgsSize::Known(16);
        let mut builder = RoutineBuilder::new(decl, Target::AMD64).with_prototype(Prototype::new(
            vec![ParamKind::Pointer],
            vec![ParamKind::Pointer],
        ));
        builder.go_args(0).unwrap();
        builder.go_results_initialized(16).unwrap();
        let image = image_with(builder.finish().unwrap());
        let scanner = FrameScanner::new(&image, ScanOptions::default());

        let before = scanner.scan_frame(&frame(0x1008)).unwrap();
        assert_eq!(before.args.precise().unwrap(), &[LiveSlot { offset: 0, addr: 0x8100 }]);
        let after = scanner.scan_frame(&frame(0x1010)).unwrap();
        assert_eq!(after.args.pointer_count(), 2);
        assert_eq!(after.args.precise().unwrap()[1].addr, 0x8108);
    }

    #[test]
    fn test_stack_map_index_out_of_range() {
        let mut func = FuncRecord::new("f", 0x1000, 16);
        func.frame_size = 8;
        func.funcdata[FuncdataSlot::LocalsPointerMaps.index()] = Some(locals(1, &[&[0]]));
        let mut enc = crate::pcvalue::PcValueEncoder::new(1);
        enc.declare(0, 3).unwrap();
        func.pcdata[PcdataChannel::StackMapIndex.index()] = Some(enc.finish(16).unwrap());
        let image = image_with(func);
        assert!(matches!(
            FrameScanner::new(&image, ScanOptions::default()).scan_frame(&frame(0x1000)),
            Err(ScanError::StackMapIndexOutOfRange { index: 3, count: 1, .. })
        ));
    }

    #[test]
    fn test_stack_objects_and_defer() {
        let mut objects = StackObjects::new();
        objects.push(-16, 16, 8, &[1]);
        objects.push(8, 8, 8, &[0]);
        let mut func = FuncRecord::new("f", 0x1000, 16);
        func.args_size = ArgsSize::Known(16);
        func.frame_size = 32;
        func.funcdata[FuncdataSlot::StackObjects.index()] = Some(objects.encode(8));
        func.funcdata[FuncdataSlot::OpenCodedDeferInfo.index()] = Some(
            OpenCodedDeferInfo {
                defer_bits_offset: 17,
                slots_offset: 32,
            }
            .encode(),
        );
        let image = image_with(func);
        let scan = FrameScanner::new(
            &image,
            ScanOptions {
                missing_args: MissingMapPolicy::Skip,
                missing_locals: MissingMapPolicy::Skip,
                ..ScanOptions::default()
            },
        )
        .scan_frame(&frame(0x1000))
        .unwrap();

        assert_eq!(scan.stack_objects.len(), 2);
        assert_eq!(scan.stack_objects[0].addr, 0x8000 - 16);
        assert_eq!(scan.stack_objects[0].pointers, vec![0x8000 - 8]);
        assert_eq!(scan.stack_objects[1].addr, 0x8108);
        assert_eq!(scan.stack_objects[1].pointers, vec![0x8108]);

        let defer = scan.defer.unwrap();
        assert_eq!(defer.bits_addr, 0x8000 - 17);
        assert_eq!(defer.slots_addr, 0x8000 - 32);
    }

    #[test]
    fn test_inline_frames() {
        let mut tree = InlineTree::new();
        let outer = tree.push("outer", 2, 10);
        tree.push("inner", 6, 20);
        let mut builder = RoutineBuilder::new(RoutineDecl::new("f", 0x1000, 16), Target::AMD64);
        builder.funcdata(0, FuncdataSlot::InlTree, tree.encode()).unwrap();
        builder.pcdata(4, PcdataChannel::InlTreeIndex, outer).unwrap();
        builder.pcdata(8, PcdataChannel::InlTreeIndex, 1).unwrap();
        builder.pcdata(12, PcdataChannel::InlTreeIndex, -1).unwrap();
        let image = image_with(builder.finish().unwrap());
        let scanner = FrameScanner::new(&image, ScanOptions::default());

        let names = |pc| -> Vec<String> {
            scanner
                .scan_frame(&frame(pc))
                .unwrap()
                .inline_frames
                .into_iter()
                .map(|f| f.name)
                .collect()
        };
        assert_eq!(names(0x1009), vec!["inner", "outer", "f"]);
        assert_eq!(names(0x1004), vec!["outer", "f"]);
        assert_eq!(names(0x100C), vec!["f"]);
    }

    #[test]
    fn test_inline_cycle() {
        let mut tree = InlineTree::new();
        tree.push("loop", 4, 1);
        let mut builder = RoutineBuilder::new(RoutineDecl::new("f", 0x1000, 16), Target::AMD64);
        builder.funcdata(0, FuncdataSlot::InlTree, tree.encode()).unwrap();
        builder.pcdata(4, PcdataChannel::InlTreeIndex, 0).unwrap();
        let image = image_with(builder.finish().unwrap());
        assert!(matches!(
            FrameScanner::new(&image, ScanOptions::default()).scan_frame(&frame(0x1004)),
            Err(ScanError::InlineCycle { .. })
        ));
    }

    #[test]
    fn test_inline_parent_outside_function() {
        let entry = u64::MAX - 16;
        let mut tree = InlineTree::new();
        tree.push("callee", 0xFFFF_FFF0, 3);
        let mut builder = RoutineBuilder::new(RoutineDecl::new("f", entry, 8), Target::AMD64);
        builder.funcdata(0, FuncdataSlot::InlTree, tree.encode()).unwrap();
        builder.pcdata(0, PcdataChannel::InlTreeIndex, 0).unwrap();
        let image = image_with(builder.finish().unwrap());
        assert!(matches!(
            FrameScanner::new(&image, ScanOptions::default()).scan_frame(&frame(entry)),
            Err(ScanError::InlineParentOutOfRange { index: 0, parent_pc: 0xFFFF_FFF0, .. })
        ));
    }

    #[test]
    fn test_stack_object_near_top_of_address_space() {
        let mut objects = StackObjects::new();
        objects.push(8, 16, 8, &[1]);
        let mut func = FuncRecord::new("f", 0x1000, 16);
        func.args_size = ArgsSize::Known(24);
        func.funcdata[FuncdataSlot::StackObjects.index()] = Some(objects.encode(8));
        let image = image_with(func);
        let options = ScanOptions {
            missing_args: MissingMapPolicy::Skip,
            missing_locals: MissingMapPolicy::Skip,
            ..ScanOptions::default()
        };
        let scan = FrameScanner::new(&image, options)
            .scan_frame(&FrameContext {
                argp: u64::MAX - 11,
                ..frame(0x1000)
            })
            .unwrap();
        assert_eq!(scan.stack_objects[0].addr, u64::MAX - 3);
        assert_eq!(scan.stack_objects[0].pointers, vec![4]);
    }

    #[test]
    fn test_scan_stack_marks_callers_at_call() {
        let mut caller = RoutineBuilder::new(RoutineDecl::new("caller", 0x2000, 16), Target::AMD64);
        caller.pcdata(8, PcdataChannel::StackMapIndex, 0).unwrap();
        let mut image = image_with(FuncRecord::new("callee", 0x1000, 16));
        image.add_function(caller.finish().unwrap()).unwrap();

        let scans = FrameScanner::new(&image, ScanOptions::default())
            .scan_stack(&[frame(0x1004), frame(0x2008)])
            .unwrap();
        assert_eq!(scans[0].lookup_pc, 0x1004);
        assert_eq!(scans[1].lookup_pc, 0x2007);
        assert_eq!(scans[1].stack_map_index, -1);
    }

    #[test]
    fn test_options_from_json() {
        let options: ScanOptions =
            serde_json::from_str(r#"{"missing_locals": "skip", "allow_unsafe_points": true}"#)
                .unwrap();
        assert_eq!(options.missing_locals, MissingMapPolicy::Skip);
        assert_eq!(options.missing_args, MissingMapPolicy::Conservative);
        assert!(options.allow_unsafe_points);
    }

    #[test]
    fn test_image_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MetadataImage>();
        assert_send_sync::<FrameScanner<'static>>();
    }
}
