//! Metadata verification
//!
//! Checks that each function record is internally consistent before a
//! runtime trusts it: every table decodes, pc tables cover exactly the code,
//! and every index or offset a table carries points somewhere valid.

use crate::abi::{PcdataChannel, UnsafePoint, PCDATA_NONE};
use crate::encoder::DecodeError;
use crate::func::{ArgsSize, FuncRecord};
use crate::image::MetadataImage;
use crate::pcvalue::PcRange;
use crate::stackmap::StackMap;
use crate::target::Target;

/// Verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// A table failed to decode
    #[error("{func}: malformed {table} table: {source}")]
    Malformed {
        /// Function name
        func: String,
        /// Channel or slot name
        table: &'static str,
        /// Decode failure
        source: DecodeError,
    },

    /// Code length not a multiple of the pc quantum
    #[error("{func}: length {len:#x} is not a multiple of the pc quantum {quantum}")]
    MisalignedLength {
        /// Function name
        func: String,
        /// Code length
        len: u32,
        /// Target pc quantum
        quantum: u32,
    },

    /// pc table does not describe exactly `[0, len)`
    #[error("{func}: {channel} table covers {covered:#x} bytes of {len:#x}")]
    Coverage {
        /// Function name
        func: String,
        /// Channel name
        channel: &'static str,
        /// Bytes covered by the table
        covered: u32,
        /// Code length
        len: u32,
    },

    /// Unsafe-point channel carries an unknown value
    #[error("{func}: unknown unsafe-point value {value} at pc {pc:#x}")]
    UnknownUnsafePoint {
        /// Function name
        func: String,
        /// Channel value
        value: i32,
        /// Start of the range
        pc: u32,
    },

    /// Stack-map index outside a present pointer map
    #[error("{func}: stack map index {index} at pc {pc:#x} out of range for {table} ({count} bitmaps)")]
    StackMapIndexOutOfRange {
        /// Function name
        func: String,
        /// Channel value
        index: i32,
        /// Start of the range
        pc: u32,
        /// Slot name
        table: &'static str,
        /// Number of bitmaps in the map
        count: usize,
    },

    /// Pointer map wider than the region it describes
    #[error("{func}: {table} describes {bits} words but the region holds {words}")]
    MapTooLarge {
        /// Function name
        func: String,
        /// Slot name
        table: &'static str,
        /// Bits per bitmap
        bits: u32,
        /// Words in the region
        words: u32,
    },

    /// Inline index without a node
    #[error("{func}: inline index {index} at pc {pc:#x} out of range ({count} nodes)")]
    InlineIndexOutOfRange {
        /// Function name
        func: String,
        /// Channel value
        index: i32,
        /// Start of the range
        pc: u32,
        /// Nodes in the tree
        count: usize,
    },

    /// Inline parent chain does not reach the physical function
    #[error("{func}: inline node {node} has a cyclic or out-of-range parent chain")]
    InlineParent {
        /// Function name
        func: String,
        /// Node where the walk started
        node: usize,
    },

    /// Stack object outside the frame
    #[error("{func}: stack object at offset {offset} of size {size} lies outside the frame")]
    StackObjectOutOfFrame {
        /// Function name
        func: String,
        /// Frame offset
        offset: i32,
        /// Object size
        size: u32,
    },

    /// Defer state outside the locals region
    #[error("{func}: open-coded defer offset {offset} outside a frame of {frame_size} bytes")]
    DeferOutOfFrame {
        /// Function name
        func: String,
        /// Distance below `varp`
        offset: u32,
        /// Locals frame size
        frame_size: u32,
    },
}

/// Verify every function of an image
pub fn verify_image(image: &MetadataImage) -> Result<(), VerifyError> {
    for func in image.functions() {
        verify_function(func, &image.target)?;
    }
    Ok(())
}

/// Verify one function record
pub fn verify_function(func: &FuncRecord, target: &Target) -> Result<(), VerifyError> {
    let quantum = target.quantum();
    if func.len % quantum != 0 {
        return Err(VerifyError::MisalignedLength {
            func: func.name.clone(),
            len: func.len,
            quantum,
        });
    }

    let malformed = |table: &'static str| {
        move |source: DecodeError| VerifyError::Malformed {
            func: func.name.clone(),
            table,
            source,
        }
    };

    let args_map = func.args_pointer_maps().map_err(malformed("args_pointer_maps"))?;
    let locals_map = func
        .locals_pointer_maps()
        .map_err(malformed("locals_pointer_maps"))?;
    let inline_tree = func.inline_tree().map_err(malformed("inl_tree"))?;
    let stack_objects = func.stack_objects(target).map_err(malformed("stack_objects"))?;
    let defer_info = func
        .open_coded_defer_info()
        .map_err(malformed("open_coded_defer_info"))?;
    func.arg_info().map_err(malformed("arg_info"))?;

    let ptr_size = target.ptr_bytes();
    if let Some(map) = &args_map {
        match func.args_size {
            ArgsSize::Known(size) => check_fits(func, "args_pointer_maps", map, size, ptr_size)?,
            ArgsSize::Unknown => log::warn!(
                "{}: args pointer maps on a function of unknown args size",
                func.name
            ),
        }
    }
    if let Some(map) = &locals_map {
        check_fits(func, "locals_pointer_maps", map, func.frame_size, ptr_size)?;
    }

    for channel in PcdataChannel::ALL {
        let Some(table) = func.pcdata_table(channel) else {
            continue;
        };
        let ranges = table
            .ranges(quantum)
            .collect::<Result<Vec<PcRange>, _>>()
            .map_err(malformed(channel.name()))?;
        let covered = ranges.last().map_or(0, |r| r.end);
        if covered != func.len {
            return Err(VerifyError::Coverage {
                func: func.name.clone(),
                channel: channel.name(),
                covered,
                len: func.len,
            });
        }

        for range in &ranges {
            match channel {
                PcdataChannel::UnsafePoint => {
                    if UnsafePoint::from_value(range.value).is_none() {
                        return Err(VerifyError::UnknownUnsafePoint {
                            func: func.name.clone(),
                            value: range.value,
                            pc: range.start,
                        });
                    }
                }
                PcdataChannel::StackMapIndex => {
                    for (name, map) in [("args_pointer_maps", &args_map), ("locals_pointer_maps", &locals_map)] {
                        let Some(map) = map else { continue };
                        let in_range = range.value == PCDATA_NONE
                            || usize::try_from(range.value).map_or(false, |i| i < map.len());
                        if !in_range {
                            return Err(VerifyError::StackMapIndexOutOfRange {
                                func: func.name.clone(),
                                index: range.value,
                                pc: range.start,
                                table: name,
                                count: map.len(),
                            });
                        }
                    }
                }
                PcdataChannel::InlTreeIndex => {
                    let count = inline_tree.as_ref().map_or(0, |t| t.len());
                    let in_range = range.value == PCDATA_NONE
                        || usize::try_from(range.value).map_or(false, |i| i < count);
                    if !in_range {
                        return Err(VerifyError::InlineIndexOutOfRange {
                            func: func.name.clone(),
                            index: range.value,
                            pc: range.start,
                            count,
                        });
                    }
                }
            }
        }
    }

    if let Some(tree) = &inline_tree {
        for node in 0..tree.len() {
            let mut index = node as i32;
            let mut steps = 0;
            while let Some(call) = tree.get(index) {
                steps += 1;
                if steps > tree.len() || call.parent_pc >= func.len {
                    return Err(VerifyError::InlineParent {
                        func: func.name.clone(),
                        node,
                    });
                }
                index = func
                    .pcdata_value(
                        PcdataChannel::InlTreeIndex,
                        func.entry + call.parent_pc as u64,
                        target,
                    )
                    .map_err(malformed("inl_tree_index"))?;
            }
        }
    }

    if let Some(objects) = &stack_objects {
        for record in &objects.records {
            let end = record.offset as i64 + record.size as i64;
            let fits = if record.in_locals() {
                -(record.offset as i64) <= func.frame_size as i64 && end <= 0
            } else {
                match func.args_size {
                    ArgsSize::Known(size) => end <= size as i64,
                    ArgsSize::Unknown => true,
                }
            };
            if !fits {
                return Err(VerifyError::StackObjectOutOfFrame {
                    func: func.name.clone(),
                    offset: record.offset,
                    size: record.size,
                });
            }
        }
    }

    if let Some(info) = defer_info {
        for offset in [info.defer_bits_offset, info.slots_offset] {
            if offset == 0 || offset > func.frame_size {
                return Err(VerifyError::DeferOutOfFrame {
                    func: func.name.clone(),
                    offset,
                    frame_size: func.frame_size,
                });
            }
        }
    }

    log::trace!("{}: verified", func.name);
    Ok(())
}

fn check_fits(
    func: &FuncRecord,
    table: &'static str,
    map: &StackMap,
    region: u32,
    ptr_size: u32,
) -> Result<(), VerifyError> {
    let words = (region + ptr_size - 1) / ptr_size;
    if map.n_bits() > words {
        return Err(VerifyError::MapTooLarge {
            func: func.name.clone(),
            table,
            bits: map.n_bits(),
            words,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::FuncdataSlot;
    use crate::defer_info::OpenCodedDeferInfo;
    use crate::inline::InlineTree;
    use crate::pcvalue::{PcTable, PcValueEncoder};
    use crate::stack_objects::StackObjects;
    use crate::stackmap::BitVector;

    const TARGET: Target = Target::AMD64;

    fn table(len: u32, decls: &[(u32, i32)]) -> PcTable {
        let mut enc = PcValueEncoder::new(1);
        for &(pc, value) in decls {
            enc.declare(pc, value).unwrap();
        }
        enc.finish(len).unwrap()
    }

    fn base() -> FuncRecord {
        let mut func = FuncRecord::new("f", 0x1000, 32);
        func.args_size = ArgsSize::Known(16);
        func.frame_size = 24;
        func
    }

    fn locals_map(bits: u32, maps: usize) -> Vec<u8> {
        let mut map = StackMap::new(bits);
        for _ in 0..maps {
            map.push(BitVector::new(bits));
        }
        map.encode()
    }

    #[test]
    fn test_empty_function_verifies() {
        verify_function(&FuncRecord::new("empty", 0, 0), &TARGET).unwrap();
    }

    #[test]
    fn test_valid_function() {
        let mut func = base();
        func.funcdata[FuncdataSlot::LocalsPointerMaps.index()] = Some(locals_map(3, 2));
        func.pcdata[PcdataChannel::StackMapIndex.index()] = Some(table(32, &[(4, 0), (16, 1)]));
        func.pcdata[PcdataChannel::UnsafePoint.index()] = Some(table(32, &[(8, -2), (12, -1)]));
        verify_function(&func, &TARGET).unwrap();
    }

    #[test]
    fn test_coverage_mismatch() {
        let mut func = base();
        func.pcdata[PcdataChannel::StackMapIndex.index()] = Some(table(16, &[(4, 0)]));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::Coverage { covered: 16, len: 32, .. })
        ));
    }

    #[test]
    fn test_unknown_unsafe_point() {
        let mut func = base();
        func.pcdata[PcdataChannel::UnsafePoint.index()] = Some(table(32, &[(0, -9)]));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::UnknownUnsafePoint { value: -9, .. })
        ));
    }

    #[test]
    fn test_stack_map_index_out_of_range() {
        let mut func = base();
        func.funcdata[FuncdataSlot::LocalsPointerMaps.index()] = Some(locals_map(3, 1));
        func.pcdata[PcdataChannel::StackMapIndex.index()] = Some(table(32, &[(4, 1)]));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::StackMapIndexOutOfRange { index: 1, count: 1, .. })
        ));
    }

    #[test]
    fn test_locals_map_too_large() {
        let mut func = base();
        func.funcdata[FuncdataSlot::LocalsPointerMaps.index()] = Some(locals_map(4, 1));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::MapTooLarge { bits: 4, words: 3, .. })
        ));
    }

    #[test]
    fn test_args_map_with_unknown_size_is_legal() {
        let mut func = base();
        func.args_size = ArgsSize::Unknown;
        func.funcdata[FuncdataSlot::ArgsPointerMaps.index()] = Some(locals_map(64, 1));
        verify_function(&func, &TARGET).unwrap();
    }

    #[test]
    fn test_malformed_table() {
        let mut func = base();
        func.funcdata[FuncdataSlot::InlTree.index()] = Some(vec![2, 5, b'a']);
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::Malformed { table: "inl_tree", .. })
        ));
    }

    #[test]
    fn test_inline_index_out_of_range() {
        let mut tree = InlineTree::new();
        tree.push("g", 4, 10);
        let mut func = base();
        func.funcdata[FuncdataSlot::InlTree.index()] = Some(tree.encode());
        func.pcdata[PcdataChannel::InlTreeIndex.index()] = Some(table(32, &[(8, 0), (16, 1)]));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::InlineIndexOutOfRange { index: 1, .. })
        ));
    }

    #[test]
    fn test_inline_parent_cycle() {
        let mut tree = InlineTree::new();
        // node 0's call site is itself inside node 0
        tree.push("g", 8, 10);
        let mut func = base();
        func.funcdata[FuncdataSlot::InlTree.index()] = Some(tree.encode());
        func.pcdata[PcdataChannel::InlTreeIndex.index()] = Some(table(32, &[(8, 0)]));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::InlineParent { node: 0, .. })
        ));
    }

    #[test]
    fn test_nested_inline_tree() {
        let mut tree = InlineTree::new();
        tree.push("outer", 2, 10);
        tree.push("inner", 6, 20);
        let mut func = base();
        func.funcdata[FuncdataSlot::InlTree.index()] = Some(tree.encode());
        func.pcdata[PcdataChannel::InlTreeIndex.index()] =
            Some(table(32, &[(4, 0), (8, 1), (12, -1)]));
        verify_function(&func, &TARGET).unwrap();
    }

    #[test]
    fn test_stack_object_out_of_frame() {
        let mut objects = StackObjects::new();
        objects.push(-32, 16, 8, &[0]);
        let mut func = base();
        func.funcdata[FuncdataSlot::StackObjects.index()] = Some(objects.encode(8));
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::StackObjectOutOfFrame { offset: -32, .. })
        ));

        let mut objects = StackObjects::new();
        objects.push(-16, 16, 8, &[0]);
        objects.push(0, 16, 8, &[1]);
        func.funcdata[FuncdataSlot::StackObjects.index()] = Some(objects.encode(8));
        verify_function(&func, &TARGET).unwrap();
    }

    #[test]
    fn test_defer_out_of_frame() {
        let mut func = base();
        let info = OpenCodedDeferInfo {
            defer_bits_offset: 1,
            slots_offset: 40,
        };
        func.funcdata[FuncdataSlot::OpenCodedDeferInfo.index()] = Some(info.encode());
        assert!(matches!(
            verify_function(&func, &TARGET),
            Err(VerifyError::DeferOutOfFrame { offset: 40, .. })
        ));
    }

    #[test]
    fn test_misaligned_length() {
        let func = FuncRecord::new("f", 0, 6);
        assert!(matches!(
            verify_function(&func, &Target::ARM64),
            Err(VerifyError::MisalignedLength { len: 6, quantum: 4, .. })
        ));
    }
}
