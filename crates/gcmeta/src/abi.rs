//! PCDATA channel and FUNCDATA slot numbering
//!
//! These integers are shared by every producer (assembler, compiler, linker)
//! and every consumer (collector, stack growth, profiler) of the metadata.
//! Changing any of them requires bumping [`PROTOCOL_VERSION`]; images built
//! against another version are rejected at load time.
//!
//! Numbering:
//! - PCDATA: 0 unsafe point, 1 stack map index, 2 inline tree index
//! - FUNCDATA: 0 args maps, 1 locals maps, 2 stack objects, 3 inline tree,
//!   4 open-coded defer info, 5 arg info

/// Version of the numbering and table formats
pub const PROTOCOL_VERSION: u32 = 1;

/// PCDATA channel: unsafe-point classification
pub const PCDATA_UNSAFE_POINT: u32 = 0;
/// PCDATA channel: index of the stack map bitmap in effect
pub const PCDATA_STACK_MAP_INDEX: u32 = 1;
/// PCDATA channel: index of the inline tree node in effect
pub const PCDATA_INL_TREE_INDEX: u32 = 2;

/// Number of defined PCDATA channels
pub const N_PCDATA: usize = 3;

/// FUNCDATA slot: argument pointer maps
pub const FUNCDATA_ARGS_POINTER_MAPS: u32 = 0;
/// FUNCDATA slot: locals pointer maps
pub const FUNCDATA_LOCALS_POINTER_MAPS: u32 = 1;
/// FUNCDATA slot: stack object descriptors
pub const FUNCDATA_STACK_OBJECTS: u32 = 2;
/// FUNCDATA slot: inline call tree
pub const FUNCDATA_INL_TREE: u32 = 3;
/// FUNCDATA slot: open-coded defer state
pub const FUNCDATA_OPEN_CODED_DEFER_INFO: u32 = 4;
/// FUNCDATA slot: argument shape descriptor
pub const FUNCDATA_ARG_INFO: u32 = 5;

/// Number of defined FUNCDATA slots
pub const N_FUNCDATA: usize = 6;

/// Args size marking functions whose argument frame size is not known
/// (variadic native calls, low-level routines without a prototype).
pub const ARGS_SIZE_UNKNOWN: u32 = 0x8000_0000;

/// Value of any PCDATA channel before its first declaration
pub const PCDATA_NONE: i32 = -1;

/// Bitmap index selected at function entry
pub const STACK_MAP_ENTRY_INDEX: i32 = -1;

/// Bitmap index selected by `go_results_initialized`
pub const STACK_MAP_RESULTS_INITIALIZED: i32 = 1;

/// PCDATA channel identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PcdataChannel {
    /// Unsafe-point classification
    UnsafePoint = PCDATA_UNSAFE_POINT as u8,
    /// Active stack map index
    StackMapIndex = PCDATA_STACK_MAP_INDEX as u8,
    /// Active inline tree node index
    InlTreeIndex = PCDATA_INL_TREE_INDEX as u8,
}

impl PcdataChannel {
    /// All channels in index order
    pub const ALL: [PcdataChannel; N_PCDATA] = [
        PcdataChannel::UnsafePoint,
        PcdataChannel::StackMapIndex,
        PcdataChannel::InlTreeIndex,
    ];

    /// Look up a channel by index. Unknown indices yield `None`.
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            PCDATA_UNSAFE_POINT => Some(Self::UnsafePoint),
            PCDATA_STACK_MAP_INDEX => Some(Self::StackMapIndex),
            PCDATA_INL_TREE_INDEX => Some(Self::InlTreeIndex),
            _ => None,
        }
    }

    /// Wire index of this channel
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in dumps and routine descriptions
    pub fn name(self) -> &'static str {
        match self {
            Self::UnsafePoint => "unsafe_point",
            Self::StackMapIndex => "stack_map_index",
            Self::InlTreeIndex => "inl_tree_index",
        }
    }

    /// Parse a channel from its [`name`](Self::name)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// FUNCDATA slot identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FuncdataSlot {
    /// Argument pointer maps
    ArgsPointerMaps = FUNCDATA_ARGS_POINTER_MAPS as u8,
    /// Locals pointer maps
    LocalsPointerMaps = FUNCDATA_LOCALS_POINTER_MAPS as u8,
    /// Stack object descriptors
    StackObjects = FUNCDATA_STACK_OBJECTS as u8,
    /// Inline call tree
    InlTree = FUNCDATA_INL_TREE as u8,
    /// Open-coded defer info
    OpenCodedDeferInfo = FUNCDATA_OPEN_CODED_DEFER_INFO as u8,
    /// Argument shape descriptor
    ArgInfo = FUNCDATA_ARG_INFO as u8,
}

impl FuncdataSlot {
    /// All slots in index order
    pub const ALL: [FuncdataSlot; N_FUNCDATA] = [
        FuncdataSlot::ArgsPointerMaps,
        FuncdataSlot::LocalsPointerMaps,
        FuncdataSlot::StackObjects,
        FuncdataSlot::InlTree,
        FuncdataSlot::OpenCodedDeferInfo,
        FuncdataSlot::ArgInfo,
    ];

    /// Look up a slot by index. Unknown indices yield `None`.
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            FUNCDATA_ARGS_POINTER_MAPS => Some(Self::ArgsPointerMaps),
            FUNCDATA_LOCALS_POINTER_MAPS => Some(Self::LocalsPointerMaps),
            FUNCDATA_STACK_OBJECTS => Some(Self::StackObjects),
            FUNCDATA_INL_TREE => Some(Self::InlTree),
            FUNCDATA_OPEN_CODED_DEFER_INFO => Some(Self::OpenCodedDeferInfo),
            FUNCDATA_ARG_INFO => Some(Self::ArgInfo),
            _ => None,
        }
    }

    /// Wire index of this slot
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in dumps and routine descriptions
    pub fn name(self) -> &'static str {
        match self {
            Self::ArgsPointerMaps => "args_pointer_maps",
            Self::LocalsPointerMaps => "locals_pointer_maps",
            Self::StackObjects => "stack_objects",
            Self::InlTree => "inl_tree",
            Self::OpenCodedDeferInfo => "open_coded_defer_info",
            Self::ArgInfo => "arg_info",
        }
    }

    /// Parse a slot from its [`name`](Self::name)
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

/// Values of the unsafe-point channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsafePoint {
    /// Suspension permitted
    Safe,
    /// Suspension not permitted
    Unsafe,
    /// Unsafe, but restartable from the start of the first marked sequence
    Restart1,
    /// Unsafe, but restartable from the start of the second marked sequence
    Restart2,
    /// Unsafe, but restartable from the function entry
    RestartAtEntry,
}

impl UnsafePoint {
    /// Decode a channel value. Unknown values yield `None`.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            -1 => Some(Self::Safe),
            -2 => Some(Self::Unsafe),
            -3 => Some(Self::Restart1),
            -4 => Some(Self::Restart2),
            -5 => Some(Self::RestartAtEntry),
            _ => None,
        }
    }

    /// Channel value for this classification
    pub fn value(self) -> i32 {
        match self {
            Self::Safe => -1,
            Self::Unsafe => -2,
            Self::Restart1 => -3,
            Self::Restart2 => -4,
            Self::RestartAtEntry => -5,
        }
    }

    /// Whether a frame may be suspended here
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Safe)
    }
}

const fn all_distinct(values: &[u32]) -> bool {
    let mut i = 0;
    while i < values.len() {
        let mut j = i + 1;
        while j < values.len() {
            if values[i] == values[j] {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const fn all_below(values: &[u32], bound: usize) -> bool {
    let mut i = 0;
    while i < values.len() {
        if values[i] as usize >= bound {
            return false;
        }
        i += 1;
    }
    true
}

const PCDATA_VALUES: [u32; N_PCDATA] = [
    PCDATA_UNSAFE_POINT,
    PCDATA_STACK_MAP_INDEX,
    PCDATA_INL_TREE_INDEX,
];

const FUNCDATA_VALUES: [u32; N_FUNCDATA] = [
    FUNCDATA_ARGS_POINTER_MAPS,
    FUNCDATA_LOCALS_POINTER_MAPS,
    FUNCDATA_STACK_OBJECTS,
    FUNCDATA_INL_TREE,
    FUNCDATA_OPEN_CODED_DEFER_INFO,
    FUNCDATA_ARG_INFO,
];

const _: () = assert!(all_distinct(&PCDATA_VALUES) && all_below(&PCDATA_VALUES, N_PCDATA));
const _: () = assert!(all_distinct(&FUNCDATA_VALUES) && all_below(&FUNCDATA_VALUES, N_FUNCDATA));

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_pcdata_values() {
        assert_eq!(PcdataChannel::UnsafePoint as u8, 0);
        assert_eq!(PcdataChannel::StackMapIndex as u8, 1);
        assert_eq!(PcdataChannel::InlTreeIndex as u8, 2);
    }

    #[test]
    fn test_funcdata_values() {
        assert_eq!(FuncdataSlot::ArgsPointerMaps as u8, 0);
        assert_eq!(FuncdataSlot::LocalsPointerMaps as u8, 1);
        assert_eq!(FuncdataSlot::StackObjects as u8, 2);
        assert_eq!(FuncdataSlot::InlTree as u8, 3);
        assert_eq!(FuncdataSlot::OpenCodedDeferInfo as u8, 4);
        assert_eq!(FuncdataSlot::ArgInfo as u8, 5);
    }

    #[test]
    fn test_groups_are_dense_and_distinct() {
        let pcdata: HashSet<usize> = PcdataChannel::ALL.iter().map(|c| c.index()).collect();
        assert_eq!(pcdata, (0..N_PCDATA).collect());

        let funcdata: HashSet<usize> = FuncdataSlot::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(funcdata, (0..N_FUNCDATA).collect());
    }

    #[test]
    fn test_from_index_round_trip() {
        for channel in PcdataChannel::ALL {
            assert_eq!(PcdataChannel::from_index(channel.index() as u32), Some(channel));
        }
        for slot in FuncdataSlot::ALL {
            assert_eq!(FuncdataSlot::from_index(slot.index() as u32), Some(slot));
        }
    }

    #[test]
    fn test_unknown_indices_are_no_information() {
        assert_eq!(PcdataChannel::from_index(3), None);
        assert_eq!(PcdataChannel::from_index(u32::MAX), None);
        assert_eq!(FuncdataSlot::from_index(6), None);
        assert_eq!(FuncdataSlot::from_index(200), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(
            PcdataChannel::from_name("stack_map_index"),
            Some(PcdataChannel::StackMapIndex)
        );
        assert_eq!(FuncdataSlot::from_name("arg_info"), Some(FuncdataSlot::ArgInfo));
        assert_eq!(FuncdataSlot::from_name("bogus"), None);
    }

    #[test]
    fn test_unsafe_point_values() {
        for value in -5..=-1 {
            let point = UnsafePoint::from_value(value).unwrap();
            assert_eq!(point.value(), value);
        }
        assert!(UnsafePoint::Safe.is_safe());
        assert!(!UnsafePoint::RestartAtEntry.is_safe());
        assert_eq!(UnsafePoint::from_value(0), None);
        assert_eq!(UnsafePoint::from_value(-6), None);
    }

    #[test]
    fn test_sentinel() {
        assert_eq!(ARGS_SIZE_UNKNOWN, 0x8000_0000);
    }
}
