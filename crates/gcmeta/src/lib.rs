//! Stack-frame liveness metadata for precise garbage collection
//!
//! This crate implements the side-table protocol that lets a collector scan
//! frames of hand-written low-level routines:
//! - Channel registry (PCDATA channels and FUNCDATA slots)
//! - Per-pc value tables and the per-function side tables they index
//! - A producer-side annotation builder (`go_args`, `no_local_pointers`, ...)
//! - A metadata image container with verification
//! - A consumer-side frame scanner

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod annotate;
pub mod arg_info;
pub mod defer_info;
pub mod encoder;
pub mod func;
pub mod image;
pub mod inline;
pub mod pcvalue;
pub mod prototype;
pub mod scan;
pub mod stack_objects;
pub mod stackmap;
pub mod target;
pub mod verify;

pub use abi::{
    FuncdataSlot, PcdataChannel, UnsafePoint, ARGS_SIZE_UNKNOWN, N_FUNCDATA, N_PCDATA,
    PROTOCOL_VERSION,
};
pub use annotate::{Annotation, AnnotateError, RoutineBuilder, RoutineDecl};
pub use arg_info::{ArgInfo, ArgShape};
pub use defer_info::{DeferLocation, OpenCodedDeferInfo};
pub use encoder::{DecodeError, TableReader, TableWriter};
pub use func::{ArgsSize, FuncRecord};
pub use image::{ImageError, MetadataImage};
pub use inline::{InlineTree, InlinedCall};
pub use pcvalue::{PcRange, PcTable, PcValueEncoder, PcValueError};
pub use prototype::{ParamKind, Prototype};
pub use scan::{
    FrameContext, FrameScan, FrameScanner, LiveSlot, LogicalFrame, MissingMapPolicy, RegionScan,
    ScanError, ScanOptions, StackObjectRoot,
};
pub use stack_objects::{StackObjectRecord, StackObjects};
pub use stackmap::{BitVector, StackMap};
pub use target::Target;
pub use verify::{verify_function, verify_image, VerifyError};
