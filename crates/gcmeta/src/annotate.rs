//! Frame annotations
//!
//! A producer walks a routine in program order and records point-in-time
//! annotations. Each PCDATA declaration holds from its pc until the function
//! ends or a later declaration on the same channel supersedes it; FUNCDATA
//! declarations hold for the whole function. `RoutineBuilder` keeps one
//! state machine per channel and turns the result into a `FuncRecord`.

use crate::abi::{
    FuncdataSlot, PcdataChannel, N_FUNCDATA, N_PCDATA, PCDATA_NONE, STACK_MAP_RESULTS_INITIALIZED,
};
use crate::func::{ArgsSize, FuncRecord};
use crate::pcvalue::{PcValueEncoder, PcValueError};
use crate::prototype::Prototype;
use crate::stackmap::StackMap;
use crate::target::Target;
use thiserror::Error;

/// Prefix of package-local routine names whose prototype is declared
/// alongside the routine
pub const LOCAL_NAME_PREFIX: char = '\u{00B7}';

/// Annotation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotateError {
    /// Annotation earlier than one already made
    #[error("{name}: annotation at pc {pc:#x} precedes earlier annotation at {last:#x}")]
    OutOfOrder {
        /// Routine name
        name: String,
        /// Offending pc offset
        pc: u32,
        /// Most recent annotated pc offset
        last: u32,
    },

    /// Annotation outside the routine's code
    #[error("{name}: annotation at pc {pc:#x} is outside a routine of length {len:#x}")]
    PastEnd {
        /// Routine name
        name: String,
        /// Offending pc offset
        pc: u32,
        /// Routine length
        len: u32,
    },

    /// `go_args` somewhere other than the very start
    #[error("{name}: go_args must be the first annotation, at pc 0 (found at {pc:#x})")]
    GoArgsNotFirst {
        /// Routine name
        name: String,
        /// Offending pc offset
        pc: u32,
    },

    /// `go_args` on a routine without a prototype
    #[error("{name}: go_args requires a prototype")]
    MissingPrototype {
        /// Routine name
        name: String,
    },

    /// Two different tables declared for one FUNCDATA slot
    #[error("{name}: conflicting tables for FUNCDATA slot {}", .slot.name())]
    ConflictingFuncdata {
        /// Routine name
        name: String,
        /// Slot declared twice
        slot: FuncdataSlot,
    },

    /// pc table construction failed
    #[error(transparent)]
    PcValue(#[from] PcValueError),
}

/// Static facts about a routine, known before any annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineDecl {
    /// Symbol name
    pub name: String,
    /// Entry address
    pub entry: u64,
    /// Code length in bytes
    pub len: u32,
    /// Argument frame size
    pub args_size: ArgsSize,
    /// Locals frame size in bytes
    pub frame_size: u32,
}

impl RoutineDecl {
    /// Declare a routine with no arguments and no locals
    pub fn new(name: impl Into<String>, entry: u64, len: u32) -> Self {
        Self {
            name: name.into(),
            entry,
            len,
            args_size: ArgsSize::Known(0),
            frame_size: 0,
        }
    }
}

/// One annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    /// Args pointer maps come from the routine's prototype
    GoArgs,
    /// Results are initialized from here on
    GoResultsInitialized,
    /// Locals hold no heap pointers
    NoLocalPointers,
    /// Generic PCDATA declaration
    Pcdata {
        /// Channel being set
        channel: PcdataChannel,
        /// New value
        value: i32,
    },
    /// Generic FUNCDATA declaration
    Funcdata {
        /// Slot being set
        slot: FuncdataSlot,
        /// Encoded table
        table: Vec<u8>,
    },
}

impl Annotation {
    fn is_pcdata(&self) -> bool {
        matches!(
            self,
            Annotation::GoResultsInitialized | Annotation::Pcdata { .. }
        )
    }
}

/// Collects the annotations of one routine
#[derive(Debug, Clone)]
pub struct RoutineBuilder {
    decl: RoutineDecl,
    target: Target,
    prototype: Option<Prototype>,
    encoders: [Option<PcValueEncoder>; N_PCDATA],
    funcdata: [Option<Vec<u8>>; N_FUNCDATA],
    last_pc: Option<u32>,
}

impl RoutineBuilder {
    /// Start annotating a routine
    pub fn new(decl: RoutineDecl, target: Target) -> Self {
        Self {
            decl,
            target,
            prototype: None,
            encoders: Default::default(),
            funcdata: Default::default(),
            last_pc: None,
        }
    }

    /// Attach the routine's prototype
    pub fn with_prototype(mut self, prototype: Prototype) -> Self {
        self.prototype = Some(prototype);
        self
    }

    /// The routine being annotated
    pub fn decl(&self) -> &RoutineDecl {
        &self.decl
    }

    /// Record an annotation at pc offset `pc`
    pub fn annotate(&mut self, pc: u32, annotation: Annotation) -> Result<(), AnnotateError> {
        let len = self.decl.len;
        if pc > len || (pc == len && annotation.is_pcdata()) {
            return Err(AnnotateError::PastEnd {
                name: self.decl.name.clone(),
                pc,
                len,
            });
        }
        if pc % self.target.quantum() != 0 {
            return Err(PcValueError::Misaligned {
                offset: pc,
                quantum: self.target.quantum(),
            }
            .into());
        }
        if let Some(last) = self.last_pc {
            if pc < last {
                return Err(AnnotateError::OutOfOrder {
                    name: self.decl.name.clone(),
                    pc,
                    last,
                });
            }
        }
        if annotation == Annotation::GoArgs && (pc != 0 || self.last_pc.is_some()) {
            return Err(AnnotateError::GoArgsNotFirst {
                name: self.decl.name.clone(),
                pc,
            });
        }

        log::trace!("{}: {:?} at {:#x}", self.decl.name, annotation, pc);
        match annotation {
            Annotation::GoArgs => {
                let ptr_size = self.target.ptr_bytes();
                let Some(proto) = &self.prototype else {
                    return Err(AnnotateError::MissingPrototype {
                        name: self.decl.name.clone(),
                    });
                };
                self.check_prototype_size(proto);
                let args_map = proto.args_stackmap(ptr_size).encode();
                let arg_info = proto.arg_info(ptr_size).encode();
                self.set_funcdata(FuncdataSlot::ArgsPointerMaps, args_map)?;
                self.set_funcdata(FuncdataSlot::ArgInfo, arg_info)?;
            }
            Annotation::GoResultsInitialized => {
                self.set_pcdata(pc, PcdataChannel::StackMapIndex, STACK_MAP_RESULTS_INITIALIZED)?;
            }
            Annotation::NoLocalPointers => {
                self.set_funcdata(FuncdataSlot::LocalsPointerMaps, StackMap::no_pointers().encode())?;
            }
            Annotation::Pcdata { channel, value } => self.set_pcdata(pc, channel, value)?,
            Annotation::Funcdata { slot, table } => self.set_funcdata(slot, table)?,
        }
        self.last_pc = Some(pc);
        Ok(())
    }

    /// `GO_ARGS`: take the args pointer maps from the prototype
    pub fn go_args(&mut self, pc: u32) -> Result<(), AnnotateError> {
        self.annotate(pc, Annotation::GoArgs)
    }

    /// `GO_RESULTS_INITIALIZED`: results are live from `pc` on
    pub fn go_results_initialized(&mut self, pc: u32) -> Result<(), AnnotateError> {
        self.annotate(pc, Annotation::GoResultsInitialized)
    }

    /// `NO_LOCAL_POINTERS`: locals never hold heap pointers
    pub fn no_local_pointers(&mut self, pc: u32) -> Result<(), AnnotateError> {
        self.annotate(pc, Annotation::NoLocalPointers)
    }

    /// `PCDATA channel, value`
    pub fn pcdata(&mut self, pc: u32, channel: PcdataChannel, value: i32) -> Result<(), AnnotateError> {
        self.annotate(pc, Annotation::Pcdata { channel, value })
    }

    /// `FUNCDATA slot, table`
    pub fn funcdata(&mut self, pc: u32, slot: FuncdataSlot, table: Vec<u8>) -> Result<(), AnnotateError> {
        self.annotate(pc, Annotation::Funcdata { slot, table })
    }

    /// Value currently in effect on a channel
    pub fn current(&self, channel: PcdataChannel) -> i32 {
        self.encoders[channel.index()]
            .as_ref()
            .map_or(PCDATA_NONE, PcValueEncoder::current)
    }

    /// Produce the function record
    pub fn finish(mut self) -> Result<FuncRecord, AnnotateError> {
        if self.funcdata[FuncdataSlot::ArgsPointerMaps.index()].is_none() {
            self.synthesize_args_map()?;
        }

        let mut func = FuncRecord::new(self.decl.name, self.decl.entry, self.decl.len);
        func.args_size = self.decl.args_size;
        func.frame_size = self.decl.frame_size;
        for channel in PcdataChannel::ALL {
            let Some(encoder) = self.encoders[channel.index()].take() else {
                continue;
            };
            if encoder.is_trivial() {
                continue;
            }
            func.pcdata[channel.index()] = Some(encoder.finish(self.decl.len)?);
        }
        func.funcdata = self.funcdata;
        log::debug!(
            "{}: {} pcdata tables, {} funcdata tables",
            func.name,
            func.pcdata.iter().flatten().count(),
            func.funcdata.iter().flatten().count()
        );
        Ok(func)
    }

    /// Package-local routines with a prototype get their args map implicitly
    fn synthesize_args_map(&mut self) -> Result<(), AnnotateError> {
        if !self.decl.name.starts_with(LOCAL_NAME_PREFIX) {
            return Ok(());
        }
        let Some(proto) = &self.prototype else {
            return Ok(());
        };
        if self.decl.args_size.known().is_none() {
            return Ok(());
        }
        let ptr_size = self.target.ptr_bytes();
        self.check_prototype_size(proto);
        let args_map = proto.args_stackmap(ptr_size).encode();
        let arg_info = proto.arg_info(ptr_size).encode();
        log::debug!("{}: synthesized args map from prototype", self.decl.name);
        self.set_funcdata(FuncdataSlot::ArgsPointerMaps, args_map)?;
        if self.funcdata[FuncdataSlot::ArgInfo.index()].is_none() {
            self.set_funcdata(FuncdataSlot::ArgInfo, arg_info)?;
        }
        Ok(())
    }

    fn check_prototype_size(&self, proto: &Prototype) {
        let derived = proto.args_size(self.target.ptr_bytes());
        match self.decl.args_size {
            ArgsSize::Known(size) if size != derived => log::warn!(
                "{}: declared args size {} but prototype needs {}",
                self.decl.name,
                size,
                derived
            ),
            ArgsSize::Unknown => log::warn!(
                "{}: args pointer maps on a routine of unknown args size",
                self.decl.name
            ),
            _ => {}
        }
    }

    fn set_pcdata(&mut self, pc: u32, channel: PcdataChannel, value: i32) -> Result<(), AnnotateError> {
        let quantum = self.target.quantum();
        self.encoders[channel.index()]
            .get_or_insert_with(|| PcValueEncoder::new(quantum))
            .declare(pc, value)?;
        Ok(())
    }

    fn set_funcdata(&mut self, slot: FuncdataSlot, table: Vec<u8>) -> Result<(), AnnotateError> {
        match &self.funcdata[slot.index()] {
            Some(existing) if *existing == table => Ok(()),
            Some(_) => Err(AnnotateError::ConflictingFuncdata {
                name: self.decl.name.clone(),
                slot,
            }),
            None => {
                self.funcdata[slot.index()] = Some(table);
                Ok(())
            }
        }
    }
}
