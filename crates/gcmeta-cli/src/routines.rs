//! TOML description of low-level routines and their annotations
//!
//! ```toml
//! target = "amd64"
//!
//! [[routine]]
//! name = "runtime·memclr"
//! entry = 0x401000
//! len = 32
//! frame_size = 16
//! params = ["ptr", "uintptr"]
//! annotations = [
//!     { kind = "go_args", pc = 0 },
//!     { kind = "no_local_pointers", pc = 0 },
//!     { kind = "pcdata", pc = 8, channel = "unsafe_point", value = -2 },
//! ]
//! ```

use anyhow::{anyhow, bail, Context, Result};
use gcmeta::{
    verify_image, Annotation, ArgsSize, BitVector, FuncdataSlot, InlineTree, MetadataImage,
    OpenCodedDeferInfo, ParamKind, PcdataChannel, Prototype, RoutineBuilder, RoutineDecl,
    StackMap, StackObjects, Target,
};
use serde::Deserialize;
use std::path::Path;

/// A file of routine descriptions
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutineFile {
    /// Target preset name or explicit parameters; defaults to amd64
    #[serde(default)]
    pub target: Option<TargetSpec>,
    /// Routines in any order
    #[serde(default, rename = "routine")]
    pub routines: Vec<RoutineSpec>,
}

/// Target by preset name or by explicit parameters
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    Preset(String),
    Explicit(Target),
}

/// Args size as a byte count or `"unknown"`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ArgsSizeSpec {
    Bytes(u32),
    Named(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutineSpec {
    pub name: String,
    pub entry: u64,
    pub len: u32,
    #[serde(default)]
    pub args_size: Option<ArgsSizeSpec>,
    #[serde(default)]
    pub frame_size: u32,
    /// Parameter kinds; present (even empty) means the routine has a prototype
    #[serde(default)]
    pub params: Option<Vec<String>>,
    #[serde(default)]
    pub results: Vec<String>,
    #[serde(default)]
    pub stack_objects: Vec<StackObjectSpec>,
    #[serde(default)]
    pub inline: Vec<InlineSpec>,
    #[serde(default)]
    pub defer: Option<DeferSpec>,
    #[serde(default)]
    pub annotations: Vec<AnnotationSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackObjectSpec {
    pub offset: i32,
    pub size: u32,
    #[serde(default)]
    pub ptr_words: Vec<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineSpec {
    pub name: String,
    pub parent_pc: u32,
    #[serde(default)]
    pub start_line: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeferSpec {
    pub bits_offset: u32,
    pub slots_offset: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationSpec {
    GoArgs {
        pc: u32,
    },
    GoResultsInitialized {
        pc: u32,
    },
    NoLocalPointers {
        pc: u32,
    },
    Pcdata {
        pc: u32,
        channel: String,
        value: i32,
    },
    /// Explicit pointer maps; `maps` lists the set bits of each bitmap
    LocalsMaps {
        pc: u32,
        bits: u32,
        maps: Vec<Vec<u32>>,
    },
    ArgsMaps {
        pc: u32,
        bits: u32,
        maps: Vec<Vec<u32>>,
    },
    /// Raw table bytes for any slot
    Funcdata {
        pc: u32,
        slot: String,
        bytes: Vec<u8>,
    },
}

impl AnnotationSpec {
    fn pc(&self) -> u32 {
        match self {
            AnnotationSpec::GoArgs { pc }
            | AnnotationSpec::GoResultsInitialized { pc }
            | AnnotationSpec::NoLocalPointers { pc }
            | AnnotationSpec::Pcdata { pc, .. }
            | AnnotationSpec::LocalsMaps { pc, .. }
            | AnnotationSpec::ArgsMaps { pc, .. }
            | AnnotationSpec::Funcdata { pc, .. } => *pc,
        }
    }

    fn to_annotation(&self) -> Result<Annotation> {
        let annotation = match self {
            AnnotationSpec::GoArgs { .. } => Annotation::GoArgs,
            AnnotationSpec::GoResultsInitialized { .. } => Annotation::GoResultsInitialized,
            AnnotationSpec::NoLocalPointers { .. } => Annotation::NoLocalPointers,
            AnnotationSpec::Pcdata { channel, value, .. } => Annotation::Pcdata {
                channel: PcdataChannel::from_name(channel)
                    .ok_or_else(|| anyhow!("unknown PCDATA channel '{}'", channel))?,
                value: *value,
            },
            AnnotationSpec::LocalsMaps { bits, maps, .. } => Annotation::Funcdata {
                slot: FuncdataSlot::LocalsPointerMaps,
                table: stack_map(*bits, maps)?.encode(),
            },
            AnnotationSpec::ArgsMaps { bits, maps, .. } => Annotation::Funcdata {
                slot: FuncdataSlot::ArgsPointerMaps,
                table: stack_map(*bits, maps)?.encode(),
            },
            AnnotationSpec::Funcdata { slot, bytes, .. } => Annotation::Funcdata {
                slot: FuncdataSlot::from_name(slot)
                    .ok_or_else(|| anyhow!("unknown FUNCDATA slot '{}'", slot))?,
                table: bytes.clone(),
            },
        };
        Ok(annotation)
    }
}

fn stack_map(bits: u32, maps: &[Vec<u32>]) -> Result<StackMap> {
    let mut map = StackMap::new(bits);
    for set in maps {
        if let Some(&bit) = set.iter().find(|&&b| b >= bits) {
            bail!("bit {} out of range for a {}-bit map", bit, bits);
        }
        map.push(BitVector::with_bits(bits, set));
    }
    Ok(map)
}

impl RoutineFile {
    /// Read and parse a routine file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Parse routine descriptions from TOML text
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Resolved target
    pub fn target(&self) -> Result<Target> {
        let target = match &self.target {
            None => Target::default(),
            Some(TargetSpec::Preset(name)) => {
                Target::preset(name).ok_or_else(|| anyhow!("unknown target '{}'", name))?
            }
            Some(TargetSpec::Explicit(target)) => *target,
        };
        if !target.is_valid() {
            bail!(
                "invalid target: pointer size {}, pc quantum {}",
                target.ptr_size,
                target.pc_quantum
            );
        }
        Ok(target)
    }

    /// Annotate every routine and collect the records into a verified image
    pub fn build_image(&self) -> Result<MetadataImage> {
        let target = self.target()?;
        let mut image = MetadataImage::new(target);
        for routine in &self.routines {
            let func = routine
                .build(target)
                .with_context(|| format!("in routine {}", routine.name))?;
            image.add_function(func)?;
        }
        verify_image(&image)?;
        Ok(image)
    }
}

impl RoutineSpec {
    fn prototype(&self) -> Result<Option<Prototype>> {
        if self.params.is_none() && self.results.is_empty() {
            return Ok(None);
        }
        let parse = |names: &[String]| -> Result<Vec<ParamKind>> {
            names
                .iter()
                .map(|name| {
                    ParamKind::parse(name).ok_or_else(|| anyhow!("unknown kind '{}'", name))
                })
                .collect()
        };
        let params = parse(self.params.as_deref().unwrap_or_default())?;
        let results = parse(&self.results)?;
        Ok(Some(Prototype::new(params, results)))
    }

    fn build(&self, target: Target) -> Result<gcmeta::FuncRecord> {
        let prototype = self.prototype()?;
        let args_size = match &self.args_size {
            Some(ArgsSizeSpec::Bytes(bytes)) => ArgsSize::Known(*bytes),
            Some(ArgsSizeSpec::Named(name)) if name == "unknown" => ArgsSize::Unknown,
            Some(ArgsSizeSpec::Named(name)) => bail!("invalid args_size '{}'", name),
            None => ArgsSize::Known(
                prototype
                    .as_ref()
                    .map_or(0, |p| p.args_size(target.ptr_bytes())),
            ),
        };

        let mut decl = RoutineDecl::new(self.name.clone(), self.entry, self.len);
        decl.args_size = args_size;
        decl.frame_size = self.frame_size;
        let mut builder = RoutineBuilder::new(decl, target);
        if let Some(prototype) = prototype {
            builder = builder.with_prototype(prototype);
        }

        // go_args has to stay first; side tables hold for the whole routine
        let mut annotations = self.annotations.iter().peekable();
        if let Some(spec) = annotations.next_if(|a| matches!(a, AnnotationSpec::GoArgs { .. })) {
            builder.annotate(spec.pc(), spec.to_annotation()?)?;
        }
        for (slot, table) in self.side_tables(target) {
            builder.funcdata(0, slot, table)?;
        }
        for spec in annotations {
            builder.annotate(spec.pc(), spec.to_annotation()?)?;
        }
        Ok(builder.finish()?)
    }

    fn side_tables(&self, target: Target) -> Vec<(FuncdataSlot, Vec<u8>)> {
        let ptr_size = target.ptr_bytes();
        let mut tables = Vec::new();
        if !self.stack_objects.is_empty() {
            let mut objects = StackObjects::new();
            for object in &self.stack_objects {
                objects.push(object.offset, object.size, ptr_size, &object.ptr_words);
            }
            tables.push((FuncdataSlot::StackObjects, objects.encode(ptr_size)));
        }
        if !self.inline.is_empty() {
            let mut tree = InlineTree::new();
            for call in &self.inline {
                tree.push(call.name.clone(), call.parent_pc, call.start_line);
            }
            tables.push((FuncdataSlot::InlTree, tree.encode()));
        }
        if let Some(defer) = &self.defer {
            let info = OpenCodedDeferInfo {
                defer_bits_offset: defer.bits_offset,
                slots_offset: defer.slots_offset,
            };
            tables.push((FuncdataSlot::OpenCodedDeferInfo, info.encode()));
        }
        tables
    }
}
