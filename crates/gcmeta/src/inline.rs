//! Inline call trees
//!
//! When a callee body is inlined into its caller, the physical frame covers
//! several logical frames. Each node of the tree names one inlined callee and
//! records the pc (in the enclosing function) of the call it replaced; the
//! `InlTreeIndex` PCDATA value at that pc identifies the parent node, or is
//! `-1` when the parent is the physical function itself.

use crate::encoder::{DecodeError, TableReader, TableWriter};

/// One inlined call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedCall {
    /// Name of the inlined callee
    pub name: String,
    /// pc offset of the call instruction in the parent
    pub parent_pc: u32,
    /// Source line where the callee starts
    pub start_line: u32,
}

/// The inline tree of one function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineTree {
    /// Nodes, addressed by the `InlTreeIndex` channel
    pub calls: Vec<InlinedCall>,
}

impl InlineTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its index
    pub fn push(&mut self, name: impl Into<String>, parent_pc: u32, start_line: u32) -> i32 {
        self.calls.push(InlinedCall {
            name: name.into(),
            parent_pc,
            start_line,
        });
        (self.calls.len() - 1) as i32
    }

    /// Node at an `InlTreeIndex` value; negative values yield `None`
    pub fn get(&self, index: i32) -> Option<&InlinedCall> {
        usize::try_from(index).ok().and_then(|i| self.calls.get(i))
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether the tree has no nodes
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Encode to the wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = TableWriter::new();
        writer.emit_uvarint(self.calls.len() as u32);
        for call in &self.calls {
            writer.emit_string(&call.name);
            writer.emit_uvarint(call.parent_pc);
            writer.emit_uvarint(call.start_line);
        }
        writer.into_bytes()
    }

    /// Decode from the wire format
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = TableReader::new(data);
        let count = reader.read_uvarint()?;
        let mut calls = Vec::with_capacity((count as usize).min(reader.remaining()));
        for _ in 0..count {
            let name = reader.read_string()?;
            let parent_pc = reader.read_uvarint()?;
            let start_line = reader.read_uvarint()?;
            calls.push(InlinedCall {
                name,
                parent_pc,
                start_line,
            });
        }
        Ok(Self { calls })
    }
}
