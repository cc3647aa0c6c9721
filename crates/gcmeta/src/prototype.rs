//! Routine prototypes
//!
//! A prototype describes the parameters and results of a low-level routine
//! closely enough to derive its args size, its args pointer maps and its arg
//! info descriptor. Parameters are laid out in order with natural alignment
//! starting at the args base; results start at the next pointer-aligned
//! offset after the last parameter.

use crate::arg_info::{ArgInfo, ArgShape, MAX_DEPTH, MAX_SCALARS};
use crate::stackmap::{BitVector, StackMap};

/// Kind of one parameter or result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// A pointer into the collected heap
    Pointer,
    /// A pointer-sized non-pointer (`int`, `uintptr`)
    Word,
    /// A fixed-size non-pointer of 1, 2, 4 or 8 bytes
    Scalar(u8),
    /// Fields laid out in order
    Aggregate(Vec<ParamKind>),
}

impl ParamKind {
    /// Parse a kind name: `ptr`, `int`, `uintptr`, `int8`..`int64`,
    /// `uint8`..`uint64`, `float32`, `float64`, `bool`, the shorthands
    /// `string`, `slice` and `iface`, or `{kind, kind, ...}`
    pub fn parse(text: &str) -> Option<ParamKind> {
        let mut parser = KindParser { text, pos: 0 };
        let kind = parser.kind()?;
        parser.skip_ws();
        (parser.pos == text.len()).then_some(kind)
    }

    /// Size in bytes on a target with the given pointer size
    pub fn size(&self, ptr_size: u32) -> u32 {
        match self {
            ParamKind::Pointer | ParamKind::Word => ptr_size,
            ParamKind::Scalar(size) => *size as u32,
            ParamKind::Aggregate(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset = align_up(offset, field.align(ptr_size)) + field.size(ptr_size);
                }
                align_up(offset, self.align(ptr_size))
            }
        }
    }

    /// Alignment in bytes
    pub fn align(&self, ptr_size: u32) -> u32 {
        match self {
            ParamKind::Pointer | ParamKind::Word => ptr_size,
            ParamKind::Scalar(size) => (*size as u32).clamp(1, ptr_size),
            ParamKind::Aggregate(fields) => fields
                .iter()
                .map(|f| f.align(ptr_size))
                .max()
                .unwrap_or(1),
        }
    }

    fn mark_pointers(&self, offset: u32, ptr_size: u32, bits: &mut BitVector) {
        match self {
            ParamKind::Pointer => bits.set(offset / ptr_size),
            ParamKind::Word | ParamKind::Scalar(_) => {}
            ParamKind::Aggregate(fields) => {
                let mut field_offset = offset;
                for field in fields {
                    field_offset = align_up(field_offset, field.align(ptr_size));
                    field.mark_pointers(field_offset, ptr_size, bits);
                    field_offset += field.size(ptr_size);
                }
            }
        }
    }
}

/// Parameters and results of a routine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prototype {
    /// Parameter kinds in order
    pub params: Vec<ParamKind>,
    /// Result kinds in order
    pub results: Vec<ParamKind>,
}

impl Prototype {
    /// Create a prototype
    pub fn new(params: Vec<ParamKind>, results: Vec<ParamKind>) -> Self {
        Self { params, results }
    }

    /// Offsets of each parameter, then each result, plus the total args size
    fn layout(&self, ptr_size: u32) -> (Vec<u32>, Vec<u32>, u32) {
        let mut offset = 0;
        let mut params = Vec::with_capacity(self.params.len());
        for param in &self.params {
            offset = align_up(offset, param.align(ptr_size));
            params.push(offset);
            offset += param.size(ptr_size);
        }
        offset = align_up(offset, ptr_size);
        let mut results = Vec::with_capacity(self.results.len());
        for result in &self.results {
            offset = align_up(offset, result.align(ptr_size));
            results.push(offset);
            offset += result.size(ptr_size);
        }
        (params, results, align_up(offset, ptr_size))
    }

    /// Size of the args region (parameters and results) in bytes
    pub fn args_size(&self, ptr_size: u32) -> u32 {
        self.layout(ptr_size).2
    }

    /// Args pointer maps: bitmap 0 covers parameters only, bitmap 1 also
    /// covers results (selected once results are initialized)
    pub fn args_stackmap(&self, ptr_size: u32) -> StackMap {
        let (params, results, size) = self.layout(ptr_size);
        let words = size / ptr_size;

        let mut entry = BitVector::new(words);
        for (kind, &offset) in self.params.iter().zip(&params) {
            kind.mark_pointers(offset, ptr_size, &mut entry);
        }
        let mut with_results = entry.clone();
        for (kind, &offset) in self.results.iter().zip(&results) {
            kind.mark_pointers(offset, ptr_size, &mut with_results);
        }

        let mut map = StackMap::new(words);
        map.push(entry);
        map.push(with_results);
        map
    }

    /// Arg info descriptor for the parameters
    pub fn arg_info(&self, ptr_size: u32) -> ArgInfo {
        let (params, _, _) = self.layout(ptr_size);
        let mut info = ArgInfo::new();
        let mut scalars = 0;
        for (kind, &offset) in self.params.iter().zip(&params) {
            if !describe(kind, offset, ptr_size, 0, &mut scalars, &mut info) {
                break;
            }
        }
        info
    }
}

/// Returns false once the scalar budget is exhausted and `...` was emitted
fn describe(
    kind: &ParamKind,
    offset: u32,
    ptr_size: u32,
    depth: usize,
    scalars: &mut usize,
    info: &mut ArgInfo,
) -> bool {
    match kind {
        ParamKind::Aggregate(fields) => {
            info.shapes.push(ArgShape::StartAgg);
            if depth + 1 >= MAX_DEPTH {
                info.shapes.push(ArgShape::Ellipsis);
                info.shapes.push(ArgShape::EndAgg);
                return true;
            }
            let mut field_offset = offset;
            for field in fields {
                field_offset = align_up(field_offset, field.align(ptr_size));
                if !describe(field, field_offset, ptr_size, depth + 1, scalars, info) {
                    info.shapes.push(ArgShape::EndAgg);
                    return false;
                }
                field_offset += field.size(ptr_size);
            }
            info.shapes.push(ArgShape::EndAgg);
            true
        }
        _ => {
            if *scalars == MAX_SCALARS {
                info.shapes.push(ArgShape::Ellipsis);
                return false;
            }
            *scalars += 1;
            info.push_scalar(offset, kind.size(ptr_size));
            true
        }
    }
}

#[inline]
fn align_up(value: u32, align: u32) -> u32 {
    let align = align.max(1);
    (value + align - 1) / align * align
}

struct KindParser<'a> {
    text: &'a str,
    pos: usize,
}

impl KindParser<'_> {
    fn skip_ws(&mut self) {
        let rest = &self.text[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.text[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn kind(&mut self) -> Option<ParamKind> {
        if self.eat('{') {
            let mut fields = Vec::new();
            if self.eat('}') {
                return Some(ParamKind::Aggregate(fields));
            }
            loop {
                fields.push(self.kind()?);
                if self.eat('}') {
                    return Some(ParamKind::Aggregate(fields));
                }
                if !self.eat(',') {
                    return None;
                }
            }
        }

        self.skip_ws();
        let rest = &self.text[self.pos..];
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let word = &rest[..len];
        self.pos += len;
        let kind = match word {
            "ptr" | "pointer" | "unsafe_pointer" => ParamKind::Pointer,
            "int" | "uint" | "uintptr" => ParamKind::Word,
            "bool" | "int8" | "uint8" | "byte" => ParamKind::Scalar(1),
            "int16" | "uint16" => ParamKind::Scalar(2),
            "int32" | "uint32" | "float32" | "rune" => ParamKind::Scalar(4),
            "int64" | "uint64" | "float64" => ParamKind::Scalar(8),
            "string" => ParamKind::Aggregate(vec![ParamKind::Pointer, ParamKind::Word]),
            "slice" => ParamKind::Aggregate(vec![
                ParamKind::Pointer,
                ParamKind::Word,
                ParamKind::Word,
            ]),
            "iface" => ParamKind::Aggregate(vec![ParamKind::Pointer, ParamKind::Pointer]),
            _ => return None,
        };
        Some(kind)
    }
}
