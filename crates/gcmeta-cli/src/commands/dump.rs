//! `gcmeta dump`: print the contents of an image.

use super::load_image;
use crate::output::StyledOutput;
use anyhow::Context;
use gcmeta::{
    ArgInfo, ArgShape, FuncRecord, FuncdataSlot, MetadataImage, PcdataChannel, StackMap, Target,
    PROTOCOL_VERSION,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Serialize)]
struct ImageView {
    version: u32,
    target: Target,
    functions: Vec<FuncView>,
}

#[derive(Debug, Serialize)]
struct FuncView {
    name: String,
    entry: u64,
    len: u32,
    /// `None` when the args size is unknown
    args_size: Option<u32>,
    frame_size: u32,
    pcdata: BTreeMap<&'static str, Vec<RangeView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args_pointer_maps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locals_pointer_maps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_objects: Option<Vec<StackObjectView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inl_tree: Option<Vec<InlineView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    open_coded_defer_info: Option<DeferView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arg_info: Option<String>,
}

#[derive(Debug, Serialize)]
struct RangeView {
    start: u32,
    end: u32,
    value: i32,
}

#[derive(Debug, Serialize)]
struct StackObjectView {
    offset: i32,
    size: u32,
    ptr_bytes: u32,
    ptr_mask: String,
}

#[derive(Debug, Serialize)]
struct InlineView {
    name: String,
    parent_pc: u32,
    start_line: u32,
}

#[derive(Debug, Serialize)]
struct DeferView {
    defer_bits_offset: u32,
    slots_offset: u32,
}

fn bitmaps(map: StackMap) -> Vec<String> {
    map.bitmaps().iter().map(|b| b.to_string()).collect()
}

/// Compact shape notation: `(0:8, {8:4, 12:4}, ...)`
fn shapes(info: &ArgInfo) -> String {
    let mut text = String::from("(");
    let mut need_sep = false;
    for shape in &info.shapes {
        if need_sep && *shape != ArgShape::EndAgg {
            text.push_str(", ");
        }
        need_sep = true;
        match shape {
            ArgShape::Scalar { offset, size } => text.push_str(&format!("{}:{}", offset, size)),
            ArgShape::StartAgg => {
                text.push('{');
                need_sep = false;
            }
            ArgShape::EndAgg => text.push('}'),
            ArgShape::Ellipsis => text.push_str("..."),
            ArgShape::OffsetTooLarge => text.push('_'),
        }
    }
    text.push(')');
    text
}

fn func_view(func: &FuncRecord, target: &Target) -> anyhow::Result<FuncView> {
    let mut pcdata = BTreeMap::new();
    for channel in PcdataChannel::ALL {
        if let Some(table) = func.pcdata_table(channel) {
            let ranges = table
                .ranges(target.quantum())
                .map(|r| {
                    r.map(|r| RangeView {
                        start: r.start,
                        end: r.end,
                        value: r.value,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            pcdata.insert(channel.name(), ranges);
        }
    }

    Ok(FuncView {
        name: func.name.clone(),
        entry: func.entry,
        len: func.len,
        args_size: func.args_size.known(),
        frame_size: func.frame_size,
        pcdata,
        args_pointer_maps: func.args_pointer_maps()?.map(bitmaps),
        locals_pointer_maps: func.locals_pointer_maps()?.map(bitmaps),
        stack_objects: func.stack_objects(target)?.map(|objects| {
            objects
                .records
                .into_iter()
                .map(|r| StackObjectView {
                    offset: r.offset,
                    size: r.size,
                    ptr_bytes: r.ptr_bytes,
                    ptr_mask: r.ptr_mask.to_string(),
                })
                .collect()
        }),
        inl_tree: func.inline_tree()?.map(|tree| {
            tree.calls
                .into_iter()
                .map(|c| InlineView {
                    name: c.name,
                    parent_pc: c.parent_pc,
                    start_line: c.start_line,
                })
                .collect()
        }),
        open_coded_defer_info: func.open_coded_defer_info()?.map(|info| DeferView {
            defer_bits_offset: info.defer_bits_offset,
            slots_offset: info.slots_offset,
        }),
        arg_info: func.arg_info()?.map(|info| shapes(&info)),
    })
}

fn image_view(image: &MetadataImage) -> anyhow::Result<ImageView> {
    let functions = image
        .functions()
        .iter()
        .map(|func| func_view(func, &image.target).with_context(|| format!("in {}", func.name)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(ImageView {
        version: PROTOCOL_VERSION,
        target: image.target,
        functions,
    })
}

pub fn execute(path: &Path, json: bool, out: &mut StyledOutput) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let view = image_view(&image)?;

    if json {
        out.line(&serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    out.line(&format!(
        "version {}, pointer size {}, pc quantum {}, {} functions",
        view.version,
        view.target.ptr_size,
        view.target.pc_quantum,
        view.functions.len()
    ));
    for func in &view.functions {
        out.newline();
        out.bold(&func.name);
        let args = func
            .args_size
            .map_or_else(|| "unknown".to_string(), |size| size.to_string());
        out.line(&format!(
            " [{:#x}, {:#x}) args {} frame {}",
            func.entry,
            func.entry + func.len as u64,
            args,
            func.frame_size
        ));

        for (channel, ranges) in &func.pcdata {
            out.info(&format!("  pcdata {}:", channel));
            let text: Vec<String> = ranges
                .iter()
                .map(|r| format!("[{:#x}, {:#x}) {}", r.start, r.end, r.value))
                .collect();
            out.line(&format!(" {}", text.join(", ")));
        }

        let maps = [
            (FuncdataSlot::ArgsPointerMaps, &func.args_pointer_maps),
            (FuncdataSlot::LocalsPointerMaps, &func.locals_pointer_maps),
        ];
        for (slot, bitmaps) in maps {
            if let Some(bitmaps) = bitmaps {
                out.info(&format!("  funcdata {}:", slot.name()));
                out.line(&format!(" [{}]", bitmaps.join(", ")));
            }
        }
        if let Some(objects) = &func.stack_objects {
            out.info(&format!("  funcdata {}:", FuncdataSlot::StackObjects.name()));
            let text: Vec<String> = objects
                .iter()
                .map(|o| format!("{}+{} ptrs {}", o.offset, o.size, o.ptr_mask))
                .collect();
            out.line(&format!(" {}", text.join(", ")));
        }
        if let Some(calls) = &func.inl_tree {
            out.info(&format!("  funcdata {}:", FuncdataSlot::InlTree.name()));
            let text: Vec<String> = calls
                .iter()
                .enumerate()
                .map(|(i, c)| format!("#{} {} @{:#x} line {}", i, c.name, c.parent_pc, c.start_line))
                .collect();
            out.line(&format!(" {}", text.join(", ")));
        }
        if let Some(defer) = &func.open_coded_defer_info {
            out.info(&format!("  funcdata {}:", FuncdataSlot::OpenCodedDeferInfo.name()));
            out.line(&format!(
                " bits varp-{} slots varp-{}",
                defer.defer_bits_offset, defer.slots_offset
            ));
        }
        if let Some(info) = &func.arg_info {
            out.info(&format!("  funcdata {}:", FuncdataSlot::ArgInfo.name()));
            out.line(&format!(" {}", info));
        }
    }
    Ok(())
}
