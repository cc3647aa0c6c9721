//! `gcmeta scan`: report the live roots of one frame.

use super::load_image;
use crate::output::StyledOutput;
use gcmeta::{FrameContext, FrameScanner, RegionScan, ScanOptions};
use std::path::Path;

fn print_region(name: &str, region: &RegionScan, out: &mut StyledOutput) {
    out.info(&format!("  {}:", name));
    match region {
        RegionScan::Precise(slots) if slots.is_empty() => out.line(" no pointers"),
        RegionScan::Precise(slots) => {
            out.line(&format!(" {} pointers", slots.len()));
            for slot in slots {
                out.line(&format!("    {:+} {:#x}", slot.offset, slot.addr));
            }
        }
        RegionScan::Conservative { base, words } => {
            out.warning(" conservative");
            out.line(&format!(" {} words from {:#x}", words, base));
        }
        RegionScan::Skipped => out.line(" skipped (no pointer map)"),
        RegionScan::SizeUnknown => out.line(" size unknown, not scanned"),
    }
}

pub fn execute(
    path: &Path,
    frame: &FrameContext,
    options: ScanOptions,
    defer_bits: Option<u8>,
    out: &mut StyledOutput,
) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let scan = FrameScanner::new(&image, options).scan_frame(frame)?;

    out.bold(&scan.func);
    out.line(&format!(
        " lookup pc {:#x}, stack map index {}",
        scan.lookup_pc, scan.stack_map_index
    ));
    print_region("args", &scan.args, out);
    print_region("locals", &scan.locals, out);

    for object in &scan.stack_objects {
        out.info("  object:");
        let pointers: Vec<String> = object.pointers.iter().map(|p| format!("{:#x}", p)).collect();
        out.line(&format!(
            " {:#x} size {} pointers [{}]",
            object.addr,
            object.size,
            pointers.join(", ")
        ));
    }
    if let Some(defer) = &scan.defer {
        out.info("  defer:");
        out.line(&format!(
            " bits {:#x} slots {:#x}",
            defer.bits_addr, defer.slots_addr
        ));
        if let Some(bits) = defer_bits {
            let pending: Vec<String> = defer
                .pending(bits, image.target.ptr_bytes())
                .iter()
                .map(|addr| format!("{:#x}", addr))
                .collect();
            out.line(&format!("    pending [{}]", pending.join(", ")));
        }
    }
    let names: Vec<&str> = scan.inline_frames.iter().map(|f| f.name.as_str()).collect();
    out.info("  frames:");
    out.line(&format!(" {}", names.join(" <- ")));
    Ok(())
}
