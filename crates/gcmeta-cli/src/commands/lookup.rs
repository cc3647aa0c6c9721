//! `gcmeta lookup`: show the metadata in effect at one pc.

use super::load_image;
use crate::output::StyledOutput;
use gcmeta::{FrameContext, FrameScanner, MissingMapPolicy, PcdataChannel, ScanOptions};
use std::path::Path;

pub fn execute(path: &Path, pc: u64, call: bool, out: &mut StyledOutput) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let options = ScanOptions {
        missing_locals: MissingMapPolicy::Skip,
        missing_args: MissingMapPolicy::Skip,
        allow_unsafe_points: true,
    };
    let frame = FrameContext {
        pc,
        varp: 0,
        argp: 0,
        at_call: call,
    };
    let scan = FrameScanner::new(&image, options).scan_frame(&frame)?;
    let func = image
        .find_func(scan.entry)
        .ok_or_else(|| anyhow::anyhow!("no function at {:#x}", scan.entry))?;

    out.bold(&scan.func);
    out.line(&format!(
        "+{:#x} (lookup pc {:#x})",
        scan.lookup_pc - func.entry,
        scan.lookup_pc
    ));
    for channel in PcdataChannel::ALL {
        let value = func.pcdata_value(channel, scan.lookup_pc, &image.target)?;
        out.info(&format!("  {:<16}", channel.name()));
        out.line(&format!(" {}", value));
    }
    if scan.unsafe_point.is_safe() {
        out.success("  safe point");
        out.newline();
    } else {
        out.warning(&format!("  unsafe point ({:?})", scan.unsafe_point));
        out.newline();
    }
    out.line("  frames:");
    for logical in &scan.inline_frames {
        match logical.start_line {
            Some(line) => out.line(&format!("    {} (inlined, line {})", logical.name, line)),
            None => out.line(&format!("    {}", logical.name)),
        }
    }
    Ok(())
}
