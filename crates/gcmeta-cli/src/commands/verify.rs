//! `gcmeta verify`: check every function record of an image.

use super::load_image;
use crate::output::StyledOutput;
use gcmeta::verify_function;
use std::path::Path;

pub fn execute(path: &Path, out: &mut StyledOutput) -> anyhow::Result<()> {
    let image = load_image(path)?;
    let mut failed = 0;
    for func in image.functions() {
        match verify_function(func, &image.target) {
            Ok(()) => {
                out.pass_badge();
                out.line(&format!(" {}", func.name));
            }
            Err(e) => {
                failed += 1;
                out.fail_badge();
                out.line(&format!(" {}", e));
            }
        }
    }

    out.newline();
    if failed > 0 {
        anyhow::bail!(
            "{} of {} functions failed verification",
            failed,
            image.functions().len()
        );
    }
    out.success("OK");
    out.line(&format!(" {} functions verified", image.functions().len()));
    Ok(())
}
