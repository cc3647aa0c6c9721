//! `gcmeta assemble`: build an image from routine descriptions.

use crate::output::StyledOutput;
use crate::routines::RoutineFile;
use anyhow::Context;
use std::path::Path;

pub fn execute(input: &Path, output: &Path, out: &mut StyledOutput) -> anyhow::Result<()> {
    let file = RoutineFile::load(input)?;
    let image = file.build_image()?;
    let bytes = image.encode();
    std::fs::write(output, &bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;

    out.success("Assembled");
    out.line(&format!(
        " {} functions into {} ({} bytes)",
        image.functions().len(),
        output.display(),
        bytes.len()
    ));
    Ok(())
}
