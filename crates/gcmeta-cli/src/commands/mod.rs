//! Subcommand implementations

pub mod assemble;
pub mod dump;
pub mod lookup;
pub mod scan;
pub mod verify;

use anyhow::Context;
use gcmeta::MetadataImage;
use std::path::Path;

/// Parse a decimal or `0x`-prefixed hex number, allowing `_` separators
pub fn parse_u64(text: &str) -> Result<u64, String> {
    let cleaned = text.replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", text, e))
}

/// Parse a byte value in the same notation as [`parse_u64`]
pub fn parse_u8(text: &str) -> Result<u8, String> {
    let value = parse_u64(text)?;
    u8::try_from(value).map_err(|_| format!("'{}' does not fit in a byte", text))
}

/// Read and decode an image file
pub fn load_image(path: &Path) -> anyhow::Result<MetadataImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let image = MetadataImage::decode(&bytes)
        .with_context(|| format!("failed to load image {}", path.display()))?;
    log::info!(
        "loaded {} ({} functions)",
        path.display(),
        image.functions().len()
    );
    Ok(image)
}
