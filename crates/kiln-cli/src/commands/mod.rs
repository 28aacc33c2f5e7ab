pub mod analyze;
pub mod cache;
pub mod compile;

use std::path::Path;

use anyhow::Context;
use kiln_engine::CodeUnit;

/// Read a unit description from disk
pub fn load_unit(path: &Path) -> anyhow::Result<CodeUnit> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    CodeUnit::from_json(&text).with_context(|| format!("Failed to parse {}", path.display()))
}
