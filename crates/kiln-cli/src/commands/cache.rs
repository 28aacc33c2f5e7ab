//! `kiln cache`: List the records in a cache file.

use std::path::Path;

use anyhow::Context;
use kiln_engine::jit::cache::{scan_records, CACHE_SUFFIX};

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    if !name.ends_with(CACHE_SUFFIX) {
        log::warn!("{} does not carry the {} suffix", path.display(), CACHE_SUFFIX);
    }
    let anonymous = name.contains("~anno");

    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let records = scan_records(&bytes, anonymous);
    println!("{}: {} bytes, {} record(s)", path.display(), bytes.len(), records.len());

    for (i, record) in records.iter().enumerate() {
        let h = &record.header;
        println!(
            "#{:<3} @{:<8} ts={} hash={:016x} unit={} code={} rodata={} caches={} handlers={}{}",
            i,
            record.offset,
            h.timestamp,
            h.hash,
            h.unit_size,
            h.code_size,
            h.rodata_size,
            h.opcache_num,
            h.handler_num,
            if record.truncated { " (truncated)" } else { "" }
        );
    }
    Ok(())
}
