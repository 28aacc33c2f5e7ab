//! `kiln compile`: Compile a unit through the driver.

use std::path::{Path, PathBuf};

use anyhow::Context;
use kiln_engine::jit::cache::cache_path;
use kiln_engine::{CompilationDriver, JitConfig};

pub fn execute(
    path: &Path,
    cache_root: Option<PathBuf>,
    no_cache: bool,
    dump_ir: bool,
) -> anyhow::Result<()> {
    let unit = super::load_unit(path)?;

    let mut config = JitConfig::global().clone();
    if let Some(root) = cache_root {
        let root = std::path::absolute(&root)
            .with_context(|| format!("Invalid cache root {}", root.display()))?;
        config.cache_root = Some(root);
    }
    if no_cache {
        config.cache_root = None;
    }

    let driver = CompilationDriver::new(config).context("Failed to create the compilation driver")?;

    if dump_ir {
        let translation = driver.translate(&unit).context("Compilation failed")?;
        print!("{}", translation.emitted.function);
        println!();
    }

    let outcome = driver.compile(&unit).context("Compilation failed")?;
    let artifact = &outcome.artifact;

    println!("unit:          {}", unit.name);
    println!("backend:       {}", driver.backend().name());
    println!("code:          {} bytes", artifact.code().len());
    println!("inline caches: {}", artifact.opcache_num());
    println!("height width:  {} byte(s)", artifact.stack_heights().width());
    if artifact.handler_num() > 0 {
        let pairs: Vec<String> = artifact
            .handler_vpcs()
            .iter()
            .zip(artifact.handler_pcs())
            .map(|(vpc, pc)| format!("{}->{}", vpc, pc))
            .collect();
        println!("handlers:      {}", pairs.join(" "));
    }
    match driver.config().cache_root() {
        Some(root) => {
            let state = if outcome.from_cache { "hit" } else { "stored" };
            println!("cache:         {} ({})", state, cache_path(root, &unit).display());
        }
        None => println!("cache:         disabled"),
    }
    Ok(())
}
