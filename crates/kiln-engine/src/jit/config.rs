//! JIT configuration
//!
//! Read once per process from the environment:
//!
//! | Variable | Effect |
//! |---|---|
//! | `KILN_CACHE_ROOT` | cache directory; empty disables caching |
//! | `KILN_THRESHOLD_RATIO` | multiplier on the base call threshold |
//! | `KILN_FORWARD_LOADS` | `0` disables redundant-load forwarding |
//! | `KILN_ELIDE_INIT_CHECKS` | `0` keeps every unbound-local check |

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::jit::emit::EmitOptions;

/// Calls before a unit is worth compiling, at ratio 1.0
pub const BASE_THRESHOLD: i32 = 0x4000;

/// Configuration for the JIT
#[derive(Debug, Clone, PartialEq)]
pub struct JitConfig {
    /// Absolute cache directory; `None` disables the artifact cache
    pub cache_root: Option<PathBuf>,
    /// Scale applied to [`BASE_THRESHOLD`]
    pub threshold_ratio: f64,
    /// Forward redundant loads from their origin instead of the stack
    pub forward_loads: bool,
    /// Skip unbound-local checks for locals proven bound
    pub elide_init_checks: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            cache_root: dirs::cache_dir().map(|d| d.join("kiln")),
            threshold_ratio: 1.0,
            forward_loads: true,
            elide_init_checks: true,
        }
    }
}

static GLOBAL_CONFIG: Lazy<JitConfig> = Lazy::new(JitConfig::from_env);

impl JitConfig {
    /// Configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = JitConfig::default();

        if let Some(root) = lookup("KILN_CACHE_ROOT") {
            config.cache_root = absolute_root(&root);
        }
        if let Some(ratio) = lookup("KILN_THRESHOLD_RATIO") {
            match ratio.trim().parse::<f64>() {
                Ok(r) if r.is_finite() && r >= 0.0 => config.threshold_ratio = r,
                _ => log::warn!("ignoring KILN_THRESHOLD_RATIO={:?}", ratio),
            }
        }
        if let Some(v) = lookup("KILN_FORWARD_LOADS") {
            config.forward_loads = flag(&v);
        }
        if let Some(v) = lookup("KILN_ELIDE_INIT_CHECKS") {
            config.elide_init_checks = flag(&v);
        }
        config
    }

    /// The process-wide configuration
    pub fn global() -> &'static JitConfig {
        &GLOBAL_CONFIG
    }

    /// Call count at which a host should compile a unit
    pub fn jit_threshold(&self) -> i32 {
        let scaled = BASE_THRESHOLD as f64 * self.threshold_ratio;
        if scaled >= i32::MAX as f64 {
            i32::MAX
        } else {
            scaled as i32
        }
    }

    /// Options handed to the emitter
    pub fn emit_options(&self) -> EmitOptions {
        EmitOptions {
            forward_loads: self.forward_loads,
            elide_init_checks: self.elide_init_checks,
        }
    }

    pub fn cache_root(&self) -> Option<&Path> {
        self.cache_root.as_deref()
    }
}

fn absolute_root(root: &str) -> Option<PathBuf> {
    if root.is_empty() {
        return None;
    }
    match std::path::absolute(root) {
        Ok(path) => Some(path),
        Err(e) => {
            log::warn!("cache root {:?} unusable: {}", root, e);
            None
        }
    }
}

fn flag(value: &str) -> bool {
    value.trim() != "0"
}
