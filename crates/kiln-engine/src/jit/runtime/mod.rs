//! Runtime support for compiled code
//!
//! - [`abi`]: host structure layout and the entry signature
//! - [`exec_memory`]: the executable memory arena
//! - [`artifact`]: a unit's placed code and side tables

pub mod abi;
pub mod artifact;
pub mod exec_memory;

pub use abi::{JitCFrame, JitEntryFn, Opcache};
pub use artifact::{CompiledArtifact, StackHeights};
pub use exec_memory::{ArenaStats, CodeAllocation, ExecMemoryArena, ExecMemoryError};

use std::sync::Arc;

use once_cell::sync::Lazy;

static GLOBAL_ARENA: Lazy<Arc<ExecMemoryArena>> = Lazy::new(ExecMemoryArena::new);

/// The process-wide executable memory arena
pub fn global_arena() -> &'static Arc<ExecMemoryArena> {
    &GLOBAL_ARENA
}
