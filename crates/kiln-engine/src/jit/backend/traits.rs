//! Backend-agnostic code generation traits
//!
//! Defines the `CodegenBackend` trait that pluggable backends (Cranelift, the
//! portable stub) implement, along with the compiled-code result.

use crate::jit::emit::IrFunction;

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// Target information
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

impl TargetInfo {
    /// Information for the machine running this process
    pub fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            TargetInfo { arch: TargetArch::AArch64, pointer_size: 8 }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
        }
    }
}

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Backend error: {0}")]
    BackendError(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Lowering failed: {0}")]
    Lowering(String),
}

/// Machine code for one unit, positioned relative to its first byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCode {
    /// Raw machine code bytes
    pub code: Vec<u8>,
    /// Offset of the function entry point within code
    pub entry_offset: usize,
    /// Resume key of every entry-dispatch target, in dispatch order. The
    /// host stores the key into the frame's handler slot before re-entering
    pub handler_pcs: Vec<i64>,
}

/// The backend-agnostic code generation trait
///
/// Backends implement this to generate native code from emitter IR.
/// The compilation pipeline is:
///   IrFunction → compile_function() → CompiledCode → ExecMemoryArena
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics and cache compatibility)
    fn name(&self) -> &str;

    /// Compile an emitted function to machine code
    fn compile_function(&self, func: &IrFunction) -> Result<CompiledCode, CodegenError>;

    /// Return target architecture information
    fn target_info(&self) -> TargetInfo;
}
