//! Method JIT for CPython 3.10 wordcode
//!
//! This module provides everything between a code unit and placed machine
//! code:
//! - Static analysis (block graph, redundant loads, live locals, stack heights)
//! - Emission of a backend-neutral IR with reference counting made explicit
//! - Backend trait for pluggable code generation
//! - Executable memory and the compiled artifact
//! - A persistent on-disk artifact cache
//! - The driver that chains them

pub mod analysis;
pub mod backend;
pub mod cache;
pub mod config;
pub mod driver;
pub mod emit;
pub mod runtime;

pub use config::JitConfig;
pub use driver::{CompilationDriver, CompileOutcome, Translation};

use crate::bytecode::{DecodeError, ValidateError};
use self::analysis::{AnalysisError, GraphError};
use self::backend::CodegenError;
use self::cache::CacheError;
use self::emit::EmitError;
use self::runtime::ExecMemoryError;

/// Errors from the compilation pipeline
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Invalid unit: {0}")]
    Invalid(#[from] ValidateError),
    #[error("Block graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("Emit error: {0}")]
    Emit(#[from] EmitError),
    #[error("Codegen error: {0}")]
    Codegen(#[from] CodegenError),
    #[error("Executable memory error: {0}")]
    ExecMemory(#[from] ExecMemoryError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Contract violation: {0}")]
    Contract(String),
}
