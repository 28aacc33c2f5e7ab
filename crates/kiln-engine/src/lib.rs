//! Kiln engine
//!
//! A method JIT for CPython 3.10 wordcode:
//! - **Bytecode**: opcodes, code units, decoding and validation (`bytecode` module)
//! - **JIT**: analysis, emission, backends, executable memory, artifact cache
//!   and the compilation driver (`jit` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_engine::{CodeUnit, CompilationDriver, JitConfig};
//!
//! let unit = CodeUnit::from_json(&std::fs::read_to_string("f.json")?)?;
//! let driver = CompilationDriver::new(JitConfig::global().clone())?;
//! let outcome = driver.compile(&unit)?;
//! println!("{} bytes, cached: {}", outcome.artifact.code().len(), outcome.from_cache);
//! ```

#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod jit;

pub use bytecode::{CodeFlags, CodeUnit, Opcode};
pub use jit::{CompilationDriver, CompileOutcome, JitConfig, JitError};
