//! Bytecode model consumed by the JIT
//!
//! - [`opcode`]: the instruction set
//! - [`code`]: code unit metadata
//! - [`decoder`]: instruction words and extended-argument folding
//! - [`validate`]: frame-layout checks on untrusted units

pub mod code;
pub mod decoder;
pub mod opcode;
pub mod validate;

pub use code::{CodeFlags, CodeUnit};
pub use decoder::{decode, folded_oparg, prefix_start, DecodeError, Instruction};
pub use opcode::Opcode;
pub use validate::{validate, ValidateError};
