//! Code emission
//!
//! Lowers an analyzed unit into the target-neutral emitter IR that backends
//! turn into machine code.

pub mod display;
pub mod emitter;
pub mod helpers;
pub mod ir;

pub use emitter::{CodeEmitter, EmitError, EmitOptions, EmitOutput, HandlerEntry, MAX_INLINE_LIFT};
pub use helpers::{symbol_names, DataSymbol, Failure, Helper};
pub use ir::{Cond, Field, FrameState, IrBlock, IrBlockId, IrFunction, IrOp, Terminator, Value, ValueKind};

use crate::bytecode::{CodeUnit, Instruction};
use crate::jit::analysis::Analysis;

/// Emit IR for an analyzed unit
pub fn emit(
    unit: &CodeUnit,
    instrs: &[Instruction],
    analysis: &Analysis,
    options: EmitOptions,
) -> Result<EmitOutput, EmitError> {
    CodeEmitter::new(unit, instrs, analysis, options).emit()
}
