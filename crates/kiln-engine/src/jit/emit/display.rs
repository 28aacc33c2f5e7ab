//! Pretty-printing for emitter IR
//!
//! Display implementations for debugging and dump output.

use std::fmt;
use super::ir::{Cond, Field, FrameState, IrBlock, IrFunction, IrOp, Terminator, Value};

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function @{} (values: {}, stack base: {}) {{",
            self.name, self.value_count(), self.stack_base)?;

        for block in &self.blocks {
            write!(f, "{}", block)?;
        }

        writeln!(f, "}}")
    }
}

impl fmt::Display for IrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {}:  ; {}", self.id, self.label)?;
        for op in &self.ops {
            writeln!(f, "    {}", op)?;
        }
        writeln!(f, "    {}", self.terminator)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Slt => "slt",
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Pointee => "*",
            Field::ObType => "ob_type",
            Field::TypeFlags => "tp_flags",
            Field::TypeIternext => "tp_iternext",
            Field::CellRef => "ob_ref",
        })
    }
}

impl fmt::Display for IrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrOp::Iconst { dest, value } => write!(f, "{} = iconst {}", dest, value),
            IrOp::FramePtr { dest } => write!(f, "{} = frame", dest),
            IrOp::LoadSymbol { dest, symbol } => write!(f, "{} = symbol {}", dest, symbol),
            IrOp::LoadHandler { dest } => write!(f, "{} = load.handler", dest),
            IrOp::LoadEvalBreaker { dest } => write!(f, "{} = load.eval_breaker", dest),

            IrOp::LoadLocal { dest, slot } => write!(f, "{} = load.local {}", dest, slot),
            IrOp::StoreLocal { slot, value } => write!(f, "store.local {}, {}", slot, value),
            IrOp::LoadStack { dest, index } => write!(f, "{} = load.stack {}", dest, index),
            IrOp::StoreStack { index, value } => write!(f, "store.stack {}, {}", index, value),
            IrOp::StackAddr { dest, index } => write!(f, "{} = addr.stack {}", dest, index),
            IrOp::LoadConst { dest, index } => write!(f, "{} = load.const {}", dest, index),
            IrOp::LoadName { dest, index } => write!(f, "{} = load.name {}", dest, index),
            IrOp::OpcacheAddr { dest, index } => write!(f, "{} = addr.opcache {}", dest, index),

            IrOp::LoadField { dest, base, field } => write!(f, "{} = load.field {}.{}", dest, base, field),
            IrOp::StoreField { base, field, value } => write!(f, "store.field {}.{}, {}", base, field, value),

            IrOp::SetLasti { vpc } => write!(f, "set.lasti {}", vpc),
            IrOp::SetFrameState { state, stack_depth } => {
                let name = match state {
                    FrameState::Suspended => "suspended",
                    FrameState::Returned => "returned",
                };
                write!(f, "set.state {}, depth {}", name, stack_depth)
            }

            IrOp::IncRef { value } => write!(f, "incref {}", value),
            IrOp::DecRef { value, null_check: true } => write!(f, "xdecref {}", value),
            IrOp::DecRef { value, null_check: false } => write!(f, "decref {}", value),

            IrOp::Call { dest, helper, args } => {
                if let Some(dest) = dest {
                    write!(f, "{} = ", dest)?;
                }
                write!(f, "call {}(", helper)?;
                format_args_list(f, args)?;
                write!(f, ")")
            }
            IrOp::CallIndirect { dest, callee, args } => {
                write!(f, "{} = call_indirect {}(", dest, callee)?;
                format_args_list(f, args)?;
                write!(f, ")")
            }

            IrOp::ICmp { dest, cond, lhs, rhs } => write!(f, "{} = icmp.{} {}, {}", dest, cond, lhs, rhs),
            IrOp::Band { dest, lhs, rhs } => write!(f, "{} = band {}, {}", dest, lhs, rhs),
            IrOp::Select { dest, cond, if_true, if_false } =>
                write!(f, "{} = select {}, {}, {}", dest, cond, if_true, if_false),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jmp {}", target),
            Terminator::Branch { cond, then_block, else_block, unlikely } => {
                write!(f, "br {}, {}, {}", cond, then_block, else_block)?;
                if *unlikely {
                    write!(f, " ; cold")?;
                }
                Ok(())
            }
            Terminator::Return(value) => write!(f, "ret {}", value),
            Terminator::Unreachable => write!(f, "unreachable"),
            Terminator::Dispatch { selector, default, targets } => {
                write!(f, "dispatch {} [0: {}", selector, default)?;
                for (i, target) in targets.iter().enumerate() {
                    write!(f, ", {}: {}", i + 1, target)?;
                }
                write!(f, "]")
            }
            Terminator::None => write!(f, "<no terminator>"),
        }
    }
}

fn format_args_list(f: &mut fmt::Formatter<'_>, args: &[Value]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 { write!(f, ", ")?; }
        write!(f, "{}", arg)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::emit::helpers::Helper;
    use crate::jit::emit::ir::{IrBlockId, ValueKind};

    #[test]
    fn test_display_function() {
        let mut func = IrFunction::new("demo", 2);
        let entry = func.add_block("entry");
        let v0 = func.alloc_value(ValueKind::Word);
        let v1 = func.alloc_value(ValueKind::Word);
        let block = func.block_mut(entry);
        block.ops.push(IrOp::LoadLocal { dest: v0, slot: 1 });
        block.ops.push(IrOp::Call { dest: Some(v1), helper: Helper::GetIter, args: vec![v0] });
        block.ops.push(IrOp::DecRef { value: v0, null_check: true });
        block.terminator = Terminator::Return(v1);

        let text = func.to_string();
        assert!(text.starts_with("function @demo (values: 2, stack base: 2) {"));
        assert!(text.contains("  bb0:  ; entry"));
        assert!(text.contains("v0 = load.local 1"));
        assert!(text.contains("v1 = call handle_GET_ITER(v0)"));
        assert!(text.contains("xdecref v0"));
        assert!(text.contains("ret v1"));
    }

    #[test]
    fn test_display_dispatch() {
        let term = Terminator::Dispatch {
            selector: Value(0),
            default: IrBlockId(1),
            targets: vec![IrBlockId(4)],
        };
        assert_eq!(term.to_string(), "dispatch v0 [0: bb1, 1: bb4]");
    }
}
