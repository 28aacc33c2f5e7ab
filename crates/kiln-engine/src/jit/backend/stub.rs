//! Stub backend for exercising the pipeline without real codegen
//!
//! Produces a deterministic byte encoding of the emitter IR behind a single
//! trap instruction (INT3 / BRK), so the bytes are never executable. Block
//! references are encoded as byte offsets; the offsets of the entry dispatch
//! targets are reported as handler pcs. Identical IR always yields identical
//! bytes, which is what the artifact cache needs from a backend.

use super::traits::*;
use crate::jit::emit::{IrBlockId, IrFunction, IrOp, Terminator, Value};

/// A stub backend that produces placeholder code
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile_function(&self, func: &IrFunction) -> Result<CompiledCode, CodegenError> {
        let trap: &[u8] = match self.target_info().arch {
            TargetArch::X86_64 => &[0xCC],                   // INT3
            TargetArch::AArch64 => &[0x00, 0x00, 0x20, 0xD4], // BRK #0
        };
        StubEncoder::new(trap).encode(func)
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo::host()
    }
}

struct StubEncoder {
    out: Vec<u8>,
    block_offsets: Vec<Option<u32>>,
    /// Positions of block references to patch once every block is placed
    fixups: Vec<(usize, IrBlockId)>,
}

impl StubEncoder {
    fn new(prologue: &[u8]) -> Self {
        StubEncoder { out: prologue.to_vec(), block_offsets: vec![], fixups: vec![] }
    }

    fn encode(mut self, func: &IrFunction) -> Result<CompiledCode, CodegenError> {
        self.block_offsets = vec![None; func.blocks.len()];
        self.u32(func.stack_base);
        self.u32(func.value_count() as u32);

        let mut handler_targets = vec![];
        for block in &func.blocks {
            self.block_offsets[block.id.index()] = Some(self.out.len() as u32);
            for op in &block.ops {
                self.op(op);
            }
            if let Terminator::Dispatch { targets, .. } = &block.terminator {
                handler_targets.extend(targets.iter().copied());
            }
            self.terminator(&block.terminator)
                .ok_or_else(|| CodegenError::Lowering(format!("{} has no terminator", block.id)))?;
        }

        for (pos, target) in std::mem::take(&mut self.fixups) {
            let offset = self.offset_of(target)?;
            self.out[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());
        }
        let handler_pcs = handler_targets
            .into_iter()
            .map(|b| self.offset_of(b).map(i64::from))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CompiledCode { code: self.out, entry_offset: 0, handler_pcs })
    }

    fn offset_of(&self, block: IrBlockId) -> Result<u32, CodegenError> {
        self.block_offsets
            .get(block.index())
            .copied()
            .flatten()
            .ok_or_else(|| CodegenError::Lowering(format!("reference to unknown block {}", block)))
    }

    fn op(&mut self, op: &IrOp) {
        match op {
            IrOp::Iconst { dest, value } => {
                self.tag(0x01, *dest);
                self.out.extend_from_slice(&value.to_le_bytes());
            }
            IrOp::FramePtr { dest } => self.tag(0x02, *dest),
            IrOp::LoadSymbol { dest, symbol } => {
                self.tag(0x03, *dest);
                self.u32(symbol.table_index() as u32);
            }
            IrOp::LoadHandler { dest } => self.tag(0x04, *dest),
            IrOp::LoadEvalBreaker { dest } => self.tag(0x05, *dest),
            IrOp::LoadLocal { dest, slot } => {
                self.tag(0x10, *dest);
                self.u32(*slot);
            }
            IrOp::StoreLocal { slot, value } => {
                self.tag(0x11, *value);
                self.u32(*slot);
            }
            IrOp::LoadStack { dest, index } => {
                self.tag(0x12, *dest);
                self.u32(*index);
            }
            IrOp::StoreStack { index, value } => {
                self.tag(0x13, *value);
                self.u32(*index);
            }
            IrOp::StackAddr { dest, index } => {
                self.tag(0x14, *dest);
                self.u32(*index);
            }
            IrOp::LoadConst { dest, index } => {
                self.tag(0x15, *dest);
                self.u32(*index);
            }
            IrOp::LoadName { dest, index } => {
                self.tag(0x16, *dest);
                self.u32(*index);
            }
            IrOp::OpcacheAddr { dest, index } => {
                self.tag(0x17, *dest);
                self.u32(*index);
            }
            IrOp::LoadField { dest, base, field } => {
                self.tag(0x20, *dest);
                self.value(*base);
                self.out.push(*field as u8);
            }
            IrOp::StoreField { base, field, value } => {
                self.tag(0x21, *base);
                self.value(*value);
                self.out.push(*field as u8);
            }
            IrOp::SetLasti { vpc } => {
                self.out.push(0x30);
                self.out.extend_from_slice(&vpc.to_le_bytes());
            }
            IrOp::SetFrameState { state, stack_depth } => {
                self.out.push(0x31);
                self.out.push(*state as i8 as u8);
                self.u32(*stack_depth);
            }
            IrOp::IncRef { value } => self.tag(0x40, *value),
            IrOp::DecRef { value, null_check } => self.tag(if *null_check { 0x42 } else { 0x41 }, *value),
            IrOp::Call { dest, helper, args } => {
                self.out.push(0x50);
                self.u32(dest.map_or(u32::MAX, |d| d.0));
                self.u32(helper.table_index() as u32);
                self.values(args);
            }
            IrOp::CallIndirect { dest, callee, args } => {
                self.tag(0x51, *dest);
                self.value(*callee);
                self.values(args);
            }
            IrOp::ICmp { dest, cond, lhs, rhs } => {
                self.tag(0x60, *dest);
                self.out.push(*cond as u8);
                self.value(*lhs);
                self.value(*rhs);
            }
            IrOp::Band { dest, lhs, rhs } => {
                self.tag(0x61, *dest);
                self.value(*lhs);
                self.value(*rhs);
            }
            IrOp::Select { dest, cond, if_true, if_false } => {
                self.tag(0x62, *dest);
                self.value(*cond);
                self.value(*if_true);
                self.value(*if_false);
            }
        }
    }

    /// Encode a terminator; `None` for a block left open
    fn terminator(&mut self, term: &Terminator) -> Option<()> {
        match term {
            Terminator::Jump(target) => {
                self.out.push(0x80);
                self.block_ref(*target);
            }
            Terminator::Branch { cond, then_block, else_block, unlikely } => {
                self.out.push(if *unlikely { 0x82 } else { 0x81 });
                self.value(*cond);
                self.block_ref(*then_block);
                self.block_ref(*else_block);
            }
            Terminator::Return(value) => {
                self.out.push(0x83);
                self.value(*value);
            }
            Terminator::Unreachable => self.out.push(0x84),
            Terminator::Dispatch { selector, default, targets } => {
                self.out.push(0x85);
                self.value(*selector);
                self.block_ref(*default);
                self.u32(targets.len() as u32);
                for target in targets {
                    self.block_ref(*target);
                }
            }
            Terminator::None => return None,
        }
        Some(())
    }

    fn tag(&mut self, tag: u8, value: Value) {
        self.out.push(tag);
        self.value(value);
    }

    fn value(&mut self, value: Value) {
        self.u32(value.0);
    }

    fn values(&mut self, values: &[Value]) {
        self.out.push(values.len() as u8);
        for v in values {
            self.value(*v);
        }
    }

    fn block_ref(&mut self, block: IrBlockId) {
        self.fixups.push((self.out.len(), block));
        self.u32(0);
    }

    fn u32(&mut self, word: u32) {
        self.out.extend_from_slice(&word.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::emit::{Helper, ValueKind};

    fn make_function() -> IrFunction {
        let mut func = IrFunction::new("f", 0);
        let entry = func.add_block("entry");
        let body = func.add_block("B0");
        let handler = func.add_block("B1");

        let selector = func.alloc_value(ValueKind::Word);
        let v = func.alloc_value(ValueKind::Word);
        func.block_mut(entry).ops.push(IrOp::LoadHandler { dest: selector });
        func.block_mut(entry).terminator = Terminator::Dispatch { selector, default: body, targets: vec![handler] };

        func.block_mut(body).ops.push(IrOp::LoadConst { dest: v, index: 0 });
        func.block_mut(body).ops.push(IrOp::IncRef { value: v });
        func.block_mut(body).terminator = Terminator::Jump(handler);

        func.block_mut(handler).ops.push(IrOp::Call { dest: None, helper: Helper::BlockPop, args: vec![v] });
        func.block_mut(handler).terminator = Terminator::Return(v);
        func
    }

    #[test]
    fn test_stub_compile() {
        let stub = StubBackend;
        assert_eq!(stub.name(), "stub");

        let code = stub.compile_function(&make_function()).unwrap();
        assert!(!code.code.is_empty());
        assert_eq!(code.entry_offset, 0);
        assert_eq!(code.handler_pcs.len(), 1);
        assert!((code.handler_pcs[0] as usize) < code.code.len());
    }

    #[test]
    fn test_stub_deterministic() {
        let func = make_function();
        let a = StubBackend.compile_function(&func).unwrap();
        let b = StubBackend.compile_function(&func).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stub_rejects_open_block() {
        let mut func = IrFunction::new("open", 0);
        func.add_block("entry");
        assert!(matches!(
            StubBackend.compile_function(&func),
            Err(CodegenError::Lowering(_))
        ));
    }
}
