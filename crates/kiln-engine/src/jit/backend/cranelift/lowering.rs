//! Emitter IR → Cranelift IR lowering
//!
//! Every IR value becomes a Cranelift variable, so values may be used in any
//! block dominated by their definition without explicit block parameters.
//! Frame-relative operations are resolved against pointers loaded once in a
//! prologue block ahead of the IR entry block. Blocks the IR never reaches
//! from its entry are not lowered.

use cranelift_codegen::ir::{self, condcodes::IntCC, types, InstBuilder, MemFlags};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Switch, Variable};

use crate::jit::emit::{Cond, Failure, IrBlockId, IrFunction, IrOp, Terminator, Value, ValueKind};
use crate::jit::runtime::abi::{self as host, code, frame, object, tuple, type_object, WORD};
use super::abi;

/// Error during Cranelift lowering
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("Block {0} has no terminator")]
    OpenBlock(IrBlockId),
    #[error("Cranelift error: {0}")]
    CraneliftError(String),
}

/// Pointers loaded once on entry
struct Prologue {
    symbols: ir::Value,
    frame: ir::Value,
    cframe: ir::Value,
    eval_breaker: ir::Value,
    /// `f_valuestack`
    stack: ir::Value,
    /// First item of `co_consts`
    consts: ir::Value,
    /// First item of `co_names`
    names: ir::Value,
    /// First entry of the inline-cache pool
    opcache: ir::Value,
}

/// State maintained during lowering of a single function
pub struct LoweringContext<'a> {
    func: &'a IrFunction,
    call_conv: CallConv,
    /// IR value → Cranelift variable
    vars: Vec<Variable>,
    /// IR block → Cranelift block; `None` for unreachable blocks
    block_map: Vec<Option<ir::Block>>,
    prologue: Prologue,
    /// Resume keys handed out by the entry dispatch
    handler_keys: Vec<i64>,
}

/// Blocks reachable from the IR entry
fn reachable_blocks(func: &IrFunction) -> Vec<bool> {
    let mut seen = vec![false; func.blocks.len()];
    let mut worklist = vec![func.entry];
    while let Some(id) = worklist.pop() {
        if std::mem::replace(&mut seen[id.index()], true) {
            continue;
        }
        worklist.extend(func.block(id).terminator.successors());
    }
    seen
}

impl<'a> LoweringContext<'a> {
    /// Lower an entire function into Cranelift IR and return the resume key
    /// of every dispatch target. Takes ownership of the builder since
    /// finalize() consumes it.
    pub fn lower(
        func: &'a IrFunction,
        mut builder: FunctionBuilder<'_>,
        call_conv: CallConv,
    ) -> Result<Vec<i64>, LowerError> {
        let reachable = reachable_blocks(func);
        let block_map: Vec<Option<ir::Block>> = reachable
            .iter()
            .map(|&r| r.then(|| builder.create_block()))
            .collect();
        let ir_entry = block_map[func.entry.index()]
            .ok_or_else(|| LowerError::CraneliftError("entry block missing".to_string()))?;

        let prologue_block = builder.create_block();
        builder.append_block_params_for_function_params(prologue_block);
        builder.switch_to_block(prologue_block);
        let prologue = emit_prologue(&mut builder, prologue_block);
        builder.ins().jump(ir_entry, &[]);

        let vars = func
            .value_kinds
            .iter()
            .map(|kind| match kind {
                ValueKind::Word => builder.declare_var(types::I64),
                ValueKind::Flag => builder.declare_var(types::I8),
            })
            .collect();

        let mut ctx = LoweringContext {
            func,
            call_conv,
            vars,
            block_map,
            prologue,
            handler_keys: vec![],
        };

        for block in &func.blocks {
            let Some(cl_block) = ctx.block_map[block.id.index()] else {
                continue;
            };
            builder.switch_to_block(cl_block);
            for op in &block.ops {
                ctx.lower_op(op, &mut builder);
            }
            ctx.lower_terminator(block.id, &block.terminator, &mut builder)?;
        }

        builder.seal_all_blocks();
        builder.finalize();
        Ok(ctx.handler_keys)
    }

    fn use_value(&self, builder: &mut FunctionBuilder<'_>, value: Value) -> ir::Value {
        builder.use_var(self.vars[value.0 as usize])
    }

    fn def_value(&self, builder: &mut FunctionBuilder<'_>, value: Value, val: ir::Value) {
        builder.def_var(self.vars[value.0 as usize], val);
    }

    fn block(&self, id: IrBlockId) -> Result<ir::Block, LowerError> {
        self.block_map[id.index()]
            .ok_or_else(|| LowerError::CraneliftError(format!("{} was not lowered", id)))
    }

    fn lower_op(&mut self, op: &IrOp, builder: &mut FunctionBuilder<'_>) {
        let p = &self.prologue;
        let flags = MemFlags::trusted();
        match op {
            IrOp::Iconst { dest, value } => {
                let v = builder.ins().iconst(types::I64, *value);
                self.def_value(builder, *dest, v);
            }
            IrOp::FramePtr { dest } => self.def_value(builder, *dest, p.frame),
            IrOp::LoadSymbol { dest, symbol } => {
                let v = builder.ins().load(types::I64, flags, p.symbols, symbol.table_index() as i32 * WORD);
                self.def_value(builder, *dest, v);
            }
            IrOp::LoadHandler { dest } => {
                let v = builder.ins().load(types::I64, flags, p.cframe, host::cframe::HANDLER);
                self.def_value(builder, *dest, v);
            }
            IrOp::LoadEvalBreaker { dest } => {
                let flag = builder.ins().load(types::I32, MemFlags::new(), p.eval_breaker, 0);
                let v = builder.ins().sextend(types::I64, flag);
                self.def_value(builder, *dest, v);
            }

            IrOp::LoadLocal { dest, slot } => {
                let v = builder.ins().load(types::I64, flags, p.frame, local_offset(*slot));
                self.def_value(builder, *dest, v);
            }
            IrOp::StoreLocal { slot, value } => {
                let v = self.use_value(builder, *value);
                builder.ins().store(flags, v, p.frame, local_offset(*slot));
            }
            IrOp::LoadStack { dest, index } => {
                let v = builder.ins().load(types::I64, flags, p.stack, *index as i32 * WORD);
                self.def_value(builder, *dest, v);
            }
            IrOp::StoreStack { index, value } => {
                let v = self.use_value(builder, *value);
                builder.ins().store(flags, v, p.stack, *index as i32 * WORD);
            }
            IrOp::StackAddr { dest, index } => {
                let v = builder.ins().iadd_imm(p.stack, i64::from(*index) * i64::from(WORD));
                self.def_value(builder, *dest, v);
            }
            IrOp::LoadConst { dest, index } => {
                let v = builder.ins().load(types::I64, flags, p.consts, *index as i32 * WORD);
                self.def_value(builder, *dest, v);
            }
            IrOp::LoadName { dest, index } => {
                let v = builder.ins().load(types::I64, flags, p.names, *index as i32 * WORD);
                self.def_value(builder, *dest, v);
            }
            IrOp::OpcacheAddr { dest, index } => {
                let offset = i64::from(*index) * i64::from(host::OPCACHE_ENTRY_SIZE);
                let v = builder.ins().iadd_imm(p.opcache, offset);
                self.def_value(builder, *dest, v);
            }

            IrOp::LoadField { dest, base, field } => {
                let b = self.use_value(builder, *base);
                let v = builder.ins().load(types::I64, flags, b, abi::field_offset(*field));
                self.def_value(builder, *dest, v);
            }
            IrOp::StoreField { base, field, value } => {
                let b = self.use_value(builder, *base);
                let v = self.use_value(builder, *value);
                builder.ins().store(flags, v, b, abi::field_offset(*field));
            }

            IrOp::SetLasti { vpc } => {
                let v = builder.ins().iconst(types::I32, i64::from(*vpc));
                builder.ins().store(flags, v, p.frame, frame::F_LASTI);
            }
            IrOp::SetFrameState { state, stack_depth } => {
                let s = builder.ins().iconst(types::I8, i64::from(*state as i8));
                builder.ins().store(flags, s, p.frame, frame::F_STATE);
                let d = builder.ins().iconst(types::I32, i64::from(*stack_depth));
                builder.ins().store(flags, d, p.frame, frame::F_STACKDEPTH);
            }

            IrOp::IncRef { value } => {
                let obj = self.use_value(builder, *value);
                let count = builder.ins().load(types::I64, flags, obj, object::OB_REFCNT);
                let count = builder.ins().iadd_imm(count, 1);
                builder.ins().store(flags, count, obj, object::OB_REFCNT);
            }
            IrOp::DecRef { value, null_check } => {
                let obj = self.use_value(builder, *value);
                self.emit_decref(builder, obj, *null_check);
            }

            IrOp::Call { dest, helper, args } => {
                let args: Vec<_> = args.iter().map(|a| self.use_value(builder, *a)).collect();
                let sig = builder.import_signature(abi::helper_signature(self.call_conv, *helper));
                let callee = builder.ins().load(
                    types::I64,
                    MemFlags::trusted().with_readonly(),
                    self.prologue.symbols,
                    helper.table_index() as i32 * WORD,
                );
                let call = builder.ins().call_indirect(sig, callee, &args);
                if let Some(dest) = dest {
                    let result = builder.inst_results(call)[0];
                    let result = match helper.failure() {
                        Failure::NegativeStatus => builder.ins().sextend(types::I64, result),
                        _ => result,
                    };
                    self.def_value(builder, *dest, result);
                }
            }
            IrOp::CallIndirect { dest, callee, args } => {
                let callee = self.use_value(builder, *callee);
                let args: Vec<_> = args.iter().map(|a| self.use_value(builder, *a)).collect();
                let sig = builder.import_signature(abi::indirect_signature(self.call_conv, args.len()));
                let call = builder.ins().call_indirect(sig, callee, &args);
                let result = builder.inst_results(call)[0];
                self.def_value(builder, *dest, result);
            }

            IrOp::ICmp { dest, cond, lhs, rhs } => {
                let cc = match cond {
                    Cond::Eq => IntCC::Equal,
                    Cond::Ne => IntCC::NotEqual,
                    Cond::Slt => IntCC::SignedLessThan,
                };
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let v = builder.ins().icmp(cc, l, r);
                self.def_value(builder, *dest, v);
            }
            IrOp::Band { dest, lhs, rhs } => {
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let v = builder.ins().band(l, r);
                self.def_value(builder, *dest, v);
            }
            IrOp::Select { dest, cond, if_true, if_false } => {
                let c = self.use_value(builder, *cond);
                let t = self.use_value(builder, *if_true);
                let f = self.use_value(builder, *if_false);
                let v = builder.ins().select(c, t, f);
                self.def_value(builder, *dest, v);
            }
        }
    }

    /// Inline reference drop; a count reaching zero calls the type's
    /// `tp_dealloc` on a cold path
    fn emit_decref(&self, builder: &mut FunctionBuilder<'_>, obj: ir::Value, null_check: bool) {
        let flags = MemFlags::trusted();
        let done = builder.create_block();
        if null_check {
            let live = builder.create_block();
            builder.ins().brif(obj, live, &[], done, &[]);
            builder.switch_to_block(live);
        }

        let count = builder.ins().load(types::I64, flags, obj, object::OB_REFCNT);
        let count = builder.ins().iadd_imm(count, -1);
        builder.ins().store(flags, count, obj, object::OB_REFCNT);

        let dealloc = builder.create_block();
        builder.set_cold_block(dealloc);
        builder.ins().brif(count, done, &[], dealloc, &[]);

        builder.switch_to_block(dealloc);
        let ty = builder.ins().load(types::I64, flags, obj, object::OB_TYPE);
        let destructor = builder.ins().load(types::I64, flags, ty, type_object::TP_DEALLOC);
        let sig = builder.import_signature(abi::dealloc_signature(self.call_conv));
        builder.ins().call_indirect(sig, destructor, &[obj]);
        builder.ins().jump(done, &[]);

        builder.switch_to_block(done);
    }

    fn lower_terminator(
        &mut self,
        id: IrBlockId,
        term: &Terminator,
        builder: &mut FunctionBuilder<'_>,
    ) -> Result<(), LowerError> {
        match term {
            Terminator::Jump(target) => {
                let target = self.block(*target)?;
                builder.ins().jump(target, &[]);
            }
            Terminator::Branch { cond, then_block, else_block, unlikely } => {
                let c = self.use_value(builder, *cond);
                let then_cl = self.block(*then_block)?;
                let else_cl = self.block(*else_block)?;
                if *unlikely {
                    builder.set_cold_block(then_cl);
                }
                builder.ins().brif(c, then_cl, &[], else_cl, &[]);
            }
            Terminator::Return(value) => {
                let v = self.use_value(builder, *value);
                builder.ins().return_(&[v]);
            }
            Terminator::Unreachable => {
                let code = ir::TrapCode::user(1)
                    .ok_or_else(|| LowerError::CraneliftError("invalid trap code".to_string()))?;
                builder.ins().trap(code);
            }
            Terminator::Dispatch { selector, default, targets } => {
                let sel = self.use_value(builder, *selector);
                let mut switch = Switch::new();
                for (i, target) in targets.iter().enumerate() {
                    let key = i as i64 + 1;
                    switch.set_entry(key as u128, self.block(*target)?);
                    self.handler_keys.push(key);
                }
                let default = self.block(*default)?;
                switch.emit(builder, sel, default);
            }
            Terminator::None => return Err(LowerError::OpenBlock(id)),
        }
        Ok(())
    }
}

/// Load the frame-derived base pointers in the prologue block
fn emit_prologue(builder: &mut FunctionBuilder<'_>, block: ir::Block) -> Prologue {
    let params = builder.block_params(block).to_vec();
    let (symbols, frame_ptr, cframe, eval_breaker) = (params[0], params[1], params[2], params[3]);
    let flags = MemFlags::trusted();

    let stack = builder.ins().load(types::I64, flags, frame_ptr, frame::F_VALUESTACK);
    let code_obj = builder.ins().load(types::I64, flags, frame_ptr, frame::F_CODE);
    let consts = builder.ins().load(types::I64, flags, code_obj, code::CO_CONSTS);
    let consts = builder.ins().iadd_imm(consts, i64::from(tuple::OB_ITEM));
    let names = builder.ins().load(types::I64, flags, code_obj, code::CO_NAMES);
    let names = builder.ins().iadd_imm(names, i64::from(tuple::OB_ITEM));
    let opcache = builder.ins().load(types::I64, flags, cframe, host::cframe::OPCACHE);

    Prologue { symbols, frame: frame_ptr, cframe, eval_breaker, stack, consts, names, opcache }
}

fn local_offset(slot: u32) -> i32 {
    frame::F_LOCALSPLUS + slot as i32 * WORD
}
