//! Forward code emission
//!
//! Walks the blocks of an analyzed unit once, in order, and lowers every
//! instruction into emitter IR. A mirror of the evaluation stack tracks
//! where each logical value lives: in a real stack slot, or still in the
//! local or constant it was loaded from when the analysis proved the load
//! redundant. Forwarded values are read at their point of use and never
//! touch the stack or the reference count unless an instruction needs to
//! own them.
//!
//! Helper calls that can fail are followed by a check that branches to a
//! shared unwind block; the recorded `lasti` and the per-instruction stack
//! height table let the host release exactly the live stack values.

use crate::bytecode::opcode::{FVC_MASK, FVS_HAVE_SPEC, FVS_MASK};
use crate::bytecode::{folded_oparg, prefix_start, CodeFlags, CodeUnit, Instruction, Opcode};
use crate::jit::analysis::{Analysis, BitSet, Block, BlockId};

use super::helpers::{DataSymbol, Failure, Helper};
use super::ir::{Cond, Field, FrameState, IrBlockId, IrFunction, IrOp, Terminator, Value, ValueKind};

/// Rotations lifting more materialized slots than this call a helper
pub const MAX_INLINE_LIFT: u32 = 8;

/// `tp_flags` bit marking sequence types for pattern matching
const TPFLAGS_SEQUENCE: i64 = 1 << 5;
/// `tp_flags` bit marking mapping types for pattern matching
const TPFLAGS_MAPPING: i64 = 1 << 6;

/// Emission toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitOptions {
    /// Forward redundant loads instead of pushing them
    pub forward_loads: bool,
    /// Skip unbound-local guards for locals proven bound on block entry
    pub elide_init_checks: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions {
            forward_loads: true,
            elide_init_checks: true,
        }
    }
}

/// Inconsistency between the analysis and the instruction stream
#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("Instruction {vpc} ({opcode}) needs a materialized stack operand")]
    UnmaterializedOperand { vpc: usize, opcode: Opcode },
    #[error("Instruction {vpc} ({opcode}) pops from an empty stack")]
    StackUnderflow { vpc: usize, opcode: Opcode },
    #[error("Block {block} ends at stack height {found}, its fall successor starts at {expected}")]
    FallHeightMismatch { block: BlockId, expected: i32, found: u32 },
    #[error("RETURN_VALUE at instruction {vpc} leaves {height} values on the stack")]
    ReturnWithStack { vpc: usize, height: u32 },
    #[error("Stack height {height} at instruction {vpc} does not fit the height table")]
    StackTooDeep { vpc: usize, height: u32 },
    #[error("Instruction {vpc} ({opcode}) has no {edge} successor")]
    MissingEdge { vpc: usize, opcode: Opcode, edge: &'static str },
    #[error("Instruction {vpc} ({opcode}) has no compiled form")]
    Unsupported { vpc: usize, opcode: Opcode },
}

/// A block re-entered through the host's handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    /// Instruction index the host resumes at
    pub vpc: u32,
    pub block: IrBlockId,
}

/// Everything produced for one unit
#[derive(Debug, Clone)]
pub struct EmitOutput {
    pub function: IrFunction,
    /// Handler blocks sorted by `vpc`; their order matches the entry dispatch
    pub handlers: Vec<HandlerEntry>,
    /// Materialized stack height before each instruction
    pub stack_heights: Vec<u16>,
    /// Inline-cache entries consumed
    pub opcache_num: u32,
}

/// Where a logical stack value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackValue {
    /// Stack slot, counted from the bottom
    OnStack(u32),
    FromLocal(u32),
    FromConst(u32),
}

/// A popped operand; `owned` when it came from a real stack slot and so
/// carries a reference the consumer must drop
#[derive(Debug, Clone, Copy)]
struct Popped {
    value: Value,
    owned: bool,
}

/// Whether the instruction left the current IR block open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

/// Lowers one analyzed unit
pub struct CodeEmitter<'a> {
    unit: &'a CodeUnit,
    instrs: &'a [Instruction],
    analysis: &'a Analysis,
    options: EmitOptions,
    func: IrFunction,
    current: IrBlockId,
    /// IR block starting each bytecode block
    block_entries: Vec<IrBlockId>,
    is_handler: Vec<bool>,
    stack: Vec<StackValue>,
    /// Number of materialized entries in `stack`
    height: u32,
    /// Locals known to be bound at the current point
    defined: BitSet,
    stack_heights: Vec<u16>,
    opcache_count: u32,
    frame: Value,
    unwind: IrBlockId,
    unbound: IrBlockId,
    vpc: usize,
    opcode: Opcode,
}

impl<'a> CodeEmitter<'a> {
    pub fn new(unit: &'a CodeUnit, instrs: &'a [Instruction], analysis: &'a Analysis, options: EmitOptions) -> Self {
        let stack_base = unit.nlocals + unit.ncells() as u32;
        let mut func = IrFunction::new(unit.name.clone(), stack_base);

        let entry = func.add_block("entry");
        let block_entries = analysis
            .graph
            .blocks
            .iter()
            .map(|b| func.add_block(b.id.to_string()))
            .collect();
        let unwind = func.add_block("unwind");
        let unbound = func.add_block("unbound");
        let frame = func.alloc_value(ValueKind::Word);
        func.block_mut(entry).ops.push(IrOp::FramePtr { dest: frame });

        CodeEmitter {
            unit,
            instrs,
            analysis,
            options,
            func,
            current: entry,
            block_entries,
            is_handler: vec![false; analysis.graph.blocks.len()],
            stack: Vec::with_capacity(unit.stacksize as usize),
            height: 0,
            defined: BitSet::new(unit.nlocals as usize),
            stack_heights: vec![0; instrs.len()],
            opcache_count: 0,
            frame,
            unwind,
            unbound,
            vpc: 0,
            opcode: Opcode::Nop,
        }
    }

    pub fn emit(mut self) -> Result<EmitOutput, EmitError> {
        self.emit_shared_exits();

        let analysis = self.analysis;
        for block in &analysis.graph.blocks {
            self.switch_to(self.block_entries[block.id.index()]);
            let facts = analysis.facts(block.id);
            let Some(initial) = facts.initial_stack_height else {
                // Never entered; its height table entries stay zero
                self.terminate(Terminator::Unreachable);
                continue;
            };

            self.stack.clear();
            self.height = 0;
            self.declare_growth(initial as u32);
            self.defined = facts.locals_input.clone();

            let flow = self.emit_block(block)?;

            // Heights only meet the fall successor when the tail was emitted
            if let (Some(fall), true) = (block.fall, self.vpc == block.tail()) {
                if let Some(expected) = analysis.facts(fall).initial_stack_height {
                    if expected != self.height as i32 {
                        return Err(EmitError::FallHeightMismatch { block: block.id, expected, found: self.height });
                    }
                }
            }
            if flow == Flow::Continue {
                let fall = self.fall_of(block)?;
                self.terminate(Terminator::Jump(self.block_entry(fall)));
            }
        }

        let handlers = self.emit_entry_dispatch();
        log::trace!(
            "{}: emitted {} ops in {} IR blocks, {} handlers",
            self.unit.name,
            self.func.op_count(),
            self.func.blocks.len(),
            handlers.len()
        );

        Ok(EmitOutput {
            function: self.func,
            handlers,
            stack_heights: self.stack_heights,
            opcache_num: self.opcache_count,
        })
    }

    /// The unwind block returns null with the exception set; the unbound
    /// block raises the unbound-local error first
    fn emit_shared_exits(&mut self) {
        self.switch_to(self.unwind);
        let null = self.iconst(0);
        self.terminate(Terminator::Return(null));

        self.switch_to(self.unbound);
        self.call_void(Helper::RaiseUnboundLocal, vec![self.frame]);
    }

    fn emit_entry_dispatch(&mut self) -> Vec<HandlerEntry> {
        let handlers: Vec<HandlerEntry> = self
            .analysis
            .graph
            .blocks
            .iter()
            .filter(|b| self.is_handler[b.id.index()])
            .map(|b| HandlerEntry { vpc: b.begin as u32, block: self.block_entry(b.id) })
            .collect();

        self.switch_to(self.func.entry);
        let selector = self.func.alloc_value(ValueKind::Word);
        self.push_op(IrOp::LoadHandler { dest: selector });
        self.terminate(Terminator::Dispatch {
            selector,
            default: self.block_entry(self.analysis.graph.entry()),
            targets: handlers.iter().map(|h| h.block).collect(),
        });
        handlers
    }

    fn emit_block(&mut self, block: &Block) -> Result<Flow, EmitError> {
        for vpc in block.begin..block.end {
            let opcode = self.instrs[vpc].opcode;
            self.vpc = vpc;
            self.opcode = opcode;

            let lasti = prefix_start(self.instrs, vpc);
            self.push_op(IrOp::SetLasti { vpc: lasti as i32 });
            self.stack_heights[vpc] = u16::try_from(self.height)
                .map_err(|_| EmitError::StackTooDeep { vpc, height: self.height })?;

            if opcode == Opcode::ExtendedArg {
                continue;
            }
            let oparg = folded_oparg(self.instrs, vpc);
            if self.emit_instr(block, vpc, opcode, oparg)? == Flow::Closed {
                return Ok(Flow::Closed);
            }
        }
        Ok(Flow::Continue)
    }

    fn emit_instr(&mut self, block: &Block, vpc: usize, opcode: Opcode, oparg: u32) -> Result<Flow, EmitError> {
        use Opcode::*;

        match opcode {
            Nop | ExtendedArg => {}

            // ===== Stack shuffles =====
            RotTwo => self.emit_rot_n(2)?,
            RotThree => self.emit_rot_n(3)?,
            RotFour => self.emit_rot_n(4)?,
            RotN => self.emit_rot_n(oparg)?,
            DupTop => self.emit_dup(1)?,
            DupTopTwo => self.emit_dup(2)?,
            PopTop => {
                let value = self.pop()?;
                self.release(value);
            }

            // ===== Locals and constants =====
            LoadConst => {
                if self.forwarding(vpc) {
                    self.stack.push(StackValue::FromConst(oparg));
                } else {
                    let value = self.load_const(oparg);
                    self.push(value);
                    self.incref(value);
                }
            }
            LoadFast => self.emit_load_fast(vpc, oparg),
            StoreFast => self.emit_store_fast(oparg)?,
            DeleteFast => {
                let old = self.load_local(oparg);
                if self.needs_init_check(oparg) {
                    self.check_unbound(old);
                }
                let null = self.iconst(0);
                self.push_op(IrOp::StoreLocal { slot: oparg, value: null });
                self.decref(old, false);
                self.defined.reset(oparg as usize);
            }

            // ===== Cells =====
            LoadClosure => {
                let cell = self.load_cell(oparg);
                self.push(cell);
                self.incref(cell);
            }
            LoadDeref => {
                let cell = self.load_cell(oparg);
                let value = self.load_field(cell, Field::CellRef);
                self.check_unbound(value);
                self.push(value);
                self.incref(value);
            }
            StoreDeref => {
                let cell = self.load_cell(oparg);
                let old = self.load_field(cell, Field::CellRef);
                let value = self.pop()?;
                if !value.owned {
                    self.incref(value.value);
                }
                self.push_op(IrOp::StoreField { base: cell, field: Field::CellRef, value: value.value });
                self.decref(old, true);
            }
            DeleteDeref => {
                let cell = self.load_cell(oparg);
                let old = self.load_field(cell, Field::CellRef);
                self.check_unbound(old);
                let null = self.iconst(0);
                self.push_op(IrOp::StoreField { base: cell, field: Field::CellRef, value: null });
                self.decref(old, false);
            }
            LoadClassderef => {
                let index = self.iconst(oparg as i64);
                let value = self.call(Helper::LoadClassderef, vec![self.frame, index]);
                self.push(value);
            }

            // ===== Globals and names =====
            LoadGlobal => {
                let name = self.load_name(oparg);
                let cache = self.opcache_entry();
                let value = self.call(Helper::LoadGlobal, vec![self.frame, name, cache]);
                self.push(value);
            }
            StoreGlobal | StoreName => {
                let helper = if opcode == StoreGlobal { Helper::StoreGlobal } else { Helper::StoreName };
                let name = self.load_name(oparg);
                let value = self.pop()?;
                self.call(helper, vec![self.frame, name, value.value]);
                self.release(value);
            }
            DeleteGlobal | DeleteName => {
                let helper = if opcode == DeleteGlobal { Helper::DeleteGlobal } else { Helper::DeleteName };
                let name = self.load_name(oparg);
                self.call(helper, vec![self.frame, name]);
            }
            LoadName => {
                let name = self.load_name(oparg);
                let value = self.call(Helper::LoadName, vec![self.frame, name]);
                self.push(value);
            }

            // ===== Attributes =====
            LoadAttr => {
                let owner = self.pop()?;
                let name = self.load_name(oparg);
                let cache = self.opcache_entry();
                let value = self.call(Helper::LoadAttr, vec![owner.value, name, self.frame, cache]);
                self.push(value);
                self.release(owner);
            }
            StoreAttr => {
                let owner = self.pop()?;
                let value = self.pop()?;
                let name = self.load_name(oparg);
                self.call(Helper::StoreAttr, vec![owner.value, name, value.value]);
                self.release(value);
                self.release(owner);
            }
            DeleteAttr => {
                let owner = self.pop()?;
                let name = self.load_name(oparg);
                let null = self.iconst(0);
                self.call(Helper::StoreAttr, vec![owner.value, name, null]);
                self.release(owner);
            }
            LoadMethod => {
                let slot = self.declare_shrink(1)?;
                let name = self.load_name(oparg);
                self.call(Helper::LoadMethod, vec![name, slot]);
                self.declare_growth(2);
            }

            // ===== Operators =====
            UnaryNot | UnaryPositive | UnaryNegative | UnaryInvert => {
                let helper = Helper::for_unary(opcode).ok_or_else(|| self.unsupported())?;
                let operand = self.pop()?;
                let result = self.call(helper, vec![operand.value]);
                self.push(result);
                self.release(operand);
            }
            CompareOp | ContainsOp => {
                let helper = if opcode == CompareOp { Helper::CompareOp } else { Helper::ContainsOp };
                let right = self.pop()?;
                let left = self.pop()?;
                let arg = self.iconst(oparg as i64);
                let result = self.call(helper, vec![left.value, right.value, arg]);
                self.push(result);
                self.release(left);
                self.release(right);
            }
            IsOp => {
                let right = self.pop()?;
                let left = self.pop()?;
                let same = self.icmp(Cond::Eq, left.value, right.value);
                let (if_same, if_different) = self.bool_pair(oparg == 0);
                let result = self.select(same, if_same, if_different);
                self.push(result);
                self.incref(result);
                self.release(left);
                self.release(right);
            }
            StoreSubscr => {
                let sub = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.call(Helper::StoreSubscr, vec![container.value, sub.value, value.value]);
                self.release(value);
                self.release(container);
                self.release(sub);
            }
            DeleteSubscr => {
                let sub = self.pop()?;
                let container = self.pop()?;
                self.call(Helper::DeleteSubscr, vec![container.value, sub.value]);
                self.release(container);
                self.release(sub);
            }
            _ if Helper::for_binary(opcode).is_some() => {
                let helper = Helper::for_binary(opcode).ok_or_else(|| self.unsupported())?;
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.call(helper, vec![left.value, right.value]);
                self.push(result);
                self.release(left);
                self.release(right);
            }

            // ===== Returns =====
            ReturnValue => {
                let value = self.pop()?;
                if !value.owned {
                    return Err(self.unmaterialized());
                }
                if self.height != 0 {
                    return Err(EmitError::ReturnWithStack { vpc, height: self.height });
                }
                self.leave(FrameState::Returned, value.value);
                return Ok(Flow::Closed);
            }

            // ===== Calls =====
            CallFunction | CallMethod => {
                let (helper, extra) = if opcode == CallFunction {
                    (Helper::CallFunction, 1)
                } else {
                    (Helper::CallMethod, 2)
                };
                let args = self.declare_shrink(oparg + extra)?;
                let argc = self.iconst(oparg as i64);
                let result = self.call(helper, vec![args, argc]);
                self.push(result);
                self.emit_eval_breaker_check(vpc + 1);
            }
            CallFunctionKw => {
                let kwnames = self.pop()?;
                let args = self.declare_shrink(oparg + 1)?;
                let argc = self.iconst(oparg as i64);
                let result = self.call(Helper::CallFunctionKw, vec![args, argc, kwnames.value]);
                self.push(result);
                self.release(kwnames);
                self.emit_eval_breaker_check(vpc + 1);
            }
            CallFunctionEx => {
                let kwargs = if oparg & 1 != 0 { Some(self.pop()?) } else { None };
                let args = self.pop()?;
                let callable = self.pop()?;
                let kwargs_value = self.optional_operand(kwargs);
                let result = self.call(Helper::CallFunctionEx, vec![callable.value, args.value, kwargs_value]);
                self.push(result);
                if let Some(kwargs) = kwargs {
                    self.release(kwargs);
                }
                self.release(args);
                self.release(callable);
                self.emit_eval_breaker_check(vpc + 1);
            }
            MakeFunction => {
                let qualname = self.pop()?;
                let code = self.pop()?;
                let extra = self.declare_shrink((oparg & 0xF).count_ones())?;
                let flags = self.iconst(oparg as i64);
                let func = self.call(Helper::MakeFunction, vec![code.value, self.frame, qualname.value, extra, flags]);
                self.push(func);
                self.release(code);
                self.release(qualname);
            }
            LoadBuildClass => {
                let value = self.call(Helper::LoadBuildClass, vec![self.frame]);
                self.push(value);
            }

            // ===== Imports =====
            ImportName => {
                let name = self.load_name(oparg);
                let fromlist = self.pop()?;
                let level = self.pop()?;
                let module = self.call(Helper::ImportName, vec![self.frame, name, fromlist.value, level.value]);
                self.push(module);
                self.release(level);
                self.release(fromlist);
            }
            ImportFrom => {
                let from = self.fetch(1)?;
                let name = self.load_name(oparg);
                let value = self.call(Helper::ImportFrom, vec![from, name]);
                self.push(value);
            }
            ImportStar => {
                let from = self.pop()?;
                self.call(Helper::ImportStar, vec![self.frame, from.value]);
                self.release(from);
            }

            // ===== Jumps =====
            JumpForward => {
                let target = self.branch_of(block)?;
                self.terminate(Terminator::Jump(self.block_entry(target)));
                return Ok(Flow::Closed);
            }
            JumpAbsolute => {
                let target = self.branch_of(block)?;
                let target_begin = self.analysis.graph.block(target).begin;
                if target_begin <= block.begin {
                    self.declare_handler(target);
                }
                self.emit_eval_breaker_check(target_begin);
                self.terminate(Terminator::Jump(self.block_entry(target)));
                return Ok(Flow::Closed);
            }
            PopJumpIfFalse | PopJumpIfTrue => {
                let target = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                let target_begin = self.analysis.graph.block(target).begin;
                if target_begin <= block.begin {
                    self.declare_handler(target);
                }
                let cond = self.pop()?;
                let pre_branch = self.new_block("pre_branch");
                let pre_fall = if cond.owned { self.new_block("pre_fall") } else { self.block_entry(fall) };
                self.emit_truth_branch(cond.value, opcode == PopJumpIfTrue, pre_branch, pre_fall);

                if cond.owned {
                    self.switch_to(pre_fall);
                    self.decref(cond.value, false);
                    self.terminate(Terminator::Jump(self.block_entry(fall)));
                }
                self.switch_to(pre_branch);
                self.release(cond);
                self.emit_eval_breaker_check(target_begin);
                self.terminate(Terminator::Jump(self.block_entry(target)));
                return Ok(Flow::Closed);
            }
            JumpIfFalseOrPop | JumpIfTrueOrPop => {
                let target = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                let cond = self.pop()?;
                if !cond.owned {
                    return Err(self.unmaterialized());
                }
                let pre_fall = self.new_block("pre_fall");
                let branch_entry = self.block_entry(target);
                self.emit_truth_branch(cond.value, opcode == JumpIfTrueOrPop, branch_entry, pre_fall);
                self.switch_to(pre_fall);
                self.decref(cond.value, false);
                self.terminate(Terminator::Jump(self.block_entry(fall)));
                return Ok(Flow::Closed);
            }

            // ===== Iteration =====
            GetIter => {
                let iterable = self.pop()?;
                let iter = self.call(Helper::GetIter, vec![iterable.value]);
                self.release(iterable);
                self.push(iter);
            }
            ForIter => {
                let target = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                self.require_materialized(1)?;
                let iter = self.fetch(1)?;
                let ty = self.load_field(iter, Field::ObType);
                let iternext = self.load_field(ty, Field::TypeIternext);
                let next = self.word();
                self.push_op(IrOp::CallIndirect { dest: next, callee: iternext, args: vec![iter] });
                self.push(next);

                let zero = self.iconst(0);
                let exhausted = self.icmp(Cond::Eq, next, zero);
                let on_exhausted = self.new_block("for_iter.exhausted");
                self.terminate(Terminator::Branch {
                    cond: exhausted,
                    then_block: on_exhausted,
                    else_block: self.block_entry(fall),
                    unlikely: true,
                });
                self.switch_to(on_exhausted);
                self.call(Helper::ForIter, vec![iter]);
                self.terminate(Terminator::Jump(self.block_entry(target)));
                return Ok(Flow::Closed);
            }

            // ===== Collections =====
            BuildString | BuildTuple | BuildList | BuildSet | BuildMap | BuildConstKeyMap => {
                let helper = Helper::for_build(opcode).ok_or_else(|| self.unsupported())?;
                let popped = match opcode {
                    BuildMap => 2 * oparg,
                    BuildConstKeyMap => oparg + 1,
                    _ => oparg,
                };
                let values = self.declare_shrink(popped)?;
                let count = self.iconst(oparg as i64);
                let result = self.call(helper, vec![values, count]);
                self.push(result);
            }
            ListAppend | SetAdd | ListExtend | SetUpdate | DictUpdate => {
                let helper = match opcode {
                    ListAppend => Helper::ListAppend,
                    SetAdd => Helper::SetAdd,
                    ListExtend => Helper::ListExtend,
                    SetUpdate => Helper::SetUpdate,
                    _ => Helper::DictUpdate,
                };
                let value = self.pop()?;
                let target = self.fetch(oparg)?;
                self.call(helper, vec![target, value.value]);
                self.release(value);
            }
            MapAdd => {
                let value = self.pop()?;
                let key = self.pop()?;
                let map = self.fetch(oparg)?;
                self.call(Helper::MapAdd, vec![map, key.value, value.value]);
                self.release(key);
                self.release(value);
            }
            DictMerge => {
                let update = self.pop()?;
                let dict = self.fetch(oparg)?;
                let callee = self.fetch(oparg + 2)?;
                self.call(Helper::DictMerge, vec![callee, dict, update.value]);
                self.release(update);
            }
            ListToTuple => {
                let list = self.pop()?;
                let tuple = self.call(Helper::ListToTuple, vec![list.value]);
                self.push(tuple);
                self.release(list);
            }
            FormatValue => {
                let spec = if oparg & FVS_MASK == FVS_HAVE_SPEC { Some(self.pop()?) } else { None };
                let value = self.pop()?;
                let spec_value = self.optional_operand(spec);
                let conversion = self.iconst((oparg & FVC_MASK) as i64);
                let result = self.call(Helper::FormatValue, vec![value.value, spec_value, conversion]);
                self.push(result);
                if let Some(spec) = spec {
                    self.release(spec);
                }
                self.release(value);
            }
            BuildSlice => {
                let step = if oparg == 3 { Some(self.pop()?) } else { None };
                let stop = self.pop()?;
                let start = self.pop()?;
                let step_value = self.optional_operand(step);
                let slice = self.call(Helper::BuildSlice, vec![start.value, stop.value, step_value]);
                self.push(slice);
                self.release(start);
                self.release(stop);
                if let Some(step) = step {
                    self.release(step);
                }
            }
            UnpackSequence => {
                let seq = self.pop()?;
                let count = self.iconst(oparg as i64);
                let dest = self.stack_slot();
                self.call(Helper::UnpackSequence, vec![seq.value, count, dest]);
                self.release(seq);
                self.declare_growth(oparg);
            }
            UnpackEx => {
                let before = oparg & 0xFF;
                let after = oparg >> 8;
                let seq = self.pop()?;
                let before_value = self.iconst(before as i64);
                let after_value = self.iconst(after as i64);
                let dest = self.stack_slot();
                self.call(Helper::UnpackEx, vec![seq.value, before_value, after_value, dest]);
                self.release(seq);
                self.declare_growth(before + 1 + after);
            }

            // ===== Miscellaneous =====
            LoadAssertionError => {
                let var = self.symbol(DataSymbol::AssertionError);
                let ty = self.load_field(var, Field::Pointee);
                self.push(ty);
                self.incref(ty);
            }
            SetupAnnotations => {
                self.call(Helper::SetupAnnotations, vec![self.frame]);
            }
            PrintExpr => {
                let value = self.pop()?;
                self.call(Helper::PrintExpr, vec![value.value]);
                self.release(value);
            }

            // ===== Pattern matching =====
            GetLen => {
                let subject = self.fetch(1)?;
                let len = self.call(Helper::GetLen, vec![subject]);
                self.push(len);
            }
            MatchMapping | MatchSequence => {
                let bit = if opcode == MatchMapping { TPFLAGS_MAPPING } else { TPFLAGS_SEQUENCE };
                let subject = self.fetch(1)?;
                let ty = self.load_field(subject, Field::ObType);
                let flags = self.load_field(ty, Field::TypeFlags);
                let mask = self.iconst(bit);
                let masked = self.word();
                self.push_op(IrOp::Band { dest: masked, lhs: flags, rhs: mask });
                let zero = self.iconst(0);
                let matched = self.icmp(Cond::Ne, masked, zero);
                let (if_true, if_false) = self.bool_pair(true);
                let result = self.select(matched, if_true, if_false);
                self.push(result);
                self.incref(result);
            }
            MatchKeys => {
                self.require_materialized(2)?;
                let slot = self.stack_slot();
                self.call(Helper::MatchKeys, vec![slot]);
                self.declare_growth(2);
            }
            MatchClass => {
                let kwargs = self.pop()?;
                let io = self.declare_shrink(2)?;
                let count = self.iconst(oparg as i64);
                self.call(Helper::MatchClass, vec![count, kwargs.value, io]);
                self.declare_growth(2);
                self.release(kwargs);
            }
            CopyDictWithoutKeys => {
                let keys = self.pop()?;
                let subject = self.fetch(1)?;
                let rest = self.call(Helper::CopyDictWithoutKeys, vec![subject, keys.value]);
                self.push(rest);
                self.release(keys);
            }

            // ===== Protected regions =====
            SetupFinally => {
                let handler = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                self.declare_handler(handler);
                self.emit_block_setup(handler, self.height);
                self.terminate(Terminator::Jump(self.block_entry(fall)));
                return Ok(Flow::Closed);
            }
            SetupWith => {
                let handler = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                self.require_materialized(1)?;
                self.declare_handler(handler);
                let target = self.iconst(self.analysis.graph.block(handler).begin as i64);
                let level = self.iconst(self.height as i64);
                self.call(Helper::SetupWith, vec![self.frame, target, level]);
                self.declare_growth(1);
                self.terminate(Terminator::Jump(self.block_entry(fall)));
                return Ok(Flow::Closed);
            }
            SetupAsyncWith => {
                let handler = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                self.require_materialized(1)?;
                self.declare_handler(handler);
                self.emit_block_setup(handler, self.height - 1);
                self.terminate(Terminator::Jump(self.block_entry(fall)));
                return Ok(Flow::Closed);
            }
            PopBlock => {
                self.call_void(Helper::BlockPop, vec![self.frame]);
            }
            PopExcept => {
                let io = self.declare_shrink(3)?;
                self.call_void(Helper::PopExcept, vec![self.frame, io]);
            }
            JumpIfNotExcMatch => {
                let target = self.branch_of(block)?;
                let fall = self.fall_of(block)?;
                let right = self.pop()?;
                let left = self.pop()?;
                let matched = self.call(Helper::JumpIfNotExcMatch, vec![left.value, right.value]);
                self.release(left);
                self.release(right);
                let zero = self.iconst(0);
                let is_match = self.icmp(Cond::Ne, matched, zero);
                self.terminate(Terminator::Branch {
                    cond: is_match,
                    then_block: self.block_entry(fall),
                    else_block: self.block_entry(target),
                    unlikely: false,
                });
                return Ok(Flow::Closed);
            }
            Reraise => {
                let restore = self.iconst(oparg as i64);
                let level = self.iconst(self.height as i64);
                self.call_void(Helper::Reraise, vec![restore, level]);
                return Ok(Flow::Closed);
            }
            RaiseVarargs => {
                self.require_materialized(oparg)?;
                let argc = self.iconst(oparg as i64);
                let level = self.iconst(self.height as i64);
                self.call_void(Helper::RaiseVarargs, vec![argc, level]);
                return Ok(Flow::Closed);
            }
            WithExceptStart => {
                let slot = self.stack_slot();
                let result = self.call(Helper::WithExceptStart, vec![slot]);
                self.push(result);
            }

            // ===== Generators and coroutines =====
            GenStart => {
                let sentinel = self.pop()?;
                self.release(sentinel);
            }
            YieldValue => {
                let value = self.pop()?;
                if !value.owned {
                    return Err(self.unmaterialized());
                }
                let yielded = if self.unit.flags.intersects(CodeFlags::ASYNC_GENERATOR) {
                    self.call(Helper::YieldValue, vec![value.value])
                } else {
                    value.value
                };
                self.leave(FrameState::Suspended, yielded);
                self.declare_growth(1);
                if let Some(fall) = block.fall {
                    self.declare_handler(fall);
                }
                return Ok(Flow::Closed);
            }
            YieldFrom => {
                let io = self.declare_shrink(2)?;
                let status = self.call(Helper::YieldFrom, vec![io]);
                self.declare_growth(1);

                let zero = self.iconst(0);
                let finished = self.icmp(Cond::Eq, status, zero);
                let on_finished = self.new_block("yield_from.done");
                let on_yield = self.new_block("yield_from.suspend");
                self.terminate(Terminator::Branch {
                    cond: finished,
                    then_block: on_finished,
                    else_block: on_yield,
                    unlikely: false,
                });

                // Re-entry resumes at this instruction, one past lasti
                self.switch_to(on_yield);
                self.declare_handler(block.id);
                self.push_op(IrOp::SetLasti { vpc: vpc as i32 - 1 });
                let yielded = self.load_stack(self.height);
                self.leave(FrameState::Suspended, yielded);

                self.switch_to(on_finished);
            }
            GetYieldFromIter => {
                let iterable = self.pop()?;
                let is_coroutine = self
                    .unit
                    .flags
                    .intersects(CodeFlags::COROUTINE | CodeFlags::ITERABLE_COROUTINE);
                let flag = self.iconst(is_coroutine as i64);
                let iter = self.call(Helper::GetYieldFromIter, vec![iterable.value, flag]);
                self.release(iterable);
                self.push(iter);
            }
            GetAwaitable => {
                let iterable = self.pop()?;
                let prev = if vpc >= 1 { self.instrs[vpc - 1].opcode.to_u8() } else { 0 };
                let prev_prev = if vpc >= 2 { self.instrs[vpc - 2].opcode.to_u8() } else { 0 };
                let prev_prev_value = self.iconst(prev_prev as i64);
                let prev_value = self.iconst(prev as i64);
                let awaitable = self.call(Helper::GetAwaitable, vec![iterable.value, prev_prev_value, prev_value]);
                self.release(iterable);
                self.push(awaitable);
            }
            GetAiter => {
                let obj = self.pop()?;
                let iter = self.call(Helper::GetAiter, vec![obj.value]);
                self.release(obj);
                self.push(iter);
            }
            GetAnext => {
                let aiter = self.fetch(1)?;
                let awaitable = self.call(Helper::GetAnext, vec![aiter]);
                self.push(awaitable);
            }
            EndAsyncFor => {
                let level = self.iconst(self.height as i64);
                self.call(Helper::EndAsyncFor, vec![level]);
                self.declare_shrink(7)?;
            }
            BeforeAsyncWith => {
                self.require_materialized(1)?;
                let slot = self.stack_slot();
                self.call(Helper::BeforeAsyncWith, vec![slot]);
                self.declare_growth(1);
            }

            _ => return Err(self.unsupported()),
        }
        Ok(Flow::Continue)
    }

    // ========================================================================
    // Instruction groups
    // ========================================================================

    fn emit_load_fast(&mut self, vpc: usize, slot: u32) {
        let forward = self.forwarding(vpc);
        let check = self.needs_init_check(slot);
        if check || !forward {
            let value = self.load_local(slot);
            if check {
                self.check_unbound(value);
            }
            if !forward {
                self.push(value);
                self.incref(value);
            }
        }
        if forward {
            self.stack.push(StackValue::FromLocal(slot));
        }
        self.defined.set(slot as usize);
    }

    fn emit_store_fast(&mut self, slot: u32) -> Result<(), EmitError> {
        let old = self.load_local(slot);
        let value = self.pop()?;
        if !value.owned {
            self.incref(value.value);
        }
        self.push_op(IrOp::StoreLocal { slot, value: value.value });
        let maybe_unbound = self.needs_init_check(slot);
        self.decref(old, maybe_unbound);
        self.defined.set(slot as usize);
        Ok(())
    }

    /// Move the top of stack down to depth `n`
    fn emit_rot_n(&mut self, n: u32) -> Result<(), EmitError> {
        let n = n as usize;
        if n < 2 {
            return Ok(());
        }
        let len = self.stack.len();
        if len < n {
            return Err(self.underflow());
        }

        let top = self.stack[len - 1];
        let top_materialized = matches!(top, StackValue::OnStack(_));
        let mut lifted = 0u32;
        for i in 1..n {
            let below = self.stack[len - i - 1];
            self.stack[len - i] = match below {
                StackValue::OnStack(index) if top_materialized => {
                    lifted += 1;
                    StackValue::OnStack(index + 1)
                }
                other => other,
            };
        }
        self.stack[len - n] = match top {
            StackValue::OnStack(index) => StackValue::OnStack(index - lifted),
            other => other,
        };

        if lifted == 0 {
            return Ok(());
        }
        if lifted <= MAX_INLINE_LIFT {
            let mut dest = self.height - 1;
            let top_value = self.load_stack(dest);
            for i in 0..lifted {
                let src = self.height - 2 - i;
                let value = self.load_stack(src);
                self.push_op(IrOp::StoreStack { index: dest, value });
                dest = src;
            }
            self.push_op(IrOp::StoreStack { index: dest, value: top_value });
        } else {
            let base = self.stack_addr(self.height - lifted - 1);
            let count = self.iconst(lifted as i64);
            self.call_void(Helper::RotN, vec![base, count]);
        }
        Ok(())
    }

    /// Duplicate the top `n` values; forwarded values only copy their tag
    fn emit_dup(&mut self, n: usize) -> Result<(), EmitError> {
        let len = self.stack.len();
        if len < n {
            return Err(self.underflow());
        }
        for i in 0..n {
            match self.stack[len - n + i] {
                StackValue::OnStack(index) => {
                    let value = self.load_stack(index);
                    self.incref(value);
                    self.push(value);
                }
                other => self.stack.push(other),
            }
        }
        Ok(())
    }

    /// Branch on the truthiness of `value`: identity with the two boolean
    /// singletons first, the generic truth test only for anything else
    fn emit_truth_branch(&mut self, value: Value, jump_if_true: bool, branch: IrBlockId, fall: IrBlockId) {
        let (on_true, on_false) = if jump_if_true { (branch, fall) } else { (fall, branch) };

        let true_obj = self.symbol(DataSymbol::True);
        let is_true = self.icmp(Cond::Eq, value, true_obj);
        let not_true = self.new_block("truth.not_true");
        self.terminate(Terminator::Branch { cond: is_true, then_block: on_true, else_block: not_true, unlikely: false });

        self.switch_to(not_true);
        let false_obj = self.symbol(DataSymbol::False);
        let not_false = self.icmp(Cond::Ne, value, false_obj);
        let slow = self.new_block("truth.slow");
        self.terminate(Terminator::Branch { cond: not_false, then_block: slow, else_block: on_false, unlikely: true });

        self.switch_to(slow);
        let truth = self.call(Helper::TruthValue, vec![value]);
        let zero = self.iconst(0);
        let truthy = self.icmp(Cond::Ne, truth, zero);
        self.terminate(Terminator::Branch { cond: truthy, then_block: on_true, else_block: on_false, unlikely: false });
    }

    /// Poll the pending-work flag when the next instruction is one the host
    /// expects to observe interrupts at
    fn emit_eval_breaker_check(&mut self, next_vpc: usize) {
        let Some(next) = self.instrs.get(next_vpc) else {
            return;
        };
        if !matches!(
            next.opcode,
            Opcode::SetupFinally | Opcode::SetupWith | Opcode::BeforeAsyncWith | Opcode::YieldFrom
        ) {
            return;
        }

        let flag = self.word();
        self.push_op(IrOp::LoadEvalBreaker { dest: flag });
        let zero = self.iconst(0);
        let pending = self.icmp(Cond::Ne, flag, zero);
        let slow = self.new_block("eval_breaker");
        let resume = self.new_block("eval_breaker.resume");
        self.terminate(Terminator::Branch { cond: pending, then_block: slow, else_block: resume, unlikely: true });

        self.switch_to(slow);
        self.push_op(IrOp::SetLasti { vpc: next_vpc as i32 });
        self.call(Helper::HandleEvalBreaker, vec![]);
        self.terminate(Terminator::Jump(resume));
        self.switch_to(resume);
    }

    fn emit_block_setup(&mut self, handler: BlockId, level: u32) {
        let kind = self.iconst(Opcode::SetupFinally.to_u8() as i64);
        let target = self.iconst(self.analysis.graph.block(handler).begin as i64);
        let level = self.iconst(level as i64);
        self.call_void(Helper::BlockSetup, vec![self.frame, kind, target, level]);
    }

    /// Record frame state and stack depth, then leave with `value`
    fn leave(&mut self, state: FrameState, value: Value) {
        self.push_op(IrOp::SetFrameState { state, stack_depth: self.height });
        self.terminate(Terminator::Return(value));
    }

    // ========================================================================
    // Abstract stack
    // ========================================================================

    fn pop(&mut self) -> Result<Popped, EmitError> {
        let top = self.stack.pop().ok_or_else(|| self.underflow())?;
        let owned = matches!(top, StackValue::OnStack(_));
        if owned {
            self.height -= 1;
        }
        let value = self.materialize(top);
        Ok(Popped { value, owned })
    }

    fn push(&mut self, value: Value) {
        self.push_op(IrOp::StoreStack { index: self.height, value });
        self.stack.push(StackValue::OnStack(self.height));
        self.height += 1;
    }

    /// Read the value `depth` entries below the top (1 is the top)
    fn fetch(&mut self, depth: u32) -> Result<Value, EmitError> {
        let idx = self
            .stack
            .len()
            .checked_sub(depth as usize)
            .ok_or_else(|| self.underflow())?;
        let entry = self.stack[idx];
        Ok(self.materialize(entry))
    }

    fn materialize(&mut self, entry: StackValue) -> Value {
        match entry {
            StackValue::OnStack(index) => self.load_stack(index),
            StackValue::FromLocal(slot) => self.load_local(slot),
            StackValue::FromConst(index) => self.load_const(index),
        }
    }

    /// Drop `n` materialized entries and return the address of the lowest
    fn declare_shrink(&mut self, n: u32) -> Result<Value, EmitError> {
        self.require_materialized(n)?;
        self.stack.truncate(self.stack.len() - n as usize);
        self.height -= n;
        Ok(self.stack_addr(self.height))
    }

    /// Account for `n` values a helper wrote above the top
    fn declare_growth(&mut self, n: u32) {
        for _ in 0..n {
            self.stack.push(StackValue::OnStack(self.height));
            self.height += 1;
        }
    }

    fn require_materialized(&self, n: u32) -> Result<(), EmitError> {
        let n = n as usize;
        if self.stack.len() < n {
            return Err(self.underflow());
        }
        if self.stack[self.stack.len() - n..]
            .iter()
            .any(|e| !matches!(e, StackValue::OnStack(_)))
        {
            return Err(self.unmaterialized());
        }
        Ok(())
    }

    /// Address one past the materialized top
    fn stack_slot(&mut self) -> Value {
        self.stack_addr(self.height)
    }

    fn release(&mut self, popped: Popped) {
        if popped.owned {
            self.decref(popped.value, false);
        }
    }

    fn optional_operand(&mut self, operand: Option<Popped>) -> Value {
        match operand {
            Some(p) => p.value,
            None => self.iconst(0),
        }
    }

    // ========================================================================
    // Analysis queries
    // ========================================================================

    fn forwarding(&self, vpc: usize) -> bool {
        self.options.forward_loads && self.analysis.redundant_loads.get(vpc)
    }

    fn needs_init_check(&self, slot: u32) -> bool {
        !(self.options.elide_init_checks && self.defined.get(slot as usize))
    }

    fn declare_handler(&mut self, block: BlockId) {
        self.is_handler[block.index()] = true;
    }

    fn block_entry(&self, block: BlockId) -> IrBlockId {
        self.block_entries[block.index()]
    }

    fn branch_of(&self, block: &Block) -> Result<BlockId, EmitError> {
        block
            .branch
            .ok_or(EmitError::MissingEdge { vpc: self.vpc, opcode: self.opcode, edge: "branch" })
    }

    fn fall_of(&self, block: &Block) -> Result<BlockId, EmitError> {
        block
            .fall
            .ok_or(EmitError::MissingEdge { vpc: self.vpc, opcode: self.opcode, edge: "fall" })
    }

    fn underflow(&self) -> EmitError {
        EmitError::StackUnderflow { vpc: self.vpc, opcode: self.opcode }
    }

    fn unmaterialized(&self) -> EmitError {
        EmitError::UnmaterializedOperand { vpc: self.vpc, opcode: self.opcode }
    }

    fn unsupported(&self) -> EmitError {
        EmitError::Unsupported { vpc: self.vpc, opcode: self.opcode }
    }

    // ========================================================================
    // IR construction
    // ========================================================================

    fn push_op(&mut self, op: IrOp) {
        self.func.block_mut(self.current).ops.push(op);
    }

    fn terminate(&mut self, terminator: Terminator) {
        let block = self.func.block_mut(self.current);
        debug_assert!(matches!(block.terminator, Terminator::None), "{} terminated twice", block.id);
        block.terminator = terminator;
    }

    fn new_block(&mut self, label: &str) -> IrBlockId {
        self.func.add_block(format!("{}@{}", label, self.vpc))
    }

    fn switch_to(&mut self, block: IrBlockId) {
        self.current = block;
    }

    fn word(&mut self) -> Value {
        self.func.alloc_value(ValueKind::Word)
    }

    fn iconst(&mut self, value: i64) -> Value {
        let dest = self.word();
        self.push_op(IrOp::Iconst { dest, value });
        dest
    }

    fn symbol(&mut self, symbol: DataSymbol) -> Value {
        let dest = self.word();
        self.push_op(IrOp::LoadSymbol { dest, symbol });
        dest
    }

    /// `(True, False)` when `direct`, swapped otherwise
    fn bool_pair(&mut self, direct: bool) -> (Value, Value) {
        let t = self.symbol(DataSymbol::True);
        let f = self.symbol(DataSymbol::False);
        if direct { (t, f) } else { (f, t) }
    }

    fn load_local(&mut self, slot: u32) -> Value {
        let dest = self.word();
        self.push_op(IrOp::LoadLocal { dest, slot });
        dest
    }

    fn load_cell(&mut self, index: u32) -> Value {
        self.load_local(self.unit.nlocals + index)
    }

    fn load_stack(&mut self, index: u32) -> Value {
        let dest = self.word();
        self.push_op(IrOp::LoadStack { dest, index });
        dest
    }

    fn stack_addr(&mut self, index: u32) -> Value {
        let dest = self.word();
        self.push_op(IrOp::StackAddr { dest, index });
        dest
    }

    fn load_const(&mut self, index: u32) -> Value {
        let dest = self.word();
        self.push_op(IrOp::LoadConst { dest, index });
        dest
    }

    fn load_name(&mut self, index: u32) -> Value {
        let dest = self.word();
        self.push_op(IrOp::LoadName { dest, index });
        dest
    }

    fn load_field(&mut self, base: Value, field: Field) -> Value {
        let dest = self.word();
        self.push_op(IrOp::LoadField { dest, base, field });
        dest
    }

    fn opcache_entry(&mut self) -> Value {
        let dest = self.word();
        self.push_op(IrOp::OpcacheAddr { dest, index: self.opcache_count });
        self.opcache_count += 1;
        dest
    }

    fn icmp(&mut self, cond: Cond, lhs: Value, rhs: Value) -> Value {
        let dest = self.func.alloc_value(ValueKind::Flag);
        self.push_op(IrOp::ICmp { dest, cond, lhs, rhs });
        dest
    }

    fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let dest = self.word();
        self.push_op(IrOp::Select { dest, cond, if_true, if_false });
        dest
    }

    fn incref(&mut self, value: Value) {
        self.push_op(IrOp::IncRef { value });
    }

    fn decref(&mut self, value: Value, null_check: bool) {
        self.push_op(IrOp::DecRef { value, null_check });
    }

    /// Branch to the unbound-local error path when `value` is null
    fn check_unbound(&mut self, value: Value) {
        let zero = self.iconst(0);
        let is_null = self.icmp(Cond::Eq, value, zero);
        let bound = self.new_block("bound");
        self.terminate(Terminator::Branch { cond: is_null, then_block: self.unbound, else_block: bound, unlikely: true });
        self.switch_to(bound);
    }

    /// Call a helper that returns a new reference or a status and branch to
    /// unwind on failure
    fn call(&mut self, helper: Helper, args: Vec<Value>) -> Value {
        debug_assert_eq!(args.len(), helper.arity(), "{}", helper);
        let failure = helper.failure();
        debug_assert!(failure.has_result(), "{} returns nothing", helper);

        let result = self.word();
        self.push_op(IrOp::Call { dest: Some(result), helper, args });
        let zero = self.iconst(0);
        let failed = match failure {
            Failure::NullObject => self.icmp(Cond::Eq, result, zero),
            _ => self.icmp(Cond::Slt, result, zero),
        };
        let ok = self.new_block("ok");
        self.terminate(Terminator::Branch { cond: failed, then_block: self.unwind, else_block: ok, unlikely: true });
        self.switch_to(ok);
        result
    }

    /// Call a helper without a result; one that always raises closes the
    /// current block with a jump to unwind
    fn call_void(&mut self, helper: Helper, args: Vec<Value>) {
        debug_assert_eq!(args.len(), helper.arity(), "{}", helper);
        let failure = helper.failure();
        debug_assert!(!failure.has_result(), "{} result dropped", helper);

        self.push_op(IrOp::Call { dest: None, helper, args });
        if failure == Failure::Always {
            self.terminate(Terminator::Jump(self.unwind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode;
    use crate::jit::analysis::analyze;

    fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
        code.push(op.to_u8());
        code.push(arg);
    }

    fn lower(unit: &CodeUnit, options: EmitOptions) -> Result<EmitOutput, EmitError> {
        let instrs = decode(&unit.code).unwrap();
        let analysis = analyze(unit, &instrs).unwrap();
        CodeEmitter::new(unit, &instrs, &analysis, options).emit()
    }

    fn count(out: &EmitOutput, pred: impl Fn(&IrOp) -> bool) -> usize {
        out.function.ops().filter(|op| pred(op)).count()
    }

    fn calls(out: &EmitOutput, helper: Helper) -> usize {
        count(out, |op| matches!(op, IrOp::Call { helper: h, .. } if *h == helper))
    }

    /// Number of branches into the shared unbound-local block
    fn unbound_guards(out: &EmitOutput) -> usize {
        let unbound = out
            .function
            .blocks
            .iter()
            .find(|b| b.label == "unbound")
            .map(|b| b.id)
            .unwrap();
        out.function
            .blocks
            .iter()
            .filter(|b| matches!(b.terminator, Terminator::Branch { then_block, .. } if then_block == unbound))
            .count()
    }

    #[test]
    fn test_return_constant() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 1);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(count(&out, |op| matches!(op, IrOp::IncRef { .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::LoadConst { index: 0, .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::StoreStack { .. })), 1);
        assert_eq!(
            count(&out, |op| matches!(op, IrOp::SetFrameState { state: FrameState::Returned, stack_depth: 0 })),
            1
        );
        assert_eq!(out.stack_heights, vec![0, 1]);
        assert!(out.handlers.is_empty());
        assert_eq!(out.opcache_num, 0);
    }

    #[test]
    fn test_store_forwards_local() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0);
        emit(&mut code, Opcode::StoreFast, 1);
        emit(&mut code, Opcode::LoadFast, 1);
        emit(&mut code, Opcode::ReturnValue, 0);
        let mut unit = CodeUnit::new("f", code, 2, 1);
        unit.argcount = 1;

        let out = lower(&unit, EmitOptions::default()).unwrap();
        // Only the returned value ever reaches a stack slot
        assert_eq!(count(&out, |op| matches!(op, IrOp::StoreStack { .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::StoreLocal { slot: 1, .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::DecRef { null_check: true, .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::IncRef { .. })), 2);
        assert_eq!(unbound_guards(&out), 0);
        assert_eq!(out.stack_heights, vec![0, 0, 0, 1]);

        let plain = lower(&unit, EmitOptions { forward_loads: false, elide_init_checks: true }).unwrap();
        assert_eq!(count(&plain, |op| matches!(op, IrOp::StoreStack { .. })), 2);
        assert_eq!(plain.stack_heights, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_unbound_guard_for_unbound_local() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 1, 1);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(unbound_guards(&out), 1);
        assert_eq!(calls(&out, Helper::RaiseUnboundLocal), 1);
    }

    #[test]
    fn test_all_arguments_bound_no_guards() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0);
        emit(&mut code, Opcode::LoadFast, 1);
        emit(&mut code, Opcode::BinaryAdd, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let mut unit = CodeUnit::new("add", code, 2, 2);
        unit.argcount = 2;

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(unbound_guards(&out), 0);
        assert_eq!(calls(&out, Helper::BinaryAdd), 1);
        // Both operands are forwarded, so nothing is released after the add
        assert_eq!(count(&out, |op| matches!(op, IrOp::DecRef { .. })), 0);

        let checked = lower(&unit, EmitOptions { forward_loads: true, elide_init_checks: false }).unwrap();
        assert_eq!(unbound_guards(&checked), 2);
    }

    #[test]
    fn test_eval_breaker_before_setup_finally() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadGlobal, 0); // 0
        emit(&mut code, Opcode::CallFunction, 0); // 1
        emit(&mut code, Opcode::SetupFinally, 4); // 2 -> 7
        emit(&mut code, Opcode::PopTop, 0); // 3
        emit(&mut code, Opcode::PopBlock, 0); // 4
        emit(&mut code, Opcode::LoadConst, 0); // 5
        emit(&mut code, Opcode::ReturnValue, 0); // 6
        emit(&mut code, Opcode::Reraise, 0); // 7
        let unit = CodeUnit::new("f", code, 0, 8);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(count(&out, |op| matches!(op, IrOp::LoadEvalBreaker { .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::SetLasti { vpc: 2 })), 2);
        assert_eq!(calls(&out, Helper::HandleEvalBreaker), 1);
        assert_eq!(calls(&out, Helper::BlockSetup), 1);
        assert_eq!(out.opcache_num, 1);
        assert_eq!(out.handlers.len(), 1);
        assert_eq!(out.handlers[0].vpc, 7);
        assert_eq!(out.stack_heights[7], 7);

        let entry = out.function.block(out.function.entry);
        match &entry.terminator {
            Terminator::Dispatch { targets, .. } => assert_eq!(targets, &vec![out.handlers[0].block]),
            other => panic!("unexpected entry terminator: {}", other),
        }
    }

    #[test]
    fn test_no_eval_breaker_before_plain_instruction() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadGlobal, 0);
        emit(&mut code, Opcode::CallFunction, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 1);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(count(&out, |op| matches!(op, IrOp::LoadEvalBreaker { .. })), 0);
        assert_eq!(calls(&out, Helper::CallFunction), 1);
        assert_eq!(calls(&out, Helper::LoadGlobal), 1);
    }

    #[test]
    fn test_truthiness_branch() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::PopJumpIfFalse, 4); // 1
        emit(&mut code, Opcode::LoadConst, 0); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        emit(&mut code, Opcode::LoadConst, 1); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5
        let mut unit = CodeUnit::new("f", code, 1, 1);
        unit.argcount = 1;

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(count(&out, |op| matches!(op, IrOp::LoadSymbol { symbol: DataSymbol::True, .. })), 1);
        assert_eq!(count(&out, |op| matches!(op, IrOp::LoadSymbol { symbol: DataSymbol::False, .. })), 1);
        assert_eq!(calls(&out, Helper::TruthValue), 1);
        // Forward branch: no handler registered
        assert!(out.handlers.is_empty());
    }

    #[test]
    fn test_loop_header_is_handler() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::GetIter, 0); // 1
        emit(&mut code, Opcode::ForIter, 2); // 2 -> 5
        emit(&mut code, Opcode::StoreFast, 1); // 3
        emit(&mut code, Opcode::JumpAbsolute, 2); // 4
        emit(&mut code, Opcode::LoadConst, 0); // 5
        emit(&mut code, Opcode::ReturnValue, 0); // 6
        let mut unit = CodeUnit::new("f", code, 2, 2);
        unit.argcount = 1;

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(out.handlers.iter().map(|h| h.vpc).collect::<Vec<_>>(), vec![2]);
        assert_eq!(out.stack_heights, vec![0, 0, 1, 2, 1, 0, 1]);
        assert_eq!(count(&out, |op| matches!(op, IrOp::CallIndirect { .. })), 1);
        assert_eq!(calls(&out, Helper::ForIter), 1);
    }

    #[test]
    fn test_unreachable_block_traps() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::JumpForward, 1); // 0 -> 2
        emit(&mut code, Opcode::Nop, 0); // 1
        emit(&mut code, Opcode::LoadConst, 0); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        let unit = CodeUnit::new("f", code, 0, 1);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        let dead = out.function.blocks.iter().find(|b| b.label == "B1").unwrap();
        assert!(matches!(dead.terminator, Terminator::Unreachable));
        assert!(dead.ops.is_empty());
    }

    #[test]
    fn test_return_with_leftover_stack_rejected() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::LoadConst, 1);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 2);

        assert!(matches!(
            lower(&unit, EmitOptions::default()),
            Err(EmitError::ReturnWithStack { vpc: 2, height: 1 })
        ));
    }

    #[test]
    fn test_generator_yield() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::GenStart, 0); // 0
        emit(&mut code, Opcode::LoadConst, 0); // 1
        emit(&mut code, Opcode::YieldValue, 0); // 2
        emit(&mut code, Opcode::PopTop, 0); // 3
        emit(&mut code, Opcode::LoadConst, 0); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5
        let mut unit = CodeUnit::new("gen", code, 0, 2);
        unit.flags = CodeFlags(CodeFlags::GENERATOR);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(out.handlers.iter().map(|h| h.vpc).collect::<Vec<_>>(), vec![3]);
        assert_eq!(out.stack_heights, vec![1, 0, 1, 1, 0, 1]);
        assert_eq!(
            count(&out, |op| matches!(op, IrOp::SetFrameState { state: FrameState::Suspended, stack_depth: 0 })),
            1
        );
        assert_eq!(calls(&out, Helper::YieldValue), 0);
    }

    #[test]
    fn test_rotation_of_forwarded_values_is_free() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0);
        emit(&mut code, Opcode::LoadFast, 1);
        emit(&mut code, Opcode::RotTwo, 0);
        emit(&mut code, Opcode::BinarySubtract, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let mut unit = CodeUnit::new("f", code, 2, 2);
        unit.argcount = 2;

        let out = lower(&unit, EmitOptions::default()).unwrap();
        assert_eq!(count(&out, |op| matches!(op, IrOp::StoreStack { .. })), 1);
        assert_eq!(calls(&out, Helper::RotN), 0);
    }

    #[test]
    fn test_rotation_of_materialized_values_inline() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadGlobal, 0);
        emit(&mut code, Opcode::LoadGlobal, 1);
        emit(&mut code, Opcode::RotTwo, 0);
        emit(&mut code, Opcode::BinarySubtract, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 2);

        let out = lower(&unit, EmitOptions::default()).unwrap();
        // Two pushes, two rotation stores, one result
        assert_eq!(count(&out, |op| matches!(op, IrOp::StoreStack { .. })), 5);
        assert_eq!(calls(&out, Helper::RotN), 0);
        assert_eq!(out.opcache_num, 2);
    }
}
