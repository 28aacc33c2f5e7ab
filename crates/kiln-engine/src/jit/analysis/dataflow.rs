//! Dataflow analysis over the block graph
//!
//! Four phases, run once per unit:
//!
//! - **A** walks every block backward with a [`ReversedStack`], marking
//!   loads whose value dies before anything could observe the real stack
//!   slot (redundant loads), recording which locals each block touches and
//!   whether the last touch was a write, and the block's net stack effect.
//! - **B** aggregates, per exception region, the locals deleted anywhere
//!   inside the protected blocks.
//! - **C** solves the live-in ("definitely bound") local sets with a
//!   worklist fixed point, routing try-setup edges through their region.
//! - **D** propagates initial stack heights breadth-first and checks that
//!   every join agrees.

use std::fmt;

use crate::bytecode::{folded_oparg, prefix_start, CodeUnit, Instruction, Opcode};
use crate::bytecode::opcode::{FVS_HAVE_SPEC, FVS_MASK};
use super::abstract_stack::ReversedStack;
use super::bitset::BitSet;
use super::blocks::{BlockGraph, BlockId, ExceptionRegion, RegionId};

/// Inconsistent input detected by the analysis
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Exception region {0} nesting depth reached zero during traversal")]
    RegionNestingUnderflow(u32),
    #[error("Block {block} reached with stack height {found}, previously {expected}")]
    InconsistentStackHeight { block: BlockId, expected: i32, found: i32 },
    #[error("Block {block} would start at stack height {height}, outside 0..={capacity}")]
    StackHeightOutOfRange { block: BlockId, height: i32, capacity: u32 },
    #[error("Instruction {vpc} references local {slot}, but the unit has {nlocals}")]
    LocalOutOfRange { vpc: usize, slot: u32, nlocals: usize },
}

/// Per-block results
#[derive(Debug, Clone)]
pub struct BlockFacts {
    /// Net stack height change from block entry to the tail instruction
    pub stack_effect: i32,
    /// Stack height on entry; `None` for blocks unreachable from the entry
    pub initial_stack_height: Option<i32>,
    /// Locals read, written or deleted in the block
    pub locals_touched: BitSet,
    /// Locals whose last touch in the block is a read or a write
    pub locals_set: BitSet,
    /// Locals deleted anywhere in the block
    pub locals_ever_deleted: BitSet,
    /// Locals guaranteed bound on entry
    pub locals_input: BitSet,
}

/// Everything the emitter needs from the analysis
#[derive(Debug, Clone)]
pub struct Analysis {
    /// The block graph; its transient regions have been moved to `regions`
    pub graph: BlockGraph,
    pub facts: Vec<BlockFacts>,
    /// Loads whose value can be forwarded from its origin
    pub redundant_loads: BitSet,
    /// Aggregated region summaries, kept for inspection only
    pub regions: Vec<ExceptionRegion>,
}

impl Analysis {
    pub fn facts(&self, id: BlockId) -> &BlockFacts {
        &self.facts[id.index()]
    }
}

/// Worklist state of a node during the fixed-point phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Queued,
    Done,
}

/// A node of the liveness graph: a block or an exception region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Block(BlockId),
    Region(RegionId),
}

/// Runs phases A through D over one unit
pub struct DataflowAnalyzer<'a> {
    unit: &'a CodeUnit,
    instrs: &'a [Instruction],
    graph: BlockGraph,
    facts: Vec<BlockFacts>,
    redundant_loads: BitSet,
    nlocals: usize,
}

impl<'a> DataflowAnalyzer<'a> {
    pub fn new(unit: &'a CodeUnit, instrs: &'a [Instruction], graph: BlockGraph) -> Self {
        let nlocals = unit.nlocals as usize;
        let facts = graph
            .blocks
            .iter()
            .map(|_| BlockFacts {
                stack_effect: 0,
                initial_stack_height: None,
                locals_touched: BitSet::new(nlocals),
                locals_set: BitSet::new(nlocals),
                locals_ever_deleted: BitSet::new(nlocals),
                locals_input: BitSet::full(nlocals),
            })
            .collect();
        DataflowAnalyzer {
            unit,
            instrs,
            redundant_loads: BitSet::new(instrs.len()),
            graph,
            facts,
            nlocals,
        }
    }

    pub fn run(mut self) -> Result<Analysis, AnalysisError> {
        self.intra_block_pass()?;
        self.aggregate_regions()?;
        self.solve_live_locals();
        let regions = std::mem::take(&mut self.graph.regions);
        self.solve_stack_heights()?;

        log::trace!(
            "dataflow: {} redundant loads over {} blocks",
            self.redundant_loads.count(),
            self.graph.blocks.len()
        );

        Ok(Analysis {
            graph: self.graph,
            facts: self.facts,
            redundant_loads: self.redundant_loads,
            regions,
        })
    }

    // ========================================================================
    // Phase A: backward simulation
    // ========================================================================

    fn intra_block_pass(&mut self) -> Result<(), AnalysisError> {
        // Blocks are visited last to first, so one initialization of the
        // per-local write timestamps serves the whole unit.
        let mut end_vpc = self.instrs.len() as u32;
        let mut local_timestamps = vec![end_vpc; self.nlocals];
        let mut stack = ReversedStack::new(self.unit.stacksize as usize);

        for idx in (0..self.graph.blocks.len()).rev() {
            stack.reset();
            let (begin, end) = (self.graph.blocks[idx].begin, self.graph.blocks[idx].end);
            let mut vpc = end;
            while vpc > begin {
                vpc -= 1;
                let at = vpc;
                vpc = prefix_start(self.instrs, at);
                stack.set_timestamp(vpc as u32);
                let opcode = self.instrs[at].opcode;
                let oparg = folded_oparg(self.instrs, at);
                self.simulate(idx, at, vpc as u32, opcode, oparg, end_vpc, &mut stack, &mut local_timestamps)?;
            }
            self.facts[idx].stack_effect = stack.height();
            end_vpc = begin as u32;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn simulate(
        &mut self,
        block: usize,
        at: usize,
        now: u32,
        opcode: Opcode,
        oparg: u32,
        end_vpc: u32,
        stack: &mut ReversedStack,
        local_timestamps: &mut [u32],
    ) -> Result<(), AnalysisError> {
        use Opcode::*;

        match opcode {
            Nop | SetupAnnotations | PopBlock | DeleteDeref | DeleteGlobal | DeleteName
            | JumpForward | JumpAbsolute | SetupFinally => {}
            RotTwo => stack.rot_n(2),
            RotThree => stack.rot_n(3),
            RotFour => stack.rot_n(4),
            RotN => stack.rot_n(oparg),
            DupTop => stack.dup_n(1),
            DupTopTwo => stack.dup_n(2),
            PopTop => stack.pop(),

            LoadConst => {
                let t = stack.push();
                self.redundant_loads.set_if(at, t < end_vpc);
            }
            LoadFast => {
                let slot = self.local_slot(at, oparg)?;
                let t = stack.push();
                self.redundant_loads.set_if(at, t < local_timestamps[slot]);
                let facts = &mut self.facts[block];
                let is_last_touch = facts.locals_touched.test_and_set(slot);
                facts.locals_set.set_if(slot, is_last_touch);
            }
            StoreFast => {
                let slot = self.local_slot(at, oparg)?;
                stack.pop();
                local_timestamps[slot] = now;
                let facts = &mut self.facts[block];
                let is_last_touch = facts.locals_touched.test_and_set(slot);
                facts.locals_set.set_if(slot, is_last_touch);
            }
            DeleteFast => {
                let slot = self.local_slot(at, oparg)?;
                local_timestamps[slot] = now;
                let facts = &mut self.facts[block];
                facts.locals_touched.set(slot);
                facts.locals_ever_deleted.set(slot);
            }

            LoadDeref | LoadClassderef | LoadGlobal | LoadName | LoadClosure | LoadBuildClass
            | LoadAssertionError => {
                stack.push();
            }
            StoreDeref | StoreGlobal | StoreName | DeleteAttr | ImportStar | PrintExpr
            | GenStart => stack.pop(),

            LoadAttr | UnaryNot | UnaryPositive | UnaryNegative | UnaryInvert | GetIter
            | ListToTuple | GetYieldFromIter | GetAwaitable | GetAiter => {
                stack.push();
                stack.pop();
            }
            LoadMethod | BeforeAsyncWith => {
                stack.push();
                stack.push();
                stack.pop_from_stack();
            }
            StoreAttr | DeleteSubscr => {
                stack.pop();
                stack.pop();
            }
            StoreSubscr => {
                stack.pop();
                stack.pop();
                stack.pop();
            }

            BinarySubscr | BinaryAdd | InplaceAdd | BinarySubtract | InplaceSubtract
            | BinaryMultiply | InplaceMultiply | BinaryFloorDivide | InplaceFloorDivide
            | BinaryTrueDivide | InplaceTrueDivide | BinaryModulo | InplaceModulo | BinaryPower
            | InplacePower | BinaryMatrixMultiply | InplaceMatrixMultiply | BinaryLshift
            | InplaceLshift | BinaryRshift | InplaceRshift | BinaryAnd | InplaceAnd | BinaryOr
            | InplaceOr | BinaryXor | InplaceXor | CompareOp | IsOp | ContainsOp | ImportName => {
                stack.push();
                stack.pop();
                stack.pop();
            }

            // The returned reference is borrowed from a materialized slot
            ReturnValue => stack.pop_from_stack(),

            CallFunction => {
                stack.push();
                stack.pop_n_from_stack(1 + oparg);
            }
            CallMethod => {
                stack.push();
                stack.pop_n_from_stack(2 + oparg);
            }
            CallFunctionKw => {
                stack.push();
                stack.pop_n_from_stack(1 + oparg);
                stack.pop();
            }
            CallFunctionEx => {
                stack.push();
                stack.pop();
                stack.pop();
                if oparg & 1 != 0 {
                    stack.pop();
                }
            }
            MakeFunction => {
                stack.push();
                stack.pop_n_from_stack((oparg & 0xF).count_ones());
                stack.pop();
                stack.pop();
            }

            ImportFrom | ForIter | GetLen | MatchMapping | MatchSequence | GetAnext => {
                stack.push();
                stack.fetch(1);
            }
            PopJumpIfTrue | PopJumpIfFalse => stack.pop(),
            JumpIfTrueOrPop | JumpIfFalseOrPop => stack.pop_from_stack(),

            BuildString | BuildTuple | BuildList | BuildSet => {
                stack.push();
                stack.pop_n_from_stack(oparg);
            }
            BuildMap => {
                stack.push();
                stack.pop_n_from_stack(2 * oparg);
            }
            BuildConstKeyMap => {
                stack.push();
                stack.pop_n_from_stack(oparg + 1);
            }
            ListAppend | SetAdd | ListExtend | SetUpdate | DictUpdate => {
                stack.fetch(oparg);
                stack.pop();
            }
            MapAdd => {
                stack.fetch(oparg);
                stack.pop();
                stack.pop();
            }
            DictMerge => {
                stack.fetch(oparg + 2);
                stack.fetch(oparg);
                stack.pop();
            }

            FormatValue => {
                stack.push();
                stack.pop();
                if oparg & FVS_MASK == FVS_HAVE_SPEC {
                    stack.pop();
                }
            }
            BuildSlice => {
                stack.push();
                stack.pop();
                stack.pop();
                if oparg == 3 {
                    stack.pop();
                }
            }

            UnpackSequence => {
                for _ in 0..oparg {
                    stack.push();
                }
                stack.pop();
            }
            UnpackEx => {
                for _ in 0..(oparg & 0xFF) + 1 + (oparg >> 8) {
                    stack.push();
                }
                stack.pop();
            }

            MatchKeys => {
                stack.push();
                stack.push();
                stack.fetch(2);
                stack.fetch(1);
            }
            MatchClass => {
                stack.push();
                stack.push();
                stack.pop_from_stack();
                stack.pop_from_stack();
                stack.pop();
            }
            CopyDictWithoutKeys => {
                stack.push();
                stack.fetch(1);
                stack.pop();
            }

            PopExcept => stack.pop_n_from_stack(3),
            JumpIfNotExcMatch => {
                stack.pop();
                stack.pop();
            }
            Reraise | SetupWith => {
                stack.push();
                stack.push();
                stack.pop_from_stack();
            }
            WithExceptStart => {
                stack.push();
                stack.fetch(7);
                stack.fetch(3);
                stack.fetch(2);
                stack.fetch(1);
            }
            RaiseVarargs => stack.pop_n_from_stack(oparg),

            YieldValue => {
                stack.push();
                stack.pop_from_stack();
            }
            YieldFrom => {
                stack.push();
                stack.pop_from_stack();
                stack.pop_from_stack();
            }
            EndAsyncFor => stack.pop_n_from_stack(7),
            SetupAsyncWith => stack.fetch(1),

            // Folded into the instruction that follows
            ExtendedArg => {}
        }
        Ok(())
    }

    fn local_slot(&self, vpc: usize, oparg: u32) -> Result<usize, AnalysisError> {
        let slot = oparg as usize;
        if slot >= self.nlocals {
            return Err(AnalysisError::LocalOutOfRange { vpc, slot: oparg, nlocals: self.nlocals });
        }
        Ok(slot)
    }

    // ========================================================================
    // Phase B: exception region aggregation
    // ========================================================================

    fn aggregate_regions(&mut self) -> Result<(), AnalysisError> {
        let block_num = self.graph.blocks.len();
        for r in 0..self.graph.regions.len() {
            let declarer = self.graph.regions[r].declarer;
            let Some(start) = self.graph.block(declarer).fall else {
                continue;
            };

            let mut visited = vec![false; block_num];
            let mut ever_deleted = BitSet::new(self.nlocals);
            let mut worklist = vec![(start, 1u32)];

            while let Some((id, depth)) = worklist.pop() {
                if depth == 0 {
                    return Err(AnalysisError::RegionNestingUnderflow(r as u32));
                }
                if std::mem::replace(&mut visited[id.index()], true) {
                    continue;
                }
                ever_deleted.union_with(&self.facts[id.index()].locals_ever_deleted);

                let block = self.graph.block(id);
                // Pushed first so the branch side is explored before it
                if let Some(fall) = block.fall {
                    let next = depth + block.has_try_entrance as u32 - block.has_try_exit as u32;
                    if next != 0 {
                        worklist.push((fall, next));
                    }
                }
                // A nested try setup branches to its handler, which is
                // still inside this region
                if let Some(branch) = block.branch {
                    worklist.push((branch, depth));
                }
            }

            self.graph.regions[r].ever_deleted = ever_deleted;
        }
        Ok(())
    }

    // ========================================================================
    // Phase C: live-in locals
    // ========================================================================

    fn solve_live_locals(&mut self) {
        let block_num = self.graph.blocks.len();
        let region_num = self.graph.regions.len();
        let mut region_inputs = vec![BitSet::full(self.nlocals); region_num];
        let empty = BitSet::new(self.nlocals);

        self.facts[0].locals_input = BitSet::prefix(self.nlocals, self.unit.nargs());

        let mut block_marks = vec![Mark::Queued; block_num];
        let mut region_marks = vec![Mark::Queued; region_num];
        let mut worklist: Vec<Node> = Vec::with_capacity(block_num + region_num);
        worklist.extend((0..region_num).map(|r| Node::Region(RegionId(r as u32))));
        worklist.extend((0..block_num).rev().map(|b| Node::Block(BlockId(b as u32))));

        while let Some(node) = worklist.pop() {
            let (output, successors) = match node {
                Node::Block(id) => {
                    block_marks[id.index()] = Mark::Done;
                    let facts = &self.facts[id.index()];
                    let output = facts.locals_input.transfer(&facts.locals_touched, &facts.locals_set);
                    let block = self.graph.block(id);
                    let branch = match (block.region, block.branch) {
                        (Some(region), _) => Some(Node::Region(region)),
                        (None, branch) => branch.map(Node::Block),
                    };
                    (output, [branch, block.fall.map(Node::Block)])
                }
                Node::Region(id) => {
                    region_marks[id.index()] = Mark::Done;
                    let region = self.graph.region(id);
                    let output = region_inputs[id.index()].transfer(&region.ever_deleted, &empty);
                    (output, [Some(Node::Block(region.handler)), None])
                }
            };

            for successor in successors.into_iter().flatten() {
                let (input, mark) = match successor {
                    Node::Block(id) => (&mut self.facts[id.index()].locals_input, &mut block_marks[id.index()]),
                    Node::Region(id) => (&mut region_inputs[id.index()], &mut region_marks[id.index()]),
                };
                if input.intersect_with(&output) && *mark != Mark::Queued {
                    *mark = Mark::Queued;
                    worklist.push(successor);
                }
            }
        }
    }

    // ========================================================================
    // Phase D: initial stack heights
    // ========================================================================

    fn solve_stack_heights(&mut self) -> Result<(), AnalysisError> {
        let capacity = self.unit.stacksize;
        let mut marks = vec![Mark::Unvisited; self.graph.blocks.len()];
        let entry = self.graph.entry();
        self.facts[entry.index()].initial_stack_height = Some(self.unit.is_resumable() as i32);
        marks[entry.index()] = Mark::Queued;
        let mut worklist = vec![entry];

        while let Some(id) = worklist.pop() {
            marks[id.index()] = Mark::Done;
            let block = self.graph.block(id);
            let facts = &self.facts[id.index()];
            let base = facts.initial_stack_height.unwrap_or(0) + facts.stack_effect;

            for (successor, difference) in [(block.branch, block.branch_stack_difference), (block.fall, 0)] {
                let Some(successor) = successor else { continue };
                let height = base + difference;
                if height < 0 || height > capacity as i32 {
                    return Err(AnalysisError::StackHeightOutOfRange { block: successor, height, capacity });
                }
                let succ_facts = &mut self.facts[successor.index()];
                match succ_facts.initial_stack_height {
                    None => {
                        succ_facts.initial_stack_height = Some(height);
                        marks[successor.index()] = Mark::Queued;
                        worklist.push(successor);
                    }
                    Some(expected) if expected != height => {
                        return Err(AnalysisError::InconsistentStackHeight { block: successor, expected, found: height });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (block, facts) in self.graph.blocks.iter().zip(&self.facts) {
            write!(f, "{} [{}..{})", block.id, block.begin, block.end)?;
            match facts.initial_stack_height {
                Some(h) => write!(f, " height={}", h)?,
                None => f.write_str(" unreachable")?,
            }
            write!(f, " effect={:+}", facts.stack_effect)?;
            if let Some(branch) = block.branch {
                write!(f, " branch={}", branch)?;
            }
            if let Some(fall) = block.fall {
                write!(f, " fall={}", fall)?;
            }
            writeln!(f)?;
            writeln!(
                f,
                "    live-in={} touched={} set={}",
                facts.locals_input, facts.locals_touched, facts.locals_set
            )?;
        }
        for region in &self.regions {
            writeln!(
                f,
                "region {} declared by {} handler {} ever-deleted={}",
                region.id.0, region.declarer, region.handler, region.ever_deleted
            )?;
        }
        writeln!(f, "redundant loads: {}", self.redundant_loads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{decode, CodeFlags};
    use crate::jit::analysis::blocks::BlockGraphBuilder;

    fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
        code.push(op.to_u8());
        code.push(arg);
    }

    fn analyze(unit: &CodeUnit) -> Result<Analysis, AnalysisError> {
        let instrs = decode(&unit.code).unwrap();
        let graph = BlockGraphBuilder::new(&instrs, unit.nlocals as usize).build().unwrap();
        DataflowAnalyzer::new(unit, &instrs, graph).run()
    }

    #[test]
    fn test_return_constant_not_forwarded() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 1);

        let analysis = analyze(&unit).unwrap();
        assert_eq!(analysis.graph.blocks.len(), 1);
        assert_eq!(analysis.facts[0].stack_effect, 0);
        assert_eq!(analysis.facts[0].initial_stack_height, Some(0));
        assert_eq!(analysis.redundant_loads.count(), 0);
    }

    #[test]
    fn test_copy_through_store_is_forwarded() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::StoreFast, 1); // 1
        emit(&mut code, Opcode::LoadFast, 1); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        let mut unit = CodeUnit::new("f", code, 2, 1);
        unit.argcount = 1;

        let analysis = analyze(&unit).unwrap();
        // Slot 0 is not written before the store consumes its value
        assert!(analysis.redundant_loads.get(0));
        // The returned value must be materialized
        assert!(!analysis.redundant_loads.get(2));

        let facts = &analysis.facts[0];
        assert_eq!(facts.locals_touched.to_string(), "{0, 1}");
        // Last touch of slot 1 is the read at 2, of slot 0 the read at 0
        assert_eq!(facts.locals_set.to_string(), "{0, 1}");
        assert_eq!(facts.locals_input.to_string(), "{0}");
    }

    #[test]
    fn test_overwritten_local_not_forwarded() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::LoadConst, 0); // 1
        emit(&mut code, Opcode::StoreFast, 0); // 2
        emit(&mut code, Opcode::StoreFast, 1); // 3
        emit(&mut code, Opcode::LoadConst, 0); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5
        let mut unit = CodeUnit::new("f", code, 2, 2);
        unit.argcount = 1;

        let analysis = analyze(&unit).unwrap();
        // Slot 0 is rewritten at 2 before its old value is consumed at 3
        assert!(!analysis.redundant_loads.get(0));
        // The constant is consumed inside the block
        assert!(analysis.redundant_loads.get(1));
    }

    #[test]
    fn test_value_live_across_block_not_forwarded() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0); // 0
        emit(&mut code, Opcode::LoadFast, 0); // 1
        emit(&mut code, Opcode::PopJumpIfFalse, 4); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        emit(&mut code, Opcode::ReturnValue, 0); // 4
        let mut unit = CodeUnit::new("f", code, 1, 2);
        unit.argcount = 1;

        let analysis = analyze(&unit).unwrap();
        assert!(!analysis.redundant_loads.get(0));
        assert!(analysis.redundant_loads.get(1));
        assert_eq!(analysis.facts[0].stack_effect, 1);
        assert_eq!(analysis.facts[1].initial_stack_height, Some(1));
        assert_eq!(analysis.facts[2].initial_stack_height, Some(1));
    }

    #[test]
    fn test_liveness_through_branches() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::PopJumpIfFalse, 5); // 1
        emit(&mut code, Opcode::LoadConst, 0); // 2
        emit(&mut code, Opcode::StoreFast, 1); // 3
        emit(&mut code, Opcode::JumpForward, 0); // 4 -> 5
        emit(&mut code, Opcode::LoadFast, 1); // 5
        emit(&mut code, Opcode::ReturnValue, 0); // 6
        let mut unit = CodeUnit::new("f", code, 2, 1);
        unit.argcount = 1;

        let analysis = analyze(&unit).unwrap();
        let join = analysis.graph.block_containing(5).unwrap();
        // Slot 1 is bound on one path only
        assert_eq!(analysis.facts(join).locals_input.to_string(), "{0}");
        let store_block = analysis.graph.block_containing(3).unwrap();
        assert_eq!(analysis.facts(store_block).locals_input.to_string(), "{0}");
    }

    #[test]
    fn test_all_arguments_bound_everywhere() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::PopJumpIfFalse, 4); // 1
        emit(&mut code, Opcode::LoadFast, 1); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        emit(&mut code, Opcode::LoadFast, 0); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5
        let mut unit = CodeUnit::new("f", code, 2, 1);
        unit.argcount = 2;

        let analysis = analyze(&unit).unwrap();
        for facts in &analysis.facts {
            assert_eq!(facts.locals_input.count(), 2);
        }
    }

    #[test]
    fn test_nested_region_collects_inner_deletes() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::SetupFinally, 10); // 0 outer, handler at 11
        emit(&mut code, Opcode::SetupFinally, 3); // 1 inner, handler at 5
        emit(&mut code, Opcode::DeleteFast, 3); // 2
        emit(&mut code, Opcode::PopBlock, 0); // 3
        emit(&mut code, Opcode::JumpForward, 4); // 4 -> 9
        emit(&mut code, Opcode::PopTop, 0); // 5 inner handler
        emit(&mut code, Opcode::PopTop, 0); // 6
        emit(&mut code, Opcode::PopTop, 0); // 7
        emit(&mut code, Opcode::PopExcept, 0); // 8
        emit(&mut code, Opcode::PopBlock, 0); // 9
        emit(&mut code, Opcode::JumpForward, 4); // 10 -> 15
        emit(&mut code, Opcode::PopTop, 0); // 11 outer handler
        emit(&mut code, Opcode::PopTop, 0); // 12
        emit(&mut code, Opcode::PopTop, 0); // 13
        emit(&mut code, Opcode::PopExcept, 0); // 14
        emit(&mut code, Opcode::LoadConst, 0); // 15
        emit(&mut code, Opcode::ReturnValue, 0); // 16
        let mut unit = CodeUnit::new("f", code, 4, 6);
        unit.argcount = 4;

        let instrs = decode(&unit.code).unwrap();
        let graph = BlockGraphBuilder::new(&instrs, 4).build().unwrap();
        assert_eq!(graph.regions.len(), 2);
        let analysis = DataflowAnalyzer::new(&unit, &instrs, graph).run().unwrap();

        let outer = &analysis.regions[0];
        assert_eq!(outer.declarer, BlockId(0));
        assert!(outer.ever_deleted.get(3));
        let inner = &analysis.regions[1];
        assert!(inner.ever_deleted.get(3));

        // Both handlers see slot 3 as possibly unbound
        let inner_handler = analysis.graph.block_containing(5).unwrap();
        let outer_handler = analysis.graph.block_containing(11).unwrap();
        assert!(!analysis.facts(inner_handler).locals_input.get(3));
        assert!(!analysis.facts(outer_handler).locals_input.get(3));
        assert!(analysis.facts(outer_handler).locals_input.get(0));
        // Regions no longer sit on the graph's edges
        assert!(analysis.graph.regions.is_empty());
        assert_eq!(analysis.graph.blocks[0].branch, Some(outer_handler));
    }

    #[test]
    fn test_handler_heights() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::SetupFinally, 3); // 0 -> handler at 4
        emit(&mut code, Opcode::LoadConst, 0); // 1
        emit(&mut code, Opcode::PopBlock, 0); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        emit(&mut code, Opcode::Reraise, 0); // 4
        let unit = CodeUnit::new("f", code, 0, 6);

        let analysis = analyze(&unit).unwrap();
        let handler = analysis.graph.block_containing(4).unwrap();
        assert_eq!(analysis.facts(handler).initial_stack_height, Some(6));
        let body = analysis.graph.block_containing(3).unwrap();
        assert_eq!(analysis.facts(body).initial_stack_height, Some(1));
    }

    #[test]
    fn test_generator_starts_with_sentinel() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::GenStart, 0); // 0
        emit(&mut code, Opcode::LoadConst, 0); // 1
        emit(&mut code, Opcode::YieldValue, 0); // 2
        emit(&mut code, Opcode::PopTop, 0); // 3
        emit(&mut code, Opcode::LoadConst, 0); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5
        let mut unit = CodeUnit::new("g", code, 0, 1);
        unit.flags = CodeFlags(CodeFlags::GENERATOR);

        let analysis = analyze(&unit).unwrap();
        assert_eq!(analysis.facts[0].initial_stack_height, Some(1));
        let resumed = analysis.graph.block_containing(3).unwrap();
        assert_eq!(analysis.facts(resumed).initial_stack_height, Some(1));
    }

    #[test]
    fn test_inconsistent_heights_rejected() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::PopJumpIfFalse, 4); // 1
        emit(&mut code, Opcode::LoadConst, 0); // 2
        emit(&mut code, Opcode::JumpAbsolute, 4); // 3
        emit(&mut code, Opcode::LoadConst, 0); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5
        let mut unit = CodeUnit::new("f", code, 1, 2);
        unit.argcount = 1;

        assert!(matches!(
            analyze(&unit),
            Err(AnalysisError::InconsistentStackHeight { .. })
        ));
    }

    #[test]
    fn test_height_over_capacity_rejected() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::JumpForward, 0);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 0, 1);
        assert!(matches!(
            analyze(&unit),
            Err(AnalysisError::StackHeightOutOfRange { height: 2, capacity: 1, .. })
        ));
    }

    #[test]
    fn test_local_out_of_range() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 5);
        emit(&mut code, Opcode::ReturnValue, 0);
        let unit = CodeUnit::new("f", code, 1, 1);
        assert!(matches!(analyze(&unit), Err(AnalysisError::LocalOutOfRange { slot: 5, .. })));
    }
}
