//! Block graph construction from decoded wordcode
//!
//! Partitions the instruction stream into blocks with at most two exits
//! (`branch` and `fall`) and allocates one exception region per try-setup
//! instruction. A region sits between its declaring block and the handler
//! while the dataflow analysis runs; the final graph keeps only the direct
//! `branch` edge to the handler.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::bytecode::{folded_oparg, Instruction, Opcode};
use super::bitset::BitSet;

/// Unique identifier for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Unique identifier for an exception region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Malformed input detected while partitioning
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Code unit has no instructions")]
    Empty,
    #[error("Jump at instruction {vpc} targets {target}, past the last instruction")]
    JumpOutOfRange { vpc: usize, target: usize },
    #[error("Block boundary at instruction {0} splits an EXTENDED_ARG chain")]
    SplitPrefix(usize),
    #[error("Control falls off the end of the unit after instruction {0}")]
    FallsOffEnd(usize),
}

/// A maximal straight-line run of instructions
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// First instruction index
    pub begin: usize,
    /// One past the last instruction index
    pub end: usize,
    /// Taken edge: jump target, iterator exit, or protected-region handler
    pub branch: Option<BlockId>,
    /// Sequential edge, absent after a terminator
    pub fall: Option<BlockId>,
    /// Region declared by the try setup ending this block
    pub region: Option<RegionId>,
    pub has_try_entrance: bool,
    pub has_try_exit: bool,
    /// Extra stack delta applied only along the branch edge
    pub branch_stack_difference: i32,
}

impl Block {
    /// Index of the instruction that decides the block's exits
    pub fn tail(&self) -> usize {
        self.end - 1
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Locals a handler must treat as possibly unbound, aggregated over the
/// blocks of one protected region
#[derive(Debug, Clone)]
pub struct ExceptionRegion {
    pub id: RegionId,
    /// Block ending with the try-setup instruction
    pub declarer: BlockId,
    /// Block the handler starts at
    pub handler: BlockId,
    /// Locals deleted anywhere inside the region
    pub ever_deleted: BitSet,
}

/// Partitioned unit
#[derive(Debug, Clone)]
pub struct BlockGraph {
    pub blocks: Vec<Block>,
    /// Transient regions, consumed by the dataflow analysis
    pub regions: Vec<ExceptionRegion>,
    /// Map from instruction index to the block that starts there
    pub offset_to_block: FxHashMap<usize, BlockId>,
    pub instr_num: usize,
}

impl BlockGraph {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn region(&self, id: RegionId) -> &ExceptionRegion {
        &self.regions[id.index()]
    }

    /// Block containing instruction `vpc`
    pub fn block_containing(&self, vpc: usize) -> Option<BlockId> {
        if vpc >= self.instr_num {
            return None;
        }
        let idx = self.blocks.partition_point(|b| b.begin <= vpc);
        Some(self.blocks[idx - 1].id)
    }
}

/// Extra height along the branch edge for the opcode that ends a block
pub fn branch_stack_difference(opcode: Opcode) -> i32 {
    match opcode {
        Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => 1,
        Opcode::ForIter => -2,
        Opcode::SetupFinally => 6,
        Opcode::SetupWith | Opcode::SetupAsyncWith | Opcode::Reraise => 5,
        _ => 0,
    }
}

/// Partitions one unit's instructions
pub struct BlockGraphBuilder<'a> {
    instrs: &'a [Instruction],
    nlocals: usize,
}

impl<'a> BlockGraphBuilder<'a> {
    pub fn new(instrs: &'a [Instruction], nlocals: usize) -> Self {
        BlockGraphBuilder { instrs, nlocals }
    }

    pub fn build(self) -> Result<BlockGraph, GraphError> {
        let n = self.instrs.len();
        if n == 0 {
            return Err(GraphError::Empty);
        }

        // Step 1: Mark block boundaries
        let boundaries = self.collect_boundaries()?;

        // Step 2: Prefix chains never straddle a boundary
        for vpc in boundaries.iter().filter(|&b| b > 0 && b < n) {
            if self.instrs[vpc - 1].opcode == Opcode::ExtendedArg {
                return Err(GraphError::SplitPrefix(vpc));
            }
        }

        // Step 3: Create blocks between consecutive boundaries
        let mut blocks = Vec::new();
        let mut offset_to_block = FxHashMap::default();
        let mut begin = 0;
        for end in boundaries.iter() {
            let id = BlockId(blocks.len() as u32);
            offset_to_block.insert(begin, id);
            let tail = self.instrs[end - 1].opcode;
            blocks.push(Block {
                id,
                begin,
                end,
                branch: None,
                fall: None,
                region: None,
                has_try_entrance: tail.is_try_setup(),
                has_try_exit: tail == Opcode::PopBlock,
                branch_stack_difference: branch_stack_difference(tail),
            });
            begin = end;
        }

        // Step 4: Link successors and allocate exception regions
        let mut regions = Vec::new();
        let block_num = blocks.len();
        for idx in 0..block_num {
            let tail_vpc = blocks[idx].tail();
            let tail = self.instrs[tail_vpc].opcode;

            if !tail.is_terminator() {
                if idx + 1 == block_num {
                    return Err(GraphError::FallsOffEnd(tail_vpc));
                }
                blocks[idx].fall = Some(BlockId(idx as u32 + 1));
            }

            if let Some(target) = self.branch_target(tail_vpc) {
                let target_id = offset_to_block[&target];
                blocks[idx].branch = Some(target_id);
                if blocks[idx].has_try_entrance {
                    let region = RegionId(regions.len() as u32);
                    regions.push(ExceptionRegion {
                        id: region,
                        declarer: BlockId(idx as u32),
                        handler: target_id,
                        ever_deleted: BitSet::new(self.nlocals),
                    });
                    blocks[idx].region = Some(region);
                }
            }
        }

        log::trace!("partitioned {} instructions into {} blocks, {} regions", n, block_num, regions.len());

        Ok(BlockGraph {
            blocks,
            regions,
            offset_to_block,
            instr_num: n,
        })
    }

    /// Boundary bitmap over `1..=n`; bit `i` means a block ends before `i`
    fn collect_boundaries(&self) -> Result<BitSet, GraphError> {
        let n = self.instrs.len();
        let mut boundaries = BitSet::new(n + 1);

        for (vpc, instr) in self.instrs.iter().enumerate() {
            let op = instr.opcode;
            if op.is_try_setup() || op.is_relative_jump() || op.is_absolute_jump() {
                let target = self.raw_target(vpc);
                if target >= n {
                    return Err(GraphError::JumpOutOfRange { vpc, target });
                }
                boundaries.set(target);
                boundaries.set(vpc + 1);
            } else if matches!(op, Opcode::PopBlock | Opcode::YieldValue) {
                boundaries.set(vpc + 1);
            } else if op == Opcode::YieldFrom {
                // The instruction after YIELD_FROM is re-entered through the
                // generator throw path, not through the block graph.
                boundaries.set(vpc);
            }
        }

        boundaries.set(n);
        boundaries.reset(0);
        Ok(boundaries)
    }

    /// Destination index encoded by the jump or try setup at `vpc`
    fn raw_target(&self, vpc: usize) -> usize {
        let op = self.instrs[vpc].opcode;
        let oparg = folded_oparg(self.instrs, vpc) as usize;
        if op.is_absolute_jump() {
            oparg
        } else {
            oparg + vpc + 1
        }
    }

    fn branch_target(&self, vpc: usize) -> Option<usize> {
        let op = self.instrs[vpc].opcode;
        if op.is_try_setup() || op.is_relative_jump() || op.is_absolute_jump() {
            let target = self.raw_target(vpc);
            (target < self.instrs.len()).then_some(target)
        } else {
            None
        }
    }
}

impl fmt::Display for BlockGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            write!(f, "{} [{}..{})", block.id, block.begin, block.end)?;
            if let Some(branch) = block.branch {
                write!(f, " branch={}", branch)?;
            }
            if let Some(fall) = block.fall {
                write!(f, " fall={}", fall)?;
            }
            if block.has_try_entrance {
                f.write_str(" try-enter")?;
            }
            if block.has_try_exit {
                f.write_str(" try-exit")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::decode;

    fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
        code.push(op.to_u8());
        code.push(arg);
    }

    fn build(code: &[u8]) -> Result<BlockGraph, GraphError> {
        let instrs = decode(code).unwrap();
        BlockGraphBuilder::new(&instrs, 4).build()
    }

    #[test]
    fn test_single_block() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::ReturnValue, 0);

        let graph = build(&code).unwrap();
        assert_eq!(graph.blocks.len(), 1);
        let b = &graph.blocks[0];
        assert_eq!((b.begin, b.end), (0, 2));
        assert_eq!(b.branch, None);
        assert_eq!(b.fall, None);
    }

    #[test]
    fn test_conditional_branch() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::PopJumpIfFalse, 4); // 1
        emit(&mut code, Opcode::LoadConst, 0); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        emit(&mut code, Opcode::LoadConst, 1); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5

        let graph = build(&code).unwrap();
        assert_eq!(graph.blocks.len(), 3);
        assert_eq!(graph.blocks[0].branch, Some(BlockId(2)));
        assert_eq!(graph.blocks[0].fall, Some(BlockId(1)));
        assert_eq!(graph.blocks[1].fall, None);
        assert_eq!(graph.blocks[2].begin, 4);
        assert_eq!(graph.block_containing(3), Some(BlockId(1)));
        assert_eq!(graph.block_containing(6), None);
    }

    #[test]
    fn test_relative_jump_target() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadFast, 0); // 0
        emit(&mut code, Opcode::GetIter, 0); // 1
        emit(&mut code, Opcode::ForIter, 2); // 2 -> exits to 5
        emit(&mut code, Opcode::StoreFast, 1); // 3
        emit(&mut code, Opcode::JumpAbsolute, 2); // 4
        emit(&mut code, Opcode::LoadConst, 0); // 5
        emit(&mut code, Opcode::ReturnValue, 0); // 6

        let graph = build(&code).unwrap();
        let starts: Vec<_> = graph.blocks.iter().map(|b| b.begin).collect();
        assert_eq!(starts, vec![0, 2, 3, 5]);
        let for_iter = &graph.blocks[1];
        assert_eq!(for_iter.branch, Some(BlockId(3)));
        assert_eq!(for_iter.fall, Some(BlockId(2)));
        assert_eq!(for_iter.branch_stack_difference, -2);
        assert_eq!(graph.blocks[2].branch, Some(BlockId(1)));
        assert_eq!(graph.blocks[2].fall, None);
    }

    #[test]
    fn test_try_setup_allocates_region() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::SetupFinally, 3); // 0 -> handler at 4
        emit(&mut code, Opcode::LoadConst, 0); // 1
        emit(&mut code, Opcode::PopTop, 0); // 2
        emit(&mut code, Opcode::PopBlock, 0); // 3
        emit(&mut code, Opcode::LoadConst, 0); // 4
        emit(&mut code, Opcode::ReturnValue, 0); // 5

        let graph = build(&code).unwrap();
        assert_eq!(graph.blocks.len(), 3);
        assert!(graph.blocks[0].has_try_entrance);
        assert!(graph.blocks[1].has_try_exit);
        assert_eq!(graph.blocks[0].branch, Some(BlockId(2)));
        assert_eq!(graph.blocks[0].branch_stack_difference, 6);
        assert_eq!(graph.regions.len(), 1);
        let region = &graph.regions[0];
        assert_eq!(region.declarer, BlockId(0));
        assert_eq!(region.handler, BlockId(2));
        assert_eq!(graph.blocks[0].region, Some(RegionId(0)));
    }

    #[test]
    fn test_yield_from_starts_its_own_block() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::GenStart, 0); // 0
        emit(&mut code, Opcode::LoadConst, 0); // 1
        emit(&mut code, Opcode::YieldFrom, 0); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3

        let graph = build(&code).unwrap();
        let starts: Vec<_> = graph.blocks.iter().map(|b| b.begin).collect();
        assert_eq!(starts, vec![0, 2]);
    }

    #[test]
    fn test_extended_jump_target() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::ExtendedArg, 1); // 0
        emit(&mut code, Opcode::JumpAbsolute, 2); // 1 -> 258
        emit(&mut code, Opcode::ReturnValue, 0); // 2
        assert!(matches!(build(&code), Err(GraphError::JumpOutOfRange { vpc: 1, target: 258 })));
    }

    #[test]
    fn test_jump_into_prefix_chain_rejected() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::JumpAbsolute, 2); // 0
        emit(&mut code, Opcode::ExtendedArg, 0); // 1
        emit(&mut code, Opcode::LoadConst, 0); // 2
        emit(&mut code, Opcode::ReturnValue, 0); // 3
        assert!(matches!(build(&code), Err(GraphError::SplitPrefix(2))));
    }

    #[test]
    fn test_falls_off_end() {
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, 0);
        emit(&mut code, Opcode::PopTop, 0);
        assert!(matches!(build(&code), Err(GraphError::FallsOffEnd(1))));
    }

    #[test]
    fn test_empty_unit() {
        assert!(matches!(build(&[]), Err(GraphError::Empty)));
    }
}
