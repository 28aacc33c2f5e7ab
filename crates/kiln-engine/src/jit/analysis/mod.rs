//! Static analysis of a code unit
//!
//! Partitions the unit into blocks and computes the facts the emitter relies
//! on: redundant loads, live-in locals and initial stack heights.

pub mod abstract_stack;
pub mod bitset;
pub mod blocks;
pub mod dataflow;

pub use bitset::BitSet;
pub use blocks::{Block, BlockGraph, BlockGraphBuilder, BlockId, ExceptionRegion, GraphError, RegionId};
pub use dataflow::{Analysis, AnalysisError, BlockFacts, DataflowAnalyzer};

use crate::bytecode::{CodeUnit, Instruction};

/// Build the block graph and run the dataflow phases over it
pub fn analyze(unit: &CodeUnit, instrs: &[Instruction]) -> Result<Analysis, crate::jit::JitError> {
    let graph = BlockGraphBuilder::new(instrs, unit.nlocals as usize).build()?;
    log::debug!("{}: {} blocks, {} exception regions", unit.name, graph.blocks.len(), graph.regions.len());
    Ok(DataflowAnalyzer::new(unit, instrs, graph).run()?)
}
