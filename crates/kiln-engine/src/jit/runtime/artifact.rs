//! The in-memory result of compiling one unit
//!
//! A [`CompiledArtifact`] owns the unit's machine code (placed in the exec
//! arena), the handler dispatch table, the per-instruction stack heights the
//! unwinder consults and the unit's inline-cache pool. Everything except the
//! inline caches is immutable once built.

use std::fmt;
use std::sync::Arc;

use super::abi::{JitEntryFn, Opcache};
use super::exec_memory::{CodeAllocation, ExecMemoryArena, ExecMemoryError};

/// Stack height of every instruction, narrowed to bytes when the unit's
/// capacity allows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackHeights {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl StackHeights {
    /// Whether a unit with this stack capacity stores one byte per height
    pub fn is_narrow(stacksize: u32) -> bool {
        stacksize <= u8::MAX as u32
    }

    /// Narrow `heights` according to the unit's declared capacity
    pub fn for_capacity(stacksize: u32, heights: &[u16]) -> Self {
        if Self::is_narrow(stacksize) {
            StackHeights::U8(heights.iter().map(|&h| h as u8).collect())
        } else {
            StackHeights::U16(heights.to_vec())
        }
    }

    pub fn get(&self, vpc: usize) -> Option<u32> {
        match self {
            StackHeights::U8(v) => v.get(vpc).map(|&h| h as u32),
            StackHeights::U16(v) => v.get(vpc).map(|&h| h as u32),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StackHeights::U8(v) => v.len(),
            StackHeights::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per entry
    pub fn width(&self) -> usize {
        match self {
            StackHeights::U8(_) => 1,
            StackHeights::U16(_) => 2,
        }
    }
}

/// Machine code plus side tables for one unit
pub struct CompiledArtifact {
    code: CodeAllocation,
    handler_vpcs: Vec<u32>,
    handler_pcs: Vec<i64>,
    stack_heights: StackHeights,
    opcache: Box<[Opcache]>,
}

impl CompiledArtifact {
    /// Place `code` in the arena and attach its tables
    ///
    /// `handler_vpcs` must be sorted and pair up with `handler_pcs`.
    pub fn new(
        arena: &Arc<ExecMemoryArena>,
        code: &[u8],
        handler_vpcs: Vec<u32>,
        handler_pcs: Vec<i64>,
        stack_heights: StackHeights,
        opcache_num: usize,
    ) -> Result<Self, ExecMemoryError> {
        assert_eq!(handler_vpcs.len(), handler_pcs.len());
        debug_assert!(handler_vpcs.windows(2).all(|w| w[0] < w[1]));

        Ok(CompiledArtifact {
            code: arena.allocate(code)?,
            handler_vpcs,
            handler_pcs,
            stack_heights,
            opcache: vec![Opcache::EMPTY; opcache_num].into_boxed_slice(),
        })
    }

    /// Native entry value recorded for the handler block at `vpc`
    ///
    /// Every vpc the host resumes at was registered at compile time; `None`
    /// means the caller broke that contract.
    pub fn calc_pc(&self, vpc: u32) -> Option<i64> {
        self.handler_vpcs.binary_search(&vpc).ok().map(|i| self.handler_pcs[i])
    }

    /// Entry value for a frame whose last executed instruction is `lasti`:
    /// zero for a fresh call, the handler after `lasti` for a resume
    pub fn resume_key(&self, lasti: i32) -> Option<i64> {
        if lasti < 0 {
            Some(0)
        } else {
            self.calc_pc(lasti as u32 + 1)
        }
    }

    pub fn code(&self) -> &[u8] {
        self.code.bytes()
    }

    /// The unit's entry point
    ///
    /// # Safety
    /// The code must have been produced by a native backend for this host;
    /// stub output traps when called.
    pub unsafe fn entry(&self) -> JitEntryFn {
        std::mem::transmute::<*const u8, JitEntryFn>(self.code.as_ptr())
    }

    pub fn handler_vpcs(&self) -> &[u32] {
        &self.handler_vpcs
    }

    pub fn handler_pcs(&self) -> &[i64] {
        &self.handler_pcs
    }

    pub fn handler_num(&self) -> usize {
        self.handler_vpcs.len()
    }

    pub fn stack_heights(&self) -> &StackHeights {
        &self.stack_heights
    }

    /// Stack height the unwinder sees at `vpc`
    pub fn stack_height(&self, vpc: usize) -> Option<u32> {
        self.stack_heights.get(vpc)
    }

    pub fn opcache_num(&self) -> usize {
        self.opcache.len()
    }

    pub fn opcache(&self) -> &[Opcache] {
        &self.opcache
    }

    /// Pointer the host stores into `JitCFrame::opcache`
    pub fn opcache_ptr(&mut self) -> *mut Opcache {
        self.opcache.as_mut_ptr()
    }

    /// Whether two artifacts carry identical code and tables
    pub fn same_content(&self, other: &CompiledArtifact) -> bool {
        self.code() == other.code()
            && self.handler_vpcs == other.handler_vpcs
            && self.handler_pcs == other.handler_pcs
            && self.stack_heights == other.stack_heights
            && self.opcache.len() == other.opcache.len()
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("code_size", &self.code.len())
            .field("handler_vpcs", &self.handler_vpcs)
            .field("handler_pcs", &self.handler_pcs)
            .field("stack_heights", &self.stack_heights)
            .field("opcache_num", &self.opcache.len())
            .finish()
    }
}
