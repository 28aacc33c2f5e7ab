//! Emitter IR: values, operations, blocks and functions
//!
//! The emitter lowers wordcode into this small, target-neutral form; a
//! backend then turns it into machine code. Values are pointer-sized words
//! or branch flags. Frame-relative accesses name the local, stack or table
//! slot directly, and the backend resolves them against the frame pointer it
//! receives on entry.

use super::helpers::{DataSymbol, Helper};

/// Virtual value produced by one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(pub u32);

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// IR block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrBlockId(pub u32);

impl IrBlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for IrBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Machine shape of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Pointer-sized integer or object pointer
    Word,
    /// Result of a comparison, consumed by branches and selects
    Flag,
}

/// Integer comparison condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed less-than
    Slt,
}

/// Object fields read or written by compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// The word the pointer points at
    Pointee,
    /// `ob_type` of any object
    ObType,
    /// `tp_flags` of a type object
    TypeFlags,
    /// `tp_iternext` of a type object
    TypeIternext,
    /// `ob_ref` of a cell object
    CellRef,
}

/// Frame execution states, numerically identical to the host's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FrameState {
    Suspended = -1,
    Returned = 1,
}

/// An IR operation
#[derive(Debug, Clone)]
pub enum IrOp {
    // ===== Constants and entry inputs =====
    Iconst { dest: Value, value: i64 },
    /// The frame pointer passed on entry
    FramePtr { dest: Value },
    /// Entry of the symbol table
    LoadSymbol { dest: Value, symbol: DataSymbol },
    /// Resume key stored by the host before re-entering the frame
    LoadHandler { dest: Value },
    /// Current value of the host's pending-work flag
    LoadEvalBreaker { dest: Value },

    // ===== Frame slots =====
    LoadLocal { dest: Value, slot: u32 },
    StoreLocal { slot: u32, value: Value },
    /// Stack slot `index`, counted from the bottom of the value stack
    LoadStack { dest: Value, index: u32 },
    StoreStack { index: u32, value: Value },
    /// Address of stack slot `index`
    StackAddr { dest: Value, index: u32 },
    /// Entry `index` of the code object's constant tuple
    LoadConst { dest: Value, index: u32 },
    /// Entry `index` of the code object's name tuple
    LoadName { dest: Value, index: u32 },
    /// Address of inline-cache entry `index` in the frame's opcache
    OpcacheAddr { dest: Value, index: u32 },

    // ===== Object fields =====
    LoadField { dest: Value, base: Value, field: Field },
    StoreField { base: Value, field: Field, value: Value },

    // ===== Frame bookkeeping =====
    /// Record the instruction index the host sees as current
    SetLasti { vpc: i32 },
    SetFrameState { state: FrameState, stack_depth: u32 },

    // ===== Reference counting =====
    IncRef { value: Value },
    /// Drop one reference, deallocating at zero; skips null when `null_check`
    DecRef { value: Value, null_check: bool },

    // ===== Calls =====
    Call { dest: Option<Value>, helper: Helper, args: Vec<Value> },
    /// Call through a function pointer taking and returning words
    CallIndirect { dest: Value, callee: Value, args: Vec<Value> },

    // ===== Arithmetic =====
    ICmp { dest: Value, cond: Cond, lhs: Value, rhs: Value },
    Band { dest: Value, lhs: Value, rhs: Value },
    Select { dest: Value, cond: Value, if_true: Value, if_false: Value },
}

impl IrOp {
    /// The value defined by this operation, if any
    pub fn dest(&self) -> Option<Value> {
        match self {
            IrOp::Iconst { dest, .. }
            | IrOp::FramePtr { dest }
            | IrOp::LoadSymbol { dest, .. }
            | IrOp::LoadHandler { dest }
            | IrOp::LoadEvalBreaker { dest }
            | IrOp::LoadLocal { dest, .. }
            | IrOp::LoadStack { dest, .. }
            | IrOp::StackAddr { dest, .. }
            | IrOp::LoadConst { dest, .. }
            | IrOp::LoadName { dest, .. }
            | IrOp::OpcacheAddr { dest, .. }
            | IrOp::LoadField { dest, .. }
            | IrOp::CallIndirect { dest, .. }
            | IrOp::ICmp { dest, .. }
            | IrOp::Band { dest, .. }
            | IrOp::Select { dest, .. } => Some(*dest),
            IrOp::Call { dest, .. } => *dest,
            IrOp::StoreLocal { .. }
            | IrOp::StoreStack { .. }
            | IrOp::StoreField { .. }
            | IrOp::SetLasti { .. }
            | IrOp::SetFrameState { .. }
            | IrOp::IncRef { .. }
            | IrOp::DecRef { .. } => None,
        }
    }
}

/// How an IR block ends
#[derive(Debug, Clone)]
pub enum Terminator {
    Jump(IrBlockId),
    /// Two-way branch on a flag; `unlikely` marks the `then` edge as cold
    Branch {
        cond: Value,
        then_block: IrBlockId,
        else_block: IrBlockId,
        unlikely: bool,
    },
    /// Leave compiled code with a word result
    Return(Value),
    /// Code that can never run
    Unreachable,
    /// Entry dispatch: selector zero goes to `default`, selector `k` (1-based)
    /// to `targets[k - 1]`
    Dispatch {
        selector: Value,
        default: IrBlockId,
        targets: Vec<IrBlockId>,
    },
    /// Placeholder (not yet assigned)
    None,
}

impl Terminator {
    /// Blocks this terminator can transfer control to
    pub fn successors(&self) -> Vec<IrBlockId> {
        match self {
            Terminator::Jump(target) => vec![*target],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Dispatch { default, targets, .. } => {
                let mut out = Vec::with_capacity(targets.len() + 1);
                out.push(*default);
                out.extend(targets.iter().copied());
                out
            }
            Terminator::Return(_) | Terminator::Unreachable | Terminator::None => vec![],
        }
    }
}

/// A straight-line run of operations with one terminator
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub id: IrBlockId,
    /// Human-readable origin, e.g. the bytecode block it was emitted for
    pub label: String,
    pub ops: Vec<IrOp>,
    pub terminator: Terminator,
}

/// A complete emitted function
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub blocks: Vec<IrBlock>,
    pub entry: IrBlockId,
    /// Kind of every allocated value, indexed by value number
    pub value_kinds: Vec<ValueKind>,
    /// Frame slot of stack index zero (locals plus cells)
    pub stack_base: u32,
}

impl IrFunction {
    pub fn new(name: impl Into<String>, stack_base: u32) -> Self {
        IrFunction {
            name: name.into(),
            blocks: vec![],
            entry: IrBlockId(0),
            value_kinds: vec![],
            stack_base,
        }
    }

    /// Allocate a fresh value
    pub fn alloc_value(&mut self, kind: ValueKind) -> Value {
        let value = Value(self.value_kinds.len() as u32);
        self.value_kinds.push(kind);
        value
    }

    pub fn value_kind(&self, value: Value) -> ValueKind {
        self.value_kinds[value.0 as usize]
    }

    pub fn value_count(&self) -> usize {
        self.value_kinds.len()
    }

    /// Create a new empty block
    pub fn add_block(&mut self, label: impl Into<String>) -> IrBlockId {
        let id = IrBlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock {
            id,
            label: label.into(),
            ops: vec![],
            terminator: Terminator::None,
        });
        id
    }

    pub fn block(&self, id: IrBlockId) -> &IrBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: IrBlockId) -> &mut IrBlock {
        &mut self.blocks[id.index()]
    }

    /// Total number of operations across all blocks
    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|b| b.ops.len()).sum()
    }

    /// Iterate every operation in block order
    pub fn ops(&self) -> impl Iterator<Item = &IrOp> {
        self.blocks.iter().flat_map(|b| b.ops.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_blocks() {
        let mut func = IrFunction::new("f", 3);
        let a = func.alloc_value(ValueKind::Word);
        let b = func.alloc_value(ValueKind::Flag);
        assert_eq!(a, Value(0));
        assert_eq!(func.value_kind(b), ValueKind::Flag);

        let entry = func.add_block("entry");
        let exit = func.add_block("exit");
        func.block_mut(entry).ops.push(IrOp::Iconst { dest: a, value: 7 });
        func.block_mut(entry).terminator = Terminator::Jump(exit);
        assert_eq!(func.op_count(), 1);
        assert_eq!(func.block(entry).terminator.successors(), vec![exit]);
    }

    #[test]
    fn test_op_dest() {
        let v = Value(4);
        assert_eq!(IrOp::LoadLocal { dest: v, slot: 0 }.dest(), Some(v));
        assert_eq!(IrOp::IncRef { value: v }.dest(), None);
        let call = IrOp::Call { dest: None, helper: Helper::BlockPop, args: vec![v] };
        assert_eq!(call.dest(), None);
    }

    #[test]
    fn test_dispatch_successors() {
        let term = Terminator::Dispatch {
            selector: Value(0),
            default: IrBlockId(1),
            targets: vec![IrBlockId(3), IrBlockId(5)],
        };
        assert_eq!(term.successors(), vec![IrBlockId(1), IrBlockId(3), IrBlockId(5)]);
    }
}
