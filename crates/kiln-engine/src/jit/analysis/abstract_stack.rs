//! Reversed abstract stack for backward intra-block simulation
//!
//! Walking a block from its last instruction to its first, every slot of the
//! evaluation stack is tagged with the index of the instruction that will
//! consume it (its "definition site" as seen from the producer). A producer
//! reached later in the walk pops that tag to learn who reads its value.
//! Slots consumed by an instruction that needs a materialized value, and
//! slots that outlive the block, carry [`MUST_BE_PUSHED`].

/// Consumer tag for values that must live in a real stack slot
pub const MUST_BE_PUSHED: u32 = u32::MAX;

/// Abstract stack walked backward through one block
#[derive(Debug, Default)]
pub struct ReversedStack {
    /// Consumer tags, top of stack last
    slots: Vec<u32>,
    /// Net forward height change of the instructions walked so far
    height: i32,
    /// Index of the instruction being simulated
    now: u32,
}

impl ReversedStack {
    pub fn new(capacity: usize) -> Self {
        ReversedStack {
            slots: Vec::with_capacity(capacity * 2),
            height: 0,
            now: 0,
        }
    }

    /// Forget everything; the next block starts with every slot unclaimed
    pub fn reset(&mut self) {
        self.slots.clear();
        self.height = 0;
    }

    pub fn set_timestamp(&mut self, vpc: u32) {
        self.now = vpc;
    }

    /// Net forward stack effect of the simulated instructions
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Simulate a forward push; returns the consumer tag of the pushed value
    pub fn push(&mut self) -> u32 {
        self.height += 1;
        self.slots.pop().unwrap_or(MUST_BE_PUSHED)
    }

    /// Simulate a forward pop by the current instruction
    pub fn pop(&mut self) {
        self.height -= 1;
        self.slots.push(self.now);
    }

    /// Simulate a forward pop that requires a materialized operand
    pub fn pop_from_stack(&mut self) {
        self.height -= 1;
        self.slots.push(MUST_BE_PUSHED);
    }

    pub fn pop_n_from_stack(&mut self, n: u32) {
        for _ in 0..n {
            self.pop_from_stack();
        }
    }

    /// Simulate a read of the slot `depth` below the top without popping it
    pub fn fetch(&self, depth: u32) {
        debug_assert!(self.peek(depth) > self.now);
    }

    /// Inverse of a forward rotation moving the top item down to depth `n`
    pub fn rot_n(&mut self, n: u32) {
        let n = n as usize;
        if n < 2 {
            return;
        }
        self.ensure(n);
        let moved = self.slots.remove(self.slots.len() - n);
        self.slots.push(moved);
    }

    /// Inverse of a forward duplication of the top `n` items; each original
    /// keeps the later of its own consumer and its copy's consumer
    pub fn dup_n(&mut self, n: u32) {
        let n = n as usize;
        self.ensure(2 * n);
        let copies = self.slots.split_off(self.slots.len() - n);
        let base = self.slots.len() - n;
        for (i, copy) in copies.into_iter().enumerate() {
            let original = &mut self.slots[base + i];
            *original = (*original).max(copy);
        }
        self.height += n as i32;
    }

    fn peek(&self, depth: u32) -> u32 {
        let depth = depth as usize;
        if depth == 0 || depth > self.slots.len() {
            MUST_BE_PUSHED
        } else {
            self.slots[self.slots.len() - depth]
        }
    }

    /// Materialize unclaimed slots below the bottom so `n` slots are addressable
    fn ensure(&mut self, n: usize) {
        if self.slots.len() < n {
            let missing = n - self.slots.len();
            self.slots.splice(0..0, std::iter::repeat(MUST_BE_PUSHED).take(missing));
        }
    }
}
