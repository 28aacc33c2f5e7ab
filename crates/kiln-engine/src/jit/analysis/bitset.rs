//! Fixed-size bit set over local-variable slots and instruction indices

use std::fmt;

type Chunk = u64;
const BITS_PER_CHUNK: usize = Chunk::BITS as usize;

/// A fixed-capacity set of small integers
#[derive(Clone, PartialEq, Eq, Default)]
pub struct BitSet {
    chunks: Vec<Chunk>,
    len: usize,
}

impl BitSet {
    /// Create an empty set able to hold `0..len`
    pub fn new(len: usize) -> Self {
        BitSet {
            chunks: vec![0; len.div_ceil(BITS_PER_CHUNK)],
            len,
        }
    }

    /// Create a set containing every element of `0..len`
    pub fn full(len: usize) -> Self {
        Self::prefix(len, len)
    }

    /// Create a set containing `0..n` with capacity `len`
    pub fn prefix(len: usize, n: usize) -> Self {
        let mut set = Self::new(len);
        let n = n.min(len);
        for (i, chunk) in set.chunks.iter_mut().enumerate() {
            let start = i * BITS_PER_CHUNK;
            if n >= start + BITS_PER_CHUNK {
                *chunk = Chunk::MAX;
            } else if n > start {
                *chunk = (1 << (n - start)) - 1;
            }
        }
        set
    }

    /// Capacity of the set
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the capacity is zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        self.chunks[index / BITS_PER_CHUNK] & Self::mask(index) != 0
    }

    pub fn set(&mut self, index: usize) {
        self.chunks[index / BITS_PER_CHUNK] |= Self::mask(index);
    }

    pub fn reset(&mut self, index: usize) {
        self.chunks[index / BITS_PER_CHUNK] &= !Self::mask(index);
    }

    /// Set `index` when `cond` holds; never clears
    pub fn set_if(&mut self, index: usize, cond: bool) {
        if cond {
            self.set(index);
        }
    }

    /// Set `index`, returning true if it was previously clear
    pub fn test_and_set(&mut self, index: usize) -> bool {
        let chunk = &mut self.chunks[index / BITS_PER_CHUNK];
        let was_clear = *chunk & Self::mask(index) == 0;
        *chunk |= Self::mask(index);
        was_clear
    }

    /// `self |= other`
    pub fn union_with(&mut self, other: &BitSet) {
        debug_assert_eq!(self.len, other.len);
        for (a, b) in self.chunks.iter_mut().zip(&other.chunks) {
            *a |= *b;
        }
    }

    /// `self &= other`, returning true if any bit changed
    pub fn intersect_with(&mut self, other: &BitSet) -> bool {
        debug_assert_eq!(self.len, other.len);
        let mut changed = false;
        for (a, b) in self.chunks.iter_mut().zip(&other.chunks) {
            let old = *a;
            *a &= *b;
            changed |= *a != old;
        }
        changed
    }

    /// `(self & !clear) | add`, the block transfer function of liveness
    pub fn transfer(&self, clear: &BitSet, add: &BitSet) -> BitSet {
        let chunks = self
            .chunks
            .iter()
            .zip(&clear.chunks)
            .zip(&add.chunks)
            .map(|((input, clear), add)| (input & !clear) | add)
            .collect();
        BitSet { chunks, len: self.len }
    }

    /// Number of elements in the set
    pub fn count(&self) -> usize {
        self.chunks.iter().map(|c| c.count_ones() as usize).sum()
    }

    /// Iterate the elements in increasing order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }

    fn mask(index: usize) -> Chunk {
        1 << (index % BITS_PER_CHUNK)
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (n, i) in self.iter().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", i)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_and_set() {
        let mut set = BitSet::new(10);
        assert!(set.test_and_set(3));
        assert!(!set.test_and_set(3));
        assert!(set.get(3));
        assert!(!set.get(4));
    }

    #[test]
    fn test_prefix_spans_chunks() {
        let set = BitSet::prefix(130, 70);
        assert_eq!(set.count(), 70);
        assert!(set.get(69));
        assert!(!set.get(70));
        assert_eq!(BitSet::full(130).count(), 130);
        assert_eq!(BitSet::prefix(3, 10).count(), 3);
    }

    #[test]
    fn test_intersect_reports_change() {
        let mut a = BitSet::full(8);
        let mut b = BitSet::new(8);
        b.set(1);
        b.set(5);
        assert!(a.intersect_with(&b));
        assert!(!a.intersect_with(&b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn test_transfer() {
        let input = BitSet::full(4);
        let mut touched = BitSet::new(4);
        touched.set(0);
        touched.set(1);
        let mut set = BitSet::new(4);
        set.set(1);
        let out = input.transfer(&touched, &set);
        assert_eq!(out.to_string(), "{1, 2, 3}");
    }

    #[test]
    fn test_empty_capacity() {
        let set = BitSet::full(0);
        assert!(set.is_empty());
        assert_eq!(set.count(), 0);
        assert_eq!(set.to_string(), "{}");
    }
}
