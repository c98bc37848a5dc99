//! Fixed-width bit sets.
//!
//! The ready queue uses a [`Bitmap`] of priorities and event records use one
//! of task ids. Both rely on the same O(1) primitives: set, clear,
//! emptiness, and lowest-set-bit, the last of which is the scheduling hot
//! path (`trailing_zeros` compiles to `RBIT`+`CLZ` on Cortex-M4).

/// A 32-bit set of small indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bitmap(u32);

/// Owner bitmap of an event record: one bit per task id.
pub type TaskSet = Bitmap;

impl Bitmap {
    /// Number of indices a bitmap can hold.
    pub const WIDTH: usize = 32;

    /// The empty set.
    pub const EMPTY: Bitmap = Bitmap(0);

    /// Set containing exactly `index`.
    #[inline]
    pub const fn single(index: usize) -> Self {
        Bitmap(1 << index)
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Bitmap(bits)
    }

    #[inline]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < Self::WIDTH);
        self.0 |= 1 << index;
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < Self::WIDTH);
        self.0 &= !(1 << index);
    }

    #[inline]
    pub const fn contains(&self, index: usize) -> bool {
        self.0 & (1 << index) != 0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn len(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest index in the set, if any.
    #[inline]
    pub const fn lowest(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    #[inline]
    pub const fn union(self, other: Bitmap) -> Bitmap {
        Bitmap(self.0 | other.0)
    }

    #[inline]
    pub const fn difference(self, other: Bitmap) -> Bitmap {
        Bitmap(self.0 & !other.0)
    }

    /// Iterate over the members, lowest index first.
    pub fn iter(&self) -> BitmapIter {
        BitmapIter(self.0)
    }
}

/// Iterator over the members of a [`Bitmap`], lowest first.
pub struct BitmapIter(u32);

impl Iterator for BitmapIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let index = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(index)
    }
}
