//! # Block Allocator
//!
//! Fixed-arena first-fit allocator with block coalescing. Backs the
//! database: value slots and stream ring buffers are carved out of one
//! `HEAP_SIZE` arena owned by the kernel.
//!
//! ## Layout
//!
//! ```text
//! ┌────────┬──────────────┬────────┬──────────┬────────┬───────────────┐
//! │ header │ payload      │ header │ payload  │ header │ payload (free)│
//! └────────┴──────────────┴────────┴──────────┴────────┴───────────────┘
//! ```
//!
//! Each header is one little-endian word: bit 31 marks the block as used,
//! the low bits hold the payload size. Payload sizes are multiples of four
//! so headers stay word-aligned. Freeing a block merges every run of
//! adjacent free blocks.

const HEADER: usize = 4;
const ALIGN: usize = 4;
const USED: u32 = 1 << 31;

/// An allocated region of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    offset: u32,
    len: u32,
}

impl HeapBlock {
    /// Number of bytes requested at allocation time.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[repr(C, align(4))]
struct Arena<const N: usize>([u8; N]);

/// First-fit heap over an inline arena of `N` bytes.
pub struct Heap<const N: usize> {
    arena: Arena<N>,
    formatted: bool,
    used_blocks: usize,
}

impl<const N: usize> Heap<N> {
    pub const fn new() -> Self {
        Self {
            arena: Arena([0; N]),
            formatted: false,
            used_blocks: 0,
        }
    }

    fn header(&self, at: usize) -> (usize, bool) {
        let raw = u32::from_le_bytes([
            self.arena.0[at],
            self.arena.0[at + 1],
            self.arena.0[at + 2],
            self.arena.0[at + 3],
        ]);
        ((raw & !USED) as usize, raw & USED != 0)
    }

    fn write_header(&mut self, at: usize, size: usize, used: bool) {
        let raw = size as u32 | if used { USED } else { 0 };
        self.arena.0[at..at + HEADER].copy_from_slice(&raw.to_le_bytes());
    }

    fn format(&mut self) {
        if !self.formatted {
            let usable = (N - HEADER) & !(ALIGN - 1);
            self.write_header(0, usable, false);
            self.formatted = true;
        }
    }

    /// Header offsets of every block, in address order.
    fn blocks(&self) -> impl Iterator<Item = (usize, usize, bool)> + '_ {
        let mut at = 0;
        core::iter::from_fn(move || {
            if !self.formatted || at + HEADER > N {
                return None;
            }
            let (size, used) = self.header(at);
            let here = at;
            at += HEADER + size;
            Some((here, size, used))
        })
    }

    /// Allocate `len` zeroed bytes, first fit. Returns `None` when no free
    /// block is large enough.
    pub fn alloc(&mut self, len: usize) -> Option<HeapBlock> {
        self.format();
        let need = (len.max(1) + ALIGN - 1) & !(ALIGN - 1);

        let (at, size) = self
            .blocks()
            .find(|&(_, size, used)| !used && size >= need)
            .map(|(at, size, _)| (at, size))?;

        if size - need >= HEADER + ALIGN {
            self.write_header(at + HEADER + need, size - need - HEADER, false);
            self.write_header(at, need, true);
        } else {
            self.write_header(at, size, true);
        }

        let payload = at + HEADER;
        self.arena.0[payload..payload + len].fill(0);
        self.used_blocks += 1;
        Some(HeapBlock {
            offset: payload as u32,
            len: len as u32,
        })
    }

    /// Return `block` to the heap and coalesce free neighbours.
    ///
    /// Freeing a block twice is a fatal assertion.
    pub fn free(&mut self, block: HeapBlock) {
        let at = block.offset as usize - HEADER;
        let (size, used) = self.header(at);
        crate::kernel_assert!(used && size >= block.len(), "heap block freed twice or corrupted");
        self.write_header(at, size, false);
        self.used_blocks -= 1;
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut at = 0;
        while at + HEADER <= N {
            let (size, used) = self.header(at);
            if !used {
                let next = at + HEADER + size;
                if next + HEADER <= N {
                    let (next_size, next_used) = self.header(next);
                    if !next_used {
                        self.write_header(at, size + HEADER + next_size, false);
                        continue;
                    }
                }
            }
            at += HEADER + size;
        }
    }

    pub fn bytes(&self, block: &HeapBlock) -> &[u8] {
        let start = block.offset as usize;
        &self.arena.0[start..start + block.len()]
    }

    pub fn bytes_mut(&mut self, block: &HeapBlock) -> &mut [u8] {
        let start = block.offset as usize;
        &mut self.arena.0[start..start + block.len()]
    }

    /// Number of blocks currently allocated.
    #[inline]
    pub fn used_blocks(&self) -> usize {
        self.used_blocks
    }

    /// Total payload bytes available in free blocks.
    pub fn free_bytes(&self) -> usize {
        if !self.formatted {
            return (N - HEADER) & !(ALIGN - 1);
        }
        self.blocks().filter(|b| !b.2).map(|b| b.1).sum()
    }

    /// Largest single allocation that would currently succeed.
    pub fn largest_free(&self) -> usize {
        if !self.formatted {
            return (N - HEADER) & !(ALIGN - 1);
        }
        self.blocks().filter(|b| !b.2).map(|b| b.1).max().unwrap_or(0)
    }
}

impl<const N: usize> Default for Heap<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_and_split() {
        let mut heap: Heap<256> = Heap::new();
        let a = heap.alloc(10).unwrap();
        let b = heap.alloc(20).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(heap.used_blocks(), 2);
        // 12 + 20 payload plus three headers out of 252 usable
        assert_eq!(heap.free_bytes(), 252 - 12 - 20 - 2 * HEADER);
        heap.bytes_mut(&b).copy_from_slice(&[0xAB; 20]);
        assert!(heap.bytes(&a).iter().all(|&x| x == 0));
    }

    #[test]
    fn test_coalesce_restores_full_arena() {
        let mut heap: Heap<128> = Heap::new();
        let full = heap.largest_free();
        let a = heap.alloc(16).unwrap();
        let b = heap.alloc(16).unwrap();
        let c = heap.alloc(16).unwrap();
        heap.free(b);
        heap.free(a);
        heap.free(c);
        assert_eq!(heap.used_blocks(), 0);
        assert_eq!(heap.largest_free(), full, "all blocks should merge back");
    }

    #[test]
    fn test_reuse_freed_hole() {
        let mut heap: Heap<128> = Heap::new();
        let a = heap.alloc(16).unwrap();
        let _b = heap.alloc(16).unwrap();
        heap.free(a);
        let c = heap.alloc(8).unwrap();
        assert_eq!(c.offset, a.offset, "first fit should take the first hole");
    }

    #[test]
    fn test_exhaustion() {
        let mut heap: Heap<64> = Heap::new();
        assert!(heap.alloc(100).is_none());
        let a = heap.alloc(56).unwrap();
        assert!(heap.alloc(4).is_none());
        heap.free(a);
        assert!(heap.alloc(4).is_some());
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_is_fatal() {
        let mut heap: Heap<64> = Heap::new();
        let a = heap.alloc(8).unwrap();
        heap.free(a);
        heap.free(a);
    }
}
