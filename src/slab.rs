//! Generation-checked object pool.
//!
//! Kernel objects that come and go at runtime (timers, semaphores, mutexes,
//! event records) live in fixed-capacity [`Slab`]s and are referred to by
//! [`Handle`]s. A handle carries the generation of the slot it was issued
//! for; once the slot is freed and reused, stale handles stop resolving
//! instead of aliasing the new occupant.

/// Index plus generation of a slab slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u16,
    generation: u16,
}

impl Handle {
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(&self) -> u16 {
        self.generation
    }
}

enum Entry<T> {
    Vacant { next_free: Option<u16> },
    Occupied(T),
}

struct Slot<T> {
    generation: u16,
    entry: Entry<T>,
}

/// Fixed-capacity pool of `T` addressed by [`Handle`].
pub struct Slab<T, const N: usize> {
    slots: [Slot<T>; N],
    /// Head of the list of freed slots.
    free: Option<u16>,
    /// Slots at or above this index have never been handed out.
    untouched: u16,
    len: usize,
}

impl<T, const N: usize> Slab<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: [const {
                Slot {
                    generation: 0,
                    entry: Entry::Vacant { next_free: None },
                }
            }; N],
            free: None,
            untouched: 0,
            len: 0,
        }
    }

    /// Store `value`, returning its handle, or give the value back if the
    /// pool is full.
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        let index = match self.free {
            Some(index) => {
                let slot = &self.slots[index as usize];
                self.free = match slot.entry {
                    Entry::Vacant { next_free } => next_free,
                    Entry::Occupied(_) => crate::error::fatal("slab free list corrupted", file!(), line!()),
                };
                index
            }
            None if (self.untouched as usize) < N => {
                self.untouched += 1;
                self.untouched - 1
            }
            None => return Err(value),
        };

        let slot = &mut self.slots[index as usize];
        slot.entry = Entry::Occupied(value);
        self.len += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Remove and return the value behind `handle`. Stale handles yield
    /// `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index()];
        let entry = core::mem::replace(
            &mut slot.entry,
            Entry::Vacant {
                next_free: self.free,
            },
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.free = Some(handle.index);
        self.len -= 1;
        match entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index())?;
        match &slot.entry {
            Entry::Occupied(value) if slot.generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index())?;
        match &mut slot.entry {
            Entry::Occupied(value) if slot.generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Handle of the live entry at `index`, if any.
    pub fn handle_at(&self, index: usize) -> Option<Handle> {
        let slot = self.slots.get(index)?;
        match slot.entry {
            Entry::Occupied(_) => Some(Handle {
                index: index as u16,
                generation: slot.generation,
            }),
            Entry::Vacant { .. } => None,
        }
    }

    /// Entry at `index` regardless of generation. For intrusive structures
    /// that only link live entries.
    pub(crate) fn at(&self, index: usize) -> Option<&T> {
        match &self.slots.get(index)?.entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    pub(crate) fn at_mut(&mut self, index: usize) -> Option<&mut T> {
        match &mut self.slots.get_mut(index)?.entry {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Iterate over live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match &slot.entry {
            Entry::Occupied(value) => Some((
                Handle {
                    index: index as u16,
                    generation: slot.generation,
                },
                value,
            )),
            Entry::Vacant { .. } => None,
        })
    }
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut slab: Slab<u32, 4> = Slab::new();
        let a = slab.insert(10).unwrap();
        let b = slab.insert(20).unwrap();
        assert_eq!(slab.get(a), Some(&10));
        assert_eq!(slab.get(b), Some(&20));
        assert_eq!(slab.len(), 2);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut slab: Slab<u32, 2> = Slab::new();
        let a = slab.insert(1).unwrap();
        assert_eq!(slab.remove(a), Some(1));
        let b = slab.insert(2).unwrap();
        assert_eq!(a.index(), b.index(), "freed slot should be reused");
        assert_eq!(slab.get(a), None, "stale handle must not alias the new value");
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.get(b), Some(&2));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut slab: Slab<u8, 2> = Slab::new();
        slab.insert(1).unwrap();
        slab.insert(2).unwrap();
        assert_eq!(slab.insert(3), Err(3));
    }

    #[test]
    fn test_iter_skips_vacant() {
        let mut slab: Slab<char, 4> = Slab::new();
        let a = slab.insert('a').unwrap();
        slab.insert('b').unwrap();
        slab.insert('c').unwrap();
        slab.remove(a);
        let live: Vec<char> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec!['b', 'c']);
    }
}
