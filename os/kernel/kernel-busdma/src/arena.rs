//! Fixed-capacity slot arena with generation-checked handles.
//!
//! Tags and descriptors refer to each other by [`Handle`] instead of pointers.
//! A stale handle (slot freed and possibly reused) never resolves, because
//! every removal bumps the slot's generation.

use crate::BusDmaError;
use alloc::vec::Vec;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Handle {
    slot: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
}

impl<T> Arena<T> {
    pub const fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
        }
    }

    /// Store `value`, reusing a free slot when one exists.
    pub fn insert(&mut self, value: T) -> Result<Handle, BusDmaError> {
        if self.live >= self.capacity {
            return Err(BusDmaError::OutOfMemory);
        }

        let handle = if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            Handle {
                slot,
                generation: entry.generation,
            }
        } else {
            let slot = u32::try_from(self.slots.len()).map_err(|_| BusDmaError::OutOfMemory)?;
            self.slots
                .try_reserve(1)
                .map_err(|_| BusDmaError::OutOfMemory)?;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            Handle {
                slot,
                generation: 0,
            }
        };

        self.live += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let entry = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);

        // A slot that cannot be queued for reuse just stays empty.
        if self.free.try_reserve(1).is_ok() {
            self.free.push(handle.slot);
        }
        self.live -= 1;
        Some(value)
    }

    pub const fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_does_not_resolve() {
        let mut a = Arena::new(4);
        let h = a.insert(1u32).unwrap();
        assert_eq!(a.remove(h), Some(1));

        let h2 = a.insert(2u32).unwrap();
        assert_eq!(h.slot, h2.slot, "slot is reused");
        assert!(a.get(h).is_none());
        assert_eq!(a.get(h2), Some(&2));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut a = Arena::new(2);
        a.insert(()).unwrap();
        a.insert(()).unwrap();
        assert_eq!(a.insert(()), Err(BusDmaError::OutOfMemory));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn double_remove_is_none() {
        let mut a = Arena::new(1);
        let h = a.insert(7u8).unwrap();
        assert!(a.remove(h).is_some());
        assert!(a.remove(h).is_none());
        assert_eq!(a.len(), 0);
    }
}
