//! # Segments and the Segment Store
//!
//! A [`Segment`] is one contiguous, hardware-addressable chunk of a mapping.
//! Segments are drawn from a fixed-capacity [`SegmentStore`] shared by all
//! descriptors of a context; its population is the number of segments
//! currently attached to descriptors.

use crate::addresses::{BusAddress, PhysicalAddress, VirtualAddress};
use crate::{BusDmaError, DmaFlags};
use spin::{Mutex, MutexGuard};

/// One contiguous chunk of a mapping descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    index: usize,
    bus_addr: BusAddress,
    phys_addr: PhysicalAddress,
    virt_addr: Option<VirtualAddress>,
    size: u64,
}

impl Segment {
    const BLANK: Self = Self {
        index: 0,
        bus_addr: BusAddress::INVALID,
        phys_addr: PhysicalAddress::new(0),
        virt_addr: None,
        size: 0,
    };

    /// Position within the owning descriptor (0-based, contiguous).
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Device-visible address; [`BusAddress::INVALID`] until mapped.
    #[inline]
    #[must_use]
    pub const fn bus_addr(&self) -> BusAddress {
        self.bus_addr
    }

    #[inline]
    #[must_use]
    pub const fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// CPU address, present only for CPU-accessible mappings.
    #[inline]
    #[must_use]
    pub const fn virt_addr(&self) -> Option<VirtualAddress> {
        self.virt_addr
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Rewrite the bus address. Used by IOMMU hooks while mapping.
    #[inline]
    pub const fn set_bus_addr(&mut self, addr: BusAddress) {
        self.bus_addr = addr;
    }

    #[inline]
    pub(crate) const fn grow(&mut self, bytes: u64) {
        self.size += bytes;
    }

    pub(crate) const fn fill(
        &mut self,
        index: usize,
        phys_addr: PhysicalAddress,
        virt_addr: Option<VirtualAddress>,
        size: u64,
    ) {
        self.index = index;
        self.bus_addr = BusAddress::INVALID;
        self.phys_addr = phys_addr;
        self.virt_addr = virt_addr;
        self.size = size;
    }

    /// Whether `[addr, addr + len)` on the bus overlaps this segment.
    pub(crate) const fn overlaps_bus(&self, addr: BusAddress, len: u64) -> bool {
        let start = self.bus_addr.as_u64();
        let end = start.saturating_add(self.size);
        let w_start = addr.as_u64();
        let w_end = w_start.saturating_add(len);
        start < w_end && w_start < end
    }
}

/// Population counters of a [`SegmentStore`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentStoreStats {
    pub in_use: usize,
    pub capacity: usize,
}

/// Fixed-capacity segment pool.
pub struct SegmentStore {
    in_use: Mutex<usize>,
    capacity: usize,
}

impl SegmentStore {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            in_use: Mutex::new(0),
            capacity,
        }
    }

    fn lock(&self, flags: DmaFlags) -> Result<MutexGuard<'_, usize>, BusDmaError> {
        if flags.nowait() {
            self.in_use.try_lock().ok_or(BusDmaError::OutOfMemory)
        } else {
            Ok(self.in_use.lock())
        }
    }

    /// Take a blank segment out of the pool.
    ///
    /// # Errors
    /// [`BusDmaError::OutOfMemory`] when the pool is exhausted, or when it is
    /// contended and `flags` forbid waiting.
    pub fn alloc(&self, flags: DmaFlags) -> Result<Segment, BusDmaError> {
        let mut in_use = self.lock(flags)?;
        if *in_use >= self.capacity {
            return Err(BusDmaError::OutOfMemory);
        }
        *in_use += 1;
        Ok(Segment::BLANK)
    }

    /// Return `count` segments to the pool.
    pub fn free(&self, count: usize) {
        let mut in_use = self.in_use.lock();
        debug_assert!(count <= *in_use, "segment store underflow");
        *in_use = in_use.saturating_sub(count);
    }

    #[must_use]
    pub fn stats(&self) -> SegmentStoreStats {
        SegmentStoreStats {
            in_use: *self.in_use.lock(),
            capacity: self.capacity,
        }
    }
}
