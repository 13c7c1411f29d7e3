//! # Loader
//!
//! Turns caller buffers into segment lists. Every variant feeds physical
//! ranges into one [`Segmenter`], which coalesces greedily under the owning
//! tag's constraints:
//!
//! ```text
//!   page walk ─► (pa, va, len) ─┬─► extends last segment?  ─► grow
//!                               └─► otherwise              ─► new segment
//! ```
//!
//! A range extends the last segment only when it continues it physically
//! *and* virtually, the segment is below the per-segment maximum and the range
//! does not start on a boundary multiple.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::context::BusDma;
use crate::iommu;
use crate::md::MdId;
use crate::segment::{Segment, SegmentStore};
use crate::tag::Constraints;
use crate::{BusDmaError, ContiguousAlloc, DmaFlags, PageTableWalker};
use alloc::vec::Vec;
use core::fmt;
use log::{debug, trace};

/// Address space a virtual buffer lives in.
#[derive(Copy, Clone)]
pub enum AddressSpace<'a> {
    /// Translated by the context's own walker.
    Kernel,
    /// Translated by the given walker, e.g. a user process's page tables.
    User(&'a dyn PageTableWalker),
}

impl fmt::Debug for AddressSpace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => f.write_str("Kernel"),
            Self::User(_) => f.write_str("User"),
        }
    }
}

/// One entry of an I/O vector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoVec {
    pub base: VirtualAddress,
    pub len: u64,
}

impl IoVec {
    #[must_use]
    pub const fn new(base: VirtualAddress, len: u64) -> Self {
        Self { base, len }
    }
}

/// A scattered buffer within one address space.
#[derive(Copy, Clone, Debug)]
pub struct IoVector<'a> {
    pub space: AddressSpace<'a>,
    pub vectors: &'a [IoVec],
}

/// Greedy segment builder bound to one tag's constraints.
///
/// Segments taken from the store must be handed back through either
/// [`finish`](Self::finish) or [`abort`](Self::abort).
pub(crate) struct Segmenter<'s> {
    constraints: Constraints,
    store: &'s SegmentStore,
    flags: DmaFlags,
    segments: Vec<Segment>,
    total: u64,
}

impl<'s> Segmenter<'s> {
    pub const fn new(constraints: Constraints, store: &'s SegmentStore, flags: DmaFlags) -> Self {
        Self {
            constraints,
            store,
            flags,
            segments: Vec::new(),
            total: 0,
        }
    }

    /// Bytes accepted so far.
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Append the physical range `[phys, phys + len)`, optionally backed by
    /// the CPU range starting at `virt`.
    pub fn push(
        &mut self,
        phys: PhysicalAddress,
        virt: Option<VirtualAddress>,
        len: u64,
    ) -> Result<(), BusDmaError> {
        if len == 0 {
            return Ok(());
        }

        let c = &self.constraints;
        let last = phys
            .as_u64()
            .checked_add(len - 1)
            .ok_or(BusDmaError::InvalidArgument("physical range wraps"))?;
        if phys.as_u64() < c.min_addr || last > c.max_addr {
            return Err(BusDmaError::InvalidArgument(
                "buffer lies outside the tag's address window",
            ));
        }
        self.total = self
            .total
            .checked_add(len)
            .filter(|&t| t <= c.max_transfer)
            .ok_or(BusDmaError::InvalidArgument("buffer exceeds max_transfer"))?;

        let boundary_mask = c.boundary - 1;
        let max_size = c.max_segment_size;
        let max_segments = c.max_segments;

        let mut pa = phys.as_u64();
        let mut va = virt;
        let mut remaining = len;
        while remaining > 0 {
            let to_boundary = c.boundary - (pa & boundary_mask);

            let extendable = self.segments.last_mut().filter(|seg| {
                seg.size() < max_size && pa & boundary_mask != 0 && continues(seg, pa, va)
            });

            let step = if let Some(seg) = extendable {
                let n = remaining.min(max_size - seg.size()).min(to_boundary);
                seg.grow(n);
                trace!("segment {}: coalesced {n:#x} bytes at PA {pa:#x}", seg.index());
                n
            } else {
                if self.segments.len() >= max_segments {
                    return Err(BusDmaError::InvalidArgument(
                        "buffer needs more than max_segments segments",
                    ));
                }
                self.segments
                    .try_reserve(1)
                    .map_err(|_| BusDmaError::OutOfMemory)?;
                let mut seg = self.store.alloc(self.flags)?;
                let n = remaining.min(max_size).min(to_boundary);
                seg.fill(self.segments.len(), PhysicalAddress::new(pa), va, n);
                trace!("segment {}: new at PA {pa:#x}, {n:#x} bytes", seg.index());
                self.segments.push(seg);
                n
            };

            remaining -= step;
            pa = pa.wrapping_add(step);
            va = va.and_then(|v| v.checked_add(step));
        }
        Ok(())
    }

    /// Hand the built list over to the descriptor.
    pub fn finish(self) -> Vec<Segment> {
        self.segments
    }

    /// Return every segment taken so far to the store.
    pub fn abort(self) {
        self.store.free(self.segments.len());
    }
}

/// Whether `(pa, va)` is the immediate successor of `seg`.
fn continues(seg: &Segment, pa: u64, va: Option<VirtualAddress>) -> bool {
    let phys = seg.phys_addr().as_u64().checked_add(seg.size()) == Some(pa);
    let virt = match (seg.virt_addr(), va) {
        (None, None) => true,
        (Some(prev), Some(next)) => prev.checked_add(seg.size()) == Some(next),
        _ => false,
    };
    phys && virt
}

/// Feed the virtual range `[va, va + len)` page by page.
pub(crate) fn push_linear(
    seg: &mut Segmenter<'_>,
    walker: &dyn PageTableWalker,
    page_size: u64,
    va: VirtualAddress,
    len: u64,
) -> Result<(), BusDmaError> {
    if len == 0 {
        return Err(BusDmaError::InvalidArgument("zero-length buffer"));
    }
    va.checked_add(len - 1)
        .ok_or(BusDmaError::InvalidArgument("buffer wraps the address space"))?;

    let mut va = va;
    let mut remaining = len;
    loop {
        let chunk = (page_size - va.page_offset(page_size)).min(remaining);
        let pa = walker
            .translate(va)
            .ok_or(BusDmaError::InvalidArgument("buffer is not mapped"))?;
        seg.push(pa, Some(va), chunk)?;

        remaining -= chunk;
        if remaining == 0 {
            return Ok(());
        }
        va = va + chunk;
    }
}

impl<W: PageTableWalker, A: ContiguousAlloc> BusDma<W, A> {
    /// Build the segment list of an empty `md` with `fill`, then map it.
    pub(crate) fn load_with<F>(
        &self,
        md: MdId,
        flags: DmaFlags,
        operation: &'static str,
        fill: F,
    ) -> Result<(), BusDmaError>
    where
        F: FnOnce(&mut Segmenter<'_>) -> Result<(), BusDmaError>,
    {
        let flags = flags.sanitized(operation);
        let devices = self.devices.read();
        let tags = self.tags.read();
        let mut mds = self.lock_mds(flags)?;
        let node = mds.get_mut(md)?;
        if node.flags.allocated() || node.flags.loaded() {
            return Err(BusDmaError::InvalidArgument("descriptor is already loaded"));
        }

        let constraints = tags.get(node.tag)?.constraints;
        let mut segmenter = Segmenter::new(constraints, &self.segments, flags);
        if let Err(e) = fill(&mut segmenter) {
            debug!("{operation}: {md:?} not loaded: {e}");
            segmenter.abort();
            return Err(e);
        }

        let total = segmenter.total();
        node.segments = segmenter.finish();
        node.flags.set_loaded(true);
        debug!(
            "{operation}: {md:?} loaded {total:#x} bytes in {} segments",
            node.segments.len()
        );

        iommu::map(&devices, node.device, &mut node.segments, &mut node.map_depth)?;
        node.flags.set_mapped(true);
        Ok(())
    }

    /// Load a virtually contiguous buffer.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown or non-empty descriptor,
    ///   zero length, unmapped pages, or a buffer the tag cannot describe.
    /// - [`BusDmaError::OutOfMemory`]: the segment store is exhausted.
    /// - [`BusDmaError::DeviceMappingFailure`]: a bus could not map the
    ///   segments; the descriptor stays loaded and must be unloaded.
    pub fn md_load_linear(
        &self,
        md: MdId,
        space: AddressSpace<'_>,
        va: VirtualAddress,
        len: u64,
        flags: DmaFlags,
    ) -> Result<(), BusDmaError> {
        let walker: &dyn PageTableWalker = match space {
            AddressSpace::Kernel => &self.walker,
            AddressSpace::User(w) => w,
        };
        let page_size = self.config.page_size;
        self.load_with(md, flags, "md_load_linear", |seg| {
            push_linear(seg, walker, page_size, va, len)
        })
    }

    /// Load a physically contiguous buffer. Segments carry no CPU address.
    ///
    /// # Errors
    /// As [`md_load_linear`](Self::md_load_linear), without the page walk.
    pub fn md_load_physical(
        &self,
        md: MdId,
        pa: PhysicalAddress,
        len: u64,
        flags: DmaFlags,
    ) -> Result<(), BusDmaError> {
        self.load_with(md, flags, "md_load_physical", |seg| {
            if len == 0 {
                return Err(BusDmaError::InvalidArgument("zero-length buffer"));
            }
            seg.push(pa, None, len)
        })
    }

    /// Load a scattered buffer; zero-length entries are skipped.
    ///
    /// # Errors
    /// As [`md_load_linear`](Self::md_load_linear); a vector with no bytes
    /// at all is [`BusDmaError::InvalidArgument`].
    pub fn md_load_uio(
        &self,
        md: MdId,
        uio: &IoVector<'_>,
        flags: DmaFlags,
    ) -> Result<(), BusDmaError> {
        let walker: &dyn PageTableWalker = match uio.space {
            AddressSpace::Kernel => &self.walker,
            AddressSpace::User(w) => w,
        };
        let page_size = self.config.page_size;
        self.load_with(md, flags, "md_load_uio", |seg| {
            for iov in uio.vectors.iter().filter(|v| v.len != 0) {
                push_linear(seg, walker, page_size, iov.base, iov.len)?;
            }
            if seg.total() == 0 {
                return Err(BusDmaError::InvalidArgument("empty I/O vector"));
            }
            Ok(())
        })
    }
}
