//! # Bus/DMA Mapping
//!
//! Turns buffers into lists of hardware-addressable segments that respect
//! what a device can reach, and keeps them coherent with the CPU caches.
//!
//! ## Building blocks
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Tag           constraint tree (address window, alignment,    │
//! │               boundary, size/segment/rate limits)            │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ md_create / mem_alloc
//! ┌──────────────▼───────────────────────────────────────────────┐
//! │ Mapping Descriptor (MD)  ordered segments + state flags      │
//! └──────┬──────────────────────────────┬────────────────────────┘
//!        │ Loader                       │ Allocator
//!        │ (linear, physical, uio,      │ (fresh physically contiguous
//!        │  command block)              │  chunks)
//! ┌──────▼──────────────────────────────▼────────────────────────┐
//! │ Segment Store   fixed-capacity pool of segments              │
//! └──────────────────────────────────────────────────────────────┘
//!                │
//! ┌──────────────▼───────────────────────────────────────────────┐
//! │ IOMMU / Sync Bridge   per-bus hooks along the device ancestry│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A driver derives a [`Tag`] for its device, creates an MD against it,
//! populates it through the loader or the allocator, lets the bridge map it,
//! synchronizes around transfers and finally unloads (or frees) and destroys
//! it.
//!
//! ## Collaborators
//!
//! The subsystem does not own page tables or physical memory. It is handed:
//!
//! - a [`PageTableWalker`] for the kernel address space (and optionally one
//!   per user address space at load time),
//! - a [`ContiguousAlloc`] that hands out physically contiguous memory,
//! - [`BusHooks`] for every bus that translates or caches DMA traffic.
//!
//! ## Example
//!
//! ```rust
//! use kernel_busdma::*;
//!
//! struct Identity;
//! impl PageTableWalker for Identity {
//!     fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
//!         Some(PhysicalAddress::new(va.as_u64()))
//!     }
//! }
//!
//! struct NoMemory;
//! impl ContiguousAlloc for NoMemory {
//!     fn alloc_contiguous(&self, _req: &ContigRequest) -> Option<VirtualAddress> {
//!         None
//!     }
//!     fn free_contiguous(&self, _va: VirtualAddress, _size: u64) {}
//! }
//!
//! let dma = BusDma::new(BusDmaConfig::default(), Identity, NoMemory).unwrap();
//! let nic = dma.add_device(None, None).unwrap();
//! let tag = dma
//!     .tag_create(nic, &TagRequest::new().with_max_segment_size(4096))
//!     .unwrap();
//!
//! let md = dma.md_create(tag, DmaFlags::new()).unwrap();
//! dma.md_load_linear(md, AddressSpace::Kernel, VirtualAddress::new(0x1_0800), 6000, DmaFlags::new())
//!     .unwrap();
//! assert_eq!(dma.md_get_segment_count(md).unwrap(), 2);
//!
//! dma.md_unload(md).unwrap();
//! dma.md_destroy(md).unwrap();
//! dma.tag_destroy(tag).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod addresses;
mod arena;
mod command;
pub mod config;
mod context;
mod device;
mod error;
mod flags;
pub mod iommu;
mod load;
mod md;
mod mem;
mod segment;
mod tag;

pub use crate::addresses::{BusAddress, PhysicalAddress, VirtualAddress};
pub use crate::command::{CommandBlock, CommandData, CommandFunction, DataDirection, PhysicalRange};
pub use crate::config::{BusDmaConfig, info};
pub use crate::context::BusDma;
pub use crate::device::{Ancestry, DeviceId};
pub use crate::error::BusDmaError;
pub use crate::flags::{DmaFlags, MdFlags, SyncOp};
pub use crate::iommu::{BusHooks, MemConstraints, SyncWindow};
pub use crate::load::{AddressSpace, IoVec, IoVector};
pub use crate::md::{MdId, MdState};
pub use crate::segment::{Segment, SegmentStoreStats};
pub use crate::tag::{Constraints, MAX_POW2_SIZE, Tag, TagId, TagRequest};

/// Translates CPU virtual addresses of one address space to physical ones.
///
/// The kernel space walker is owned by the [`BusDma`] context; walkers of
/// other address spaces are passed per load through [`AddressSpace::User`].
pub trait PageTableWalker {
    /// Physical address backing `va`, or `None` if it is not mapped.
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}

/// Parameters of one physically contiguous allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ContigRequest {
    /// Bytes to allocate; a multiple of the cache line size.
    pub size: u64,
    /// Lowest acceptable physical address.
    pub min_addr: u64,
    /// Highest acceptable physical address (inclusive).
    pub max_addr: u64,
    /// Power-of-two alignment, at least one cache line.
    pub align: u64,
    /// Power of two the chunk must not straddle.
    pub boundary: u64,
    /// Hand out zeroed memory.
    pub zero: bool,
}

/// Source of physically contiguous, kernel-mapped memory.
///
/// Returned chunks must satisfy every field of the [`ContigRequest`] and be
/// mapped in the kernel address space so the [`BusDma`] walker can translate
/// them.
pub trait ContiguousAlloc {
    /// Allocate one chunk; `None` when the request cannot be satisfied.
    ///
    /// May block for a long time searching for suitable pages.
    fn alloc_contiguous(&self, req: &ContigRequest) -> Option<VirtualAddress>;

    /// Release a chunk previously returned for a request of `size` bytes.
    fn free_contiguous(&self, va: VirtualAddress, size: u64);
}

/// Align `x` up to the nearest multiple of `a` (a power of two).
///
/// Returns `None` if the result does not fit in a `u64`.
///
/// ```rust
/// # use kernel_busdma::align_up;
/// assert_eq!(align_up(0, 64), Some(0));
/// assert_eq!(align_up(1, 64), Some(64));
/// assert_eq!(align_up(4096, 64), Some(4096));
/// assert_eq!(align_up(u64::MAX, 64), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
