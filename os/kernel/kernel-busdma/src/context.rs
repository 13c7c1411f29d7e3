//! # Bus/DMA Context
//!
//! One [`BusDma`] holds everything a bus domain needs: the device tree, the
//! tag arena with its root tag, the MD pool and the segment store. Nothing is
//! global; a system with several independent DMA domains builds one context
//! per domain.
//!
//! ## Locking
//!
//! The arenas sit behind `spin` locks and are always taken in the order
//! devices → tags → descriptors → segments. A single tag's child list and a
//! single descriptor's segment list are owned by one caller at a time; the
//! locks make the pools safe to share, not concurrent loads of one MD
//! meaningful.

use crate::device::{DeviceId, DeviceTree};
use crate::iommu::{self, BusHooks, MemConstraints, SyncWindow};
use crate::md::{MdId, MdNode, MdPool, MdState};
use crate::segment::{Segment, SegmentStore, SegmentStoreStats};
use crate::tag::{Tag, TagArena, TagId, TagRequest};
use crate::{
    BusAddress, BusDmaConfig, BusDmaError, ContiguousAlloc, DmaFlags, MdFlags, PageTableWalker,
    PhysicalAddress, SyncOp, VirtualAddress,
};
use alloc::boxed::Box;
use core::sync::atomic::Ordering;
use log::debug;
use spin::{Mutex, MutexGuard, RwLock};

/// A bus/DMA domain.
pub struct BusDma<W: PageTableWalker, A: ContiguousAlloc> {
    pub(crate) config: BusDmaConfig,
    pub(crate) devices: RwLock<DeviceTree>,
    pub(crate) tags: RwLock<TagArena>,
    pub(crate) mds: Mutex<MdPool>,
    pub(crate) segments: SegmentStore,
    pub(crate) walker: W,
    pub(crate) allocator: A,
}

impl<W: PageTableWalker, A: ContiguousAlloc> BusDma<W, A> {
    /// Build a context with an empty device tree and a fresh root tag.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an inconsistent configuration,
    /// [`BusDmaError::OutOfMemory`] if the root tag cannot be stored.
    pub fn new(config: BusDmaConfig, walker: W, allocator: A) -> Result<Self, BusDmaError> {
        config.validate()?;
        let tags = TagArena::new(config.tag_capacity)?;
        debug!(
            "busdma: page {:#x}, cache line {}, {} segments, {} descriptors, {} tags",
            config.page_size,
            config.cache_line_size,
            config.segment_store_capacity,
            config.md_pool_capacity,
            config.tag_capacity
        );
        Ok(Self {
            config,
            devices: RwLock::new(DeviceTree::new()),
            tags: RwLock::new(tags),
            mds: Mutex::new(MdPool::new(config.md_pool_capacity)),
            segments: SegmentStore::new(config.segment_store_capacity),
            walker,
            allocator,
        })
    }

    /// Tear the context down.
    ///
    /// # Errors
    /// [`BusDmaError::ResourceBusy`] (handing the context back) while any
    /// descriptor or non-root tag is outstanding.
    pub fn shutdown(self) -> Result<(), (Self, BusDmaError)> {
        let busy = {
            let tags = self.tags.read();
            let mds = self.mds.lock();
            if mds.len() != 0 {
                Some(BusDmaError::ResourceBusy("mapping descriptors outstanding"))
            } else if tags.derived_count() != 0 {
                Some(BusDmaError::ResourceBusy("tags outstanding"))
            } else {
                None
            }
        };
        match busy {
            Some(e) => Err((self, e)),
            None => {
                debug!("busdma: shut down");
                Ok(())
            }
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BusDmaConfig {
        &self.config
    }

    #[must_use]
    pub const fn walker(&self) -> &W {
        &self.walker
    }

    #[must_use]
    pub const fn allocator(&self) -> &A {
        &self.allocator
    }

    #[must_use]
    pub fn segment_store_stats(&self) -> SegmentStoreStats {
        self.segments.stats()
    }

    pub(crate) fn lock_mds(&self, flags: DmaFlags) -> Result<MutexGuard<'_, MdPool>, BusDmaError> {
        if flags.nowait() {
            self.mds.try_lock().ok_or(BusDmaError::OutOfMemory)
        } else {
            Ok(self.mds.lock())
        }
    }

    // ---------------------------------------------------------------------
    // Devices
    // ---------------------------------------------------------------------

    /// Attach a device below `parent` (or as a root bus).
    ///
    /// `hooks` describe how the new device, acting as a bus, treats DMA from
    /// devices attached below it.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown parent.
    pub fn add_device(
        &self,
        parent: Option<DeviceId>,
        hooks: Option<Box<dyn BusHooks>>,
    ) -> Result<DeviceId, BusDmaError> {
        let id = self.devices.write().add(parent, hooks)?;
        debug!("busdma: attached {id:?} below {parent:?}");
        Ok(id)
    }

    /// The primary tag registered for `device`, if any.
    #[must_use]
    pub fn device_tag(&self, device: DeviceId) -> Option<TagId> {
        self.tags.read().primary_of(device)
    }

    /// Resolve allocation constraints for `device` along its bus ancestry.
    ///
    /// # Errors
    /// Whatever a bus hook reports, or [`BusDmaError::DeviceMappingFailure`]
    /// if the result is malformed.
    pub fn translate(
        &self,
        device: DeviceId,
        constraints: MemConstraints,
    ) -> Result<MemConstraints, BusDmaError> {
        let devices = self.devices.read();
        iommu::translate(
            &devices,
            Some(device),
            constraints,
            self.config.cache_line_size,
        )
    }

    // ---------------------------------------------------------------------
    // Tags
    // ---------------------------------------------------------------------

    /// The most permissive tag of this context.
    #[must_use]
    pub fn root_tag(&self) -> TagId {
        self.tags.read().root()
    }

    /// Create the primary tag of `device`.
    ///
    /// The base is the primary tag of the nearest ancestor that has one, or
    /// the root tag.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown device or malformed request.
    /// - [`BusDmaError::ResourceBusy`]: the device already owns a primary tag.
    /// - [`BusDmaError::OutOfMemory`]: the tag arena is full.
    pub fn tag_create(&self, device: DeviceId, request: &TagRequest) -> Result<TagId, BusDmaError> {
        let request = request.with_flags(request.flags.sanitized("tag_create"));
        let devices = self.devices.read();
        let ancestry = devices.ancestry(device)?;
        let mut tags = self.tags.write();

        if tags.primary_of(device).is_some() {
            return Err(BusDmaError::ResourceBusy("device already owns a primary tag"));
        }

        let base = ancestry
            .upward()
            .find_map(|bus| tags.primary_of(bus))
            .unwrap_or_else(|| tags.root());

        let id = tags.insert_narrowed(base, &request, Some(device))?;
        tags.register_primary(device, id);

        debug!(
            "busdma: created {id:?} for {device:?} from {base:?}: {:?}",
            tags.get(id)?.constraints
        );
        Ok(id)
    }

    /// Derive an additional constraint profile under `base`.
    ///
    /// The new tag belongs to the same device as `base`.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown base or malformed request.
    /// - [`BusDmaError::OutOfMemory`]: the tag arena is full.
    pub fn tag_derive(&self, base: TagId, request: &TagRequest) -> Result<TagId, BusDmaError> {
        let request = request.with_flags(request.flags.sanitized("tag_derive"));
        let mut tags = self.tags.write();
        let device = tags.get(base)?.device;
        let id = tags.insert_narrowed(base, &request, device)?;
        debug!(
            "busdma: derived {id:?} from {base:?}: {:?}",
            tags.get(id)?.constraints
        );
        Ok(id)
    }

    /// Destroy a tag.
    ///
    /// # Errors
    /// - [`BusDmaError::ResourceBusy`]: derived tags or descriptors remain.
    /// - [`BusDmaError::InvalidArgument`]: unknown tag, or the root tag.
    pub fn tag_destroy(&self, tag: TagId) -> Result<(), BusDmaError> {
        self.tags.write().remove(tag)?;
        debug!("busdma: destroyed {tag:?}");
        Ok(())
    }

    /// Snapshot of a tag.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown tag.
    pub fn tag(&self, tag: TagId) -> Result<Tag, BusDmaError> {
        self.tags.read().snapshot(tag)
    }

    /// Highest address the tag's hardware can reach.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown tag.
    pub fn tag_max_address(&self, tag: TagId) -> Result<u64, BusDmaError> {
        Ok(self.tags.read().get(tag)?.constraints.max_addr)
    }

    // ---------------------------------------------------------------------
    // Mapping descriptors
    // ---------------------------------------------------------------------

    /// Create an empty descriptor against `tag`.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown tag.
    /// - [`BusDmaError::OutOfMemory`]: pool full, or contended under `nowait`.
    pub fn md_create(&self, tag: TagId, flags: DmaFlags) -> Result<MdId, BusDmaError> {
        let flags = flags.sanitized("md_create");
        let tags = self.tags.read();
        let node = tags.get(tag)?;
        let id = self.lock_mds(flags)?.insert(MdNode::new(tag, node.device))?;
        node.md_count.fetch_add(1, Ordering::AcqRel);
        debug!("busdma: created {id:?} on {tag:?}");
        Ok(id)
    }

    /// Destroy an empty descriptor.
    ///
    /// # Errors
    /// - [`BusDmaError::ResourceBusy`]: segments attached or backing memory
    ///   not freed.
    /// - [`BusDmaError::InvalidArgument`]: unknown descriptor.
    pub fn md_destroy(&self, md: MdId) -> Result<(), BusDmaError> {
        let tags = self.tags.read();
        let mut mds = self.mds.lock();
        let node = mds.get(md)?;
        if !node.segments.is_empty() || node.flags.allocated() {
            return Err(BusDmaError::ResourceBusy("descriptor still holds segments"));
        }

        let tag = node.tag;
        mds.remove(md);
        if let Ok(t) = tags.get(tag) {
            t.md_count.fetch_sub(1, Ordering::AcqRel);
        }
        debug!("busdma: destroyed {md:?}");
        Ok(())
    }

    /// Copy of segment `index` of `md`.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    ///
    /// # Panics
    /// If `index` is not below [`md_get_segment_count`](Self::md_get_segment_count).
    pub fn md_get_segment(&self, md: MdId, index: usize) -> Result<Segment, BusDmaError> {
        let mds = self.mds.lock();
        let segments = &mds.get(md)?.segments;
        assert!(
            index < segments.len(),
            "segment index {index} out of range ({} segments)",
            segments.len()
        );
        Ok(segments[index])
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn md_get_bus_addr(&self, md: MdId, index: usize) -> Result<BusAddress, BusDmaError> {
        self.md_get_segment(md, index).map(|s| s.bus_addr())
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn md_get_phys_addr(&self, md: MdId, index: usize) -> Result<PhysicalAddress, BusDmaError> {
        self.md_get_segment(md, index).map(|s| s.phys_addr())
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn md_get_virt_addr(
        &self,
        md: MdId,
        index: usize,
    ) -> Result<Option<VirtualAddress>, BusDmaError> {
        self.md_get_segment(md, index).map(|s| s.virt_addr())
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    ///
    /// # Panics
    /// If `index` is out of range.
    pub fn md_get_size(&self, md: MdId, index: usize) -> Result<u64, BusDmaError> {
        self.md_get_segment(md, index).map(|s| s.size())
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    pub fn md_get_flags(&self, md: MdId) -> Result<MdFlags, BusDmaError> {
        Ok(self.mds.lock().get(md)?.flags)
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    pub fn md_get_state(&self, md: MdId) -> Result<MdState, BusDmaError> {
        Ok(self.mds.lock().get(md)?.state())
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    pub fn md_get_segment_count(&self, md: MdId) -> Result<usize, BusDmaError> {
        Ok(self.mds.lock().get(md)?.segments.len())
    }

    /// # Errors
    /// [`BusDmaError::InvalidArgument`] for an unknown descriptor.
    pub fn md_get_tag(&self, md: MdId) -> Result<TagId, BusDmaError> {
        Ok(self.mds.lock().get(md)?.tag)
    }

    /// Unload a caller-supplied buffer: unmap, then release all segments.
    ///
    /// Teardown always completes; the descriptor is `Empty` afterwards even
    /// when an error is returned.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown, not loaded, or an
    ///   allocated descriptor (use [`mem_free`](Self::mem_free)).
    /// - The first unmap error, after teardown finished.
    pub fn md_unload(&self, md: MdId) -> Result<(), BusDmaError> {
        let devices = self.devices.read();
        let mut mds = self.mds.lock();
        let node = mds.get_mut(md)?;
        if node.flags.allocated() {
            return Err(BusDmaError::InvalidArgument(
                "allocated descriptor must be released with mem_free",
            ));
        }
        if !node.flags.loaded() {
            return Err(BusDmaError::InvalidArgument("descriptor is not loaded"));
        }

        let unmapped = if node.map_depth.is_none() {
            Ok(())
        } else {
            iommu::unmap(&devices, node.device, &mut node.segments, node.map_depth)
        };

        let released = node.clear();
        self.segments.free(released);
        debug!("busdma: unloaded {md:?} ({released} segments)");
        unmapped
    }

    // ---------------------------------------------------------------------
    // Synchronization
    // ---------------------------------------------------------------------

    /// Synchronize the whole descriptor.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown or unloaded descriptor,
    ///   empty operation.
    /// - Whatever a bus sync hook reports.
    pub fn sync(&self, md: MdId, op: SyncOp) -> Result<(), BusDmaError> {
        self.sync_window(md, op, SyncWindow::WHOLE)
    }

    /// Synchronize the bytes `[addr, addr + len)` of a mapped descriptor, in
    /// bus address terms.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown or unmapped descriptor,
    ///   empty operation or window, window outside the descriptor.
    /// - Whatever a bus sync hook reports.
    pub fn sync_range(
        &self,
        md: MdId,
        op: SyncOp,
        addr: BusAddress,
        len: u64,
    ) -> Result<(), BusDmaError> {
        if len == 0 {
            return Err(BusDmaError::InvalidArgument("empty sync window"));
        }
        self.sync_window(md, op, SyncWindow { addr, len })
    }

    fn sync_window(&self, md: MdId, op: SyncOp, window: SyncWindow) -> Result<(), BusDmaError> {
        if op.is_empty() {
            return Err(BusDmaError::InvalidArgument("empty sync operation"));
        }

        let devices = self.devices.read();
        let mds = self.mds.lock();
        let node = mds.get(md)?;
        if !node.flags.loaded() {
            return Err(BusDmaError::InvalidArgument("descriptor is not loaded"));
        }

        if window != SyncWindow::WHOLE {
            if !node.flags.mapped() {
                return Err(BusDmaError::InvalidArgument("descriptor is not mapped"));
            }
            if !node
                .segments
                .iter()
                .any(|s| s.overlaps_bus(window.addr, window.len))
            {
                return Err(BusDmaError::InvalidArgument("sync window outside descriptor"));
            }
        }

        iommu::sync(&devices, node.device, op, &node.segments, window)
    }
}
