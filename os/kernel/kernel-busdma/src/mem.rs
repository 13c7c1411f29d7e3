//! # DMA Memory Allocator
//!
//! Obtains fresh, physically contiguous memory that satisfies a tag, and
//! wraps it in a descriptor that owns it. Allocation is all-or-nothing: if
//! the tag's transfer size cannot be covered, every chunk acquired so far is
//! returned before the call fails.
//!
//! Each chunk is requested at cache-line alignment and rounded up to whole
//! cache lines, so cache maintenance on one segment never touches bytes of
//! another buffer.

use crate::context::BusDma;
use crate::iommu::{self, MapDepth, MemConstraints};
use crate::md::{MdId, MdNode};
use crate::segment::Segment;
use crate::tag::{Constraints, TagId};
use crate::{
    BusDmaError, ContigRequest, ContiguousAlloc, DmaFlags, PageTableWalker, align_up,
};
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use log::{debug, error};

impl<W: PageTableWalker, A: ContiguousAlloc> BusDma<W, A> {
    /// Allocate memory for a whole transfer of `tag` and return a mapped
    /// descriptor owning it.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown tag.
    /// - [`BusDmaError::OutOfMemory`]: the memory, the segment store or the
    ///   descriptor pool ran out, or the transfer needs more segments than
    ///   the tag allows.
    /// - [`BusDmaError::DeviceMappingFailure`]: a bus rejected the
    ///   constraints or could not map the memory.
    pub fn mem_alloc(&self, tag: TagId, flags: DmaFlags) -> Result<MdId, BusDmaError> {
        let flags = flags.sanitized("mem_alloc");
        let devices = self.devices.read();
        let tags = self.tags.read();
        let tag_node = tags.get(tag)?;
        let constraints = tag_node.constraints;
        let device = tag_node.device;

        let mem = iommu::translate(
            &devices,
            device,
            MemConstraints::from(&constraints),
            self.config.cache_line_size,
        )?;

        let mut node = MdNode::new(tag, device);
        node.flags.set_allocated(true);
        let md = self.lock_mds(flags)?.insert(node)?;
        tag_node.md_count.fetch_add(1, Ordering::AcqRel);

        let mut segments = Vec::new();
        let mut depth = MapDepth::NONE;
        let built = self
            .alloc_chunks(&constraints, &mem, flags, &mut segments)
            .and_then(|()| iommu::map(&devices, device, &mut segments, &mut depth));

        if let Err(e) = built {
            debug!("mem_alloc: {tag:?} failed after {} chunks: {e}", segments.len());
            if !depth.is_none() {
                // Teardown errors are logged by the bridge.
                let _ = iommu::unmap(&devices, device, &mut segments, depth);
            }
            self.release_chunks(&segments);
            self.mds.lock().remove(md);
            tag_node.md_count.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        let count = segments.len();
        let mut mds = self.mds.lock();
        let node = mds.get_mut(md)?;
        node.segments = segments;
        node.map_depth = depth;
        node.flags.set_loaded(true);
        node.flags.set_mapped(true);
        debug!(
            "mem_alloc: {md:?} on {tag:?}: {:#x} bytes in {count} chunks",
            constraints.max_transfer
        );
        Ok(md)
    }

    /// Release the memory of an allocated descriptor.
    ///
    /// The descriptor is left empty and can be destroyed or reused. Teardown
    /// always completes.
    ///
    /// # Errors
    /// - [`BusDmaError::InvalidArgument`]: unknown descriptor, or one whose
    ///   memory was supplied by the caller (use
    ///   [`md_unload`](Self::md_unload)).
    /// - The first unmap error, after teardown finished.
    pub fn mem_free(&self, md: MdId) -> Result<(), BusDmaError> {
        let devices = self.devices.read();
        let mut mds = self.mds.lock();
        let node = mds.get_mut(md)?;
        if !node.flags.allocated() {
            return Err(BusDmaError::InvalidArgument(
                "descriptor does not own its memory; use md_unload",
            ));
        }

        let unmapped = if node.map_depth.is_none() {
            Ok(())
        } else {
            iommu::unmap(&devices, node.device, &mut node.segments, node.map_depth)
        };

        for seg in &node.segments {
            self.free_chunk(seg);
        }
        let released = node.clear();
        self.segments.free(released);
        debug!("mem_free: {md:?} released {released} chunks");
        unmapped
    }

    /// Acquire chunks until the tag's transfer size is covered.
    fn alloc_chunks(
        &self,
        c: &Constraints,
        mem: &MemConstraints,
        flags: DmaFlags,
        segments: &mut Vec<Segment>,
    ) -> Result<(), BusDmaError> {
        let cache_line = self.config.cache_line_size;
        let mut remaining = c.max_transfer;

        while remaining > 0 {
            if segments.len() >= c.max_segments {
                return Err(BusDmaError::OutOfMemory);
            }
            segments
                .try_reserve(1)
                .map_err(|_| BusDmaError::OutOfMemory)?;

            let chunk = remaining.min(c.max_segment_size).min(mem.boundary);
            let req = ContigRequest {
                size: align_up(chunk, cache_line).ok_or(BusDmaError::OutOfMemory)?,
                min_addr: mem.min_addr,
                max_addr: mem.max_addr,
                align: mem.align,
                boundary: mem.boundary,
                zero: flags.zero(),
            };

            let va = self
                .allocator
                .alloc_contiguous(&req)
                .ok_or(BusDmaError::OutOfMemory)?;
            let Some(pa) = self.walker.translate(va) else {
                error!("mem_alloc: allocator returned unmapped memory at {va:?}");
                self.allocator.free_contiguous(va, req.size);
                return Err(BusDmaError::InvalidArgument(
                    "allocated memory is not mapped in the kernel",
                ));
            };

            let mut seg = match self.segments.alloc(flags) {
                Ok(seg) => seg,
                Err(e) => {
                    self.allocator.free_contiguous(va, req.size);
                    return Err(e);
                }
            };
            seg.fill(segments.len(), pa, Some(va), chunk);
            segments.push(seg);
            remaining -= chunk;
        }
        Ok(())
    }

    /// Return the memory and the segment records of a partial allocation.
    fn release_chunks(&self, segments: &[Segment]) {
        for seg in segments {
            self.free_chunk(seg);
        }
        self.segments.free(segments.len());
    }

    fn free_chunk(&self, seg: &Segment) {
        let Some(va) = seg.virt_addr() else {
            return;
        };
        let size = align_up(seg.size(), self.config.cache_line_size).unwrap_or(seg.size());
        self.allocator.free_contiguous(va, size);
    }
}
