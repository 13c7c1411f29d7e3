//! # Constraint Tags
//!
//! A tag describes what a piece of hardware can address. Tags form a tree
//! rooted at the most permissive tag of a context; every derived tag is at
//! least as restrictive as its base in every field.
//!
//! ```text
//!            root (0 ..= u64::MAX, align 1, unbounded)
//!             │
//!     ┌───────┴────────┐
//!   bus tag         nic tag  (max_addr 4 GiB)
//!     │                │
//!   ahci tag        rx ring profile (align 64, 1 segment)
//! ```
//!
//! Tags are immutable once created. They are kept in an arena and referred to
//! by [`TagId`]; a child stores its parent's handle and the parent keeps the
//! list of its children so destruction can refuse while dependents exist.

use crate::arena::{Arena, Handle};
use crate::device::DeviceId;
use crate::{BusDmaError, DmaFlags};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, warn};
use utils_narrow_derive::Narrow;

/// Largest power of two representable in a `u64`; "unlimited" for sizes.
pub const MAX_POW2_SIZE: u64 = 1 << 63;

/// Handle of a tag within its [`BusDma`](crate::BusDma) context.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TagId(pub(crate) Handle);

/// The addressing constraints carried by a tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Narrow)]
pub struct Constraints {
    /// Lowest reachable address (inclusive).
    #[narrow(max)]
    pub min_addr: u64,
    /// Highest reachable address (inclusive).
    #[narrow(min)]
    pub max_addr: u64,
    /// Required alignment, a power of two.
    #[narrow(max)]
    pub align: u64,
    /// Power of two no segment may straddle.
    #[narrow(min)]
    pub boundary: u64,
    /// Largest total transfer.
    #[narrow(min)]
    pub max_transfer: u64,
    /// Most segments one descriptor may hold.
    #[narrow(min)]
    pub max_segments: usize,
    /// Largest single segment.
    #[narrow(min)]
    pub max_segment_size: u64,
    /// Sustained transfer rate limit.
    #[narrow(min)]
    pub rate: u64,
}

impl Constraints {
    /// The constraints of a context's root tag.
    pub const UNRESTRICTED: Self = Self {
        min_addr: 0,
        max_addr: u64::MAX,
        align: 1,
        boundary: MAX_POW2_SIZE,
        max_transfer: MAX_POW2_SIZE,
        max_segments: usize::MAX,
        max_segment_size: MAX_POW2_SIZE,
        rate: u64::MAX,
    };

    /// Narrow `self` (the base) by `requested`.
    ///
    /// Every field takes the stricter of the two values. A single-segment
    /// result sets the per-segment limit to the transfer limit. The transfer
    /// limit only shrinks where the base's per-segment limit is smaller.
    #[must_use]
    pub fn narrow(&self, requested: &Self) -> Self {
        let mut c = self.narrowed_by(requested);
        if c.max_segments == 1 {
            c.max_transfer = c.max_transfer.min(self.max_segment_size);
            c.max_segment_size = c.max_transfer;
        }
        c
    }

    /// Whether any address can satisfy the window.
    #[inline]
    #[must_use]
    pub const fn is_satisfiable(&self) -> bool {
        self.min_addr <= self.max_addr
    }
}

/// Requested constraints for [`tag_create`](crate::BusDma::tag_create) and
/// [`tag_derive`](crate::BusDma::tag_derive).
///
/// Starts out unrestricted; every field not set inherits the base tag's value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TagRequest {
    pub align: u64,
    pub boundary: u64,
    pub max_addr: u64,
    pub max_transfer: u64,
    pub max_segments: usize,
    pub max_segment_size: u64,
    pub rate: u64,
    pub flags: DmaFlags,
}

impl Default for TagRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl TagRequest {
    #[must_use]
    pub const fn new() -> Self {
        let u = Constraints::UNRESTRICTED;
        Self {
            align: u.align,
            boundary: u.boundary,
            max_addr: u.max_addr,
            max_transfer: u.max_transfer,
            max_segments: u.max_segments,
            max_segment_size: u.max_segment_size,
            rate: u.rate,
            flags: DmaFlags::new(),
        }
    }

    #[must_use]
    pub const fn with_align(mut self, value: u64) -> Self {
        self.align = value;
        self
    }

    #[must_use]
    pub const fn with_boundary(mut self, value: u64) -> Self {
        self.boundary = value;
        self
    }

    #[must_use]
    pub const fn with_max_addr(mut self, value: u64) -> Self {
        self.max_addr = value;
        self
    }

    #[must_use]
    pub const fn with_max_transfer(mut self, value: u64) -> Self {
        self.max_transfer = value;
        self
    }

    #[must_use]
    pub const fn with_max_segments(mut self, value: usize) -> Self {
        self.max_segments = value;
        self
    }

    #[must_use]
    pub const fn with_max_segment_size(mut self, value: u64) -> Self {
        self.max_segment_size = value;
        self
    }

    #[must_use]
    pub const fn with_rate(mut self, value: u64) -> Self {
        self.rate = value;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, value: DmaFlags) -> Self {
        self.flags = value;
        self
    }

    /// Validate and normalize into a [`Constraints`] record.
    ///
    /// - `align == 0` is normalized to 1 (inherit the base alignment).
    /// - `boundary == 0` and `rate == 0` mean "no limit" (inherit).
    /// - Zero sizes or segment counts are rejected.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] on a non power-of-two alignment or
    /// boundary, or a zero size/segment limit.
    pub fn to_constraints(&self) -> Result<Constraints, BusDmaError> {
        let align = match self.align {
            0 => {
                debug!("tag request: alignment 0 normalized to 1");
                1
            }
            a if a.is_power_of_two() => a,
            _ => return Err(BusDmaError::InvalidArgument("alignment is not a power of two")),
        };

        let boundary = match self.boundary {
            0 => MAX_POW2_SIZE,
            b if b.is_power_of_two() => b,
            _ => return Err(BusDmaError::InvalidArgument("boundary is not a power of two")),
        };

        if self.max_transfer == 0 {
            return Err(BusDmaError::InvalidArgument("max_transfer is zero"));
        }
        if self.max_segments == 0 {
            return Err(BusDmaError::InvalidArgument("max_segments is zero"));
        }
        if self.max_segment_size == 0 {
            return Err(BusDmaError::InvalidArgument("max_segment_size is zero"));
        }

        Ok(Constraints {
            min_addr: 0,
            max_addr: self.max_addr,
            align,
            boundary,
            max_transfer: self.max_transfer,
            max_segments: self.max_segments,
            max_segment_size: self.max_segment_size,
            rate: if self.rate == 0 { u64::MAX } else { self.rate },
        })
    }
}

/// Read-only snapshot of a tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    id: TagId,
    constraints: Constraints,
    parent: Option<TagId>,
    device: Option<DeviceId>,
}

impl Tag {
    #[must_use]
    pub const fn id(&self) -> TagId {
        self.id
    }

    #[must_use]
    pub const fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// The base tag; `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<TagId> {
        self.parent
    }

    /// Owning device; `None` for the root.
    #[must_use]
    pub const fn device(&self) -> Option<DeviceId> {
        self.device
    }

    #[must_use]
    pub const fn max_address(&self) -> u64 {
        self.constraints.max_addr
    }
}

pub(crate) struct TagNode {
    pub constraints: Constraints,
    pub parent: Option<TagId>,
    pub device: Option<DeviceId>,
    pub children: Vec<TagId>,
    /// Descriptors created against this tag and not yet destroyed.
    pub md_count: AtomicUsize,
}

/// All tags of a context plus the device → primary tag registry.
pub(crate) struct TagArena {
    tags: Arena<TagNode>,
    root: TagId,
    primary: BTreeMap<DeviceId, TagId>,
}

impl TagArena {
    pub fn new(capacity: usize) -> Result<Self, BusDmaError> {
        let mut tags = Arena::new(capacity);
        let root = TagId(tags.insert(TagNode {
            constraints: Constraints::UNRESTRICTED,
            parent: None,
            device: None,
            children: Vec::new(),
            md_count: AtomicUsize::new(0),
        })?);
        Ok(Self {
            tags,
            root,
            primary: BTreeMap::new(),
        })
    }

    pub const fn root(&self) -> TagId {
        self.root
    }

    pub fn get(&self, id: TagId) -> Result<&TagNode, BusDmaError> {
        self.tags
            .get(id.0)
            .ok_or(BusDmaError::InvalidArgument("unknown tag"))
    }

    pub fn snapshot(&self, id: TagId) -> Result<Tag, BusDmaError> {
        let node = self.get(id)?;
        Ok(Tag {
            id,
            constraints: node.constraints,
            parent: node.parent,
            device: node.device,
        })
    }

    pub fn primary_of(&self, device: DeviceId) -> Option<TagId> {
        self.primary.get(&device).copied()
    }

    /// Number of tags besides the root.
    pub const fn derived_count(&self) -> usize {
        self.tags.len() - 1
    }

    /// Insert a tag narrowed from `base` by `request`.
    pub fn insert_narrowed(
        &mut self,
        base: TagId,
        request: &TagRequest,
        device: Option<DeviceId>,
    ) -> Result<TagId, BusDmaError> {
        let requested = request.to_constraints()?;
        let base_node = self.get(base)?;
        let constraints = base_node.constraints.narrow(&requested);
        debug_assert!(constraints.is_within(&base_node.constraints));

        if !constraints.is_satisfiable() {
            warn!(
                "tag: address window {:#x}..={:#x} is empty; loads against it will fail",
                constraints.min_addr, constraints.max_addr
            );
        }

        // Reserve the parent's child slot first so nothing needs unwinding.
        self.tags
            .get_mut(base.0)
            .ok_or(BusDmaError::InvalidArgument("unknown tag"))?
            .children
            .try_reserve(1)
            .map_err(|_| BusDmaError::OutOfMemory)?;

        let id = TagId(self.tags.insert(TagNode {
            constraints,
            parent: Some(base),
            device,
            children: Vec::new(),
            md_count: AtomicUsize::new(0),
        })?);

        if let Some(parent) = self.tags.get_mut(base.0) {
            parent.children.push(id);
        }
        Ok(id)
    }

    /// Callers check [`primary_of`](Self::primary_of) first.
    pub fn register_primary(&mut self, device: DeviceId, tag: TagId) {
        let previous = self.primary.insert(device, tag);
        debug_assert!(previous.is_none(), "{device:?} already owns a primary tag");
    }

    pub fn remove(&mut self, id: TagId) -> Result<(), BusDmaError> {
        if id == self.root {
            return Err(BusDmaError::InvalidArgument("the root tag cannot be destroyed"));
        }

        let node = self.get(id)?;
        if !node.children.is_empty() {
            return Err(BusDmaError::ResourceBusy("tag has derived tags"));
        }
        if node.md_count.load(Ordering::Acquire) != 0 {
            return Err(BusDmaError::ResourceBusy("tag has mapping descriptors"));
        }

        let Some(node) = self.tags.remove(id.0) else {
            return Err(BusDmaError::InvalidArgument("unknown tag"));
        };
        if let Some(parent) = node.parent.and_then(|p| self.tags.get_mut(p.0)) {
            parent.children.retain(|&c| c != id);
        }
        if let Some(device) = node.device
            && self.primary.get(&device) == Some(&id)
        {
            self.primary.remove(&device);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(req: TagRequest) -> Constraints {
        req.to_constraints().unwrap()
    }

    #[test]
    fn narrowing_takes_the_stricter_value() {
        let base = Constraints::UNRESTRICTED.narrow(&c(TagRequest::new()
            .with_align(16)
            .with_max_addr(0xFFFF_FFFF)
            .with_boundary(0x1_0000)
            .with_max_transfer(0x10_0000)
            .with_max_segments(32)
            .with_max_segment_size(0x1_0000)
            .with_rate(1000)));

        let t = base.narrow(&c(TagRequest::new()
            .with_align(4)
            .with_max_addr(0xFFFF_FFFF_FFFF)
            .with_boundary(0x1000)
            .with_max_transfer(0x20_0000)
            .with_max_segments(8)
            .with_max_segment_size(0x2000)
            .with_rate(5000)));

        assert_eq!(t.align, 16);
        assert_eq!(t.max_addr, 0xFFFF_FFFF);
        assert_eq!(t.boundary, 0x1000);
        assert_eq!(t.max_transfer, 0x10_0000);
        assert_eq!(t.max_segments, 8);
        assert_eq!(t.max_segment_size, 0x2000);
        assert_eq!(t.rate, 1000);
        assert!(t.is_within(&base));
    }

    #[test]
    fn single_segment_collapses_segment_size_to_transfer() {
        let t = Constraints::UNRESTRICTED.narrow(&c(TagRequest::new()
            .with_max_transfer(4096)
            .with_max_segments(1)
            .with_max_segment_size(65536)));
        assert_eq!(t.max_segment_size, 4096);
        assert_eq!(t.max_transfer, 4096);
    }

    #[test]
    fn single_segment_keeps_the_requested_transfer() {
        let t = Constraints::UNRESTRICTED.narrow(&c(TagRequest::new()
            .with_max_transfer(65536)
            .with_max_segments(1)
            .with_max_segment_size(4096)));
        assert_eq!(t.max_transfer, 65536);
        assert_eq!(t.max_segment_size, 65536);
        assert!(t.is_within(&Constraints::UNRESTRICTED));
    }

    #[test]
    fn single_segment_never_loosens_segment_size() {
        let base = Constraints::UNRESTRICTED.narrow(&c(TagRequest::new()
            .with_max_transfer(65536)
            .with_max_segments(4)
            .with_max_segment_size(4096)));
        let t = base.narrow(&c(TagRequest::new().with_max_segments(1)));
        assert_eq!(t.max_segment_size, 4096);
        assert_eq!(t.max_transfer, 4096);
        assert!(t.is_within(&base));
    }

    #[test]
    fn derived_profile_keeps_collapsed_base_limits() {
        let base = Constraints::UNRESTRICTED.narrow(&c(TagRequest::new()
            .with_align(1)
            .with_max_transfer(4096)
            .with_max_segments(1)
            .with_max_segment_size(4096)));
        let t = base.narrow(&c(TagRequest::new()
            .with_align(64)
            .with_max_segment_size(8192)
            .with_max_segments(4)));
        assert_eq!(t.align, 64);
        assert_eq!(t.max_segment_size, 4096);
        assert_eq!(t.max_segments, 1);
    }

    #[test]
    fn zero_alignment_is_normalized_not_propagated() {
        let base = Constraints::UNRESTRICTED.narrow(&c(TagRequest::new().with_align(128)));
        let t = base.narrow(&c(TagRequest::new().with_align(0)));
        assert_eq!(t.align, 128);
    }

    #[test]
    fn rejects_non_power_of_two_alignment_and_boundary() {
        assert!(TagRequest::new().with_align(3).to_constraints().is_err());
        assert!(TagRequest::new().with_boundary(0x3000).to_constraints().is_err());
        assert!(TagRequest::new().with_max_segments(0).to_constraints().is_err());
        assert!(TagRequest::new().with_max_transfer(0).to_constraints().is_err());
        assert!(TagRequest::new().with_max_segment_size(0).to_constraints().is_err());
    }

    #[test]
    fn derived_never_looser_than_base_across_combinations() {
        let aligns = [0u64, 1, 8, 4096];
        let sizes = [1u64, 512, 4096, MAX_POW2_SIZE];
        let segs = [1usize, 2, 64, usize::MAX];
        let addrs = [0u64, 0xFFFF, u64::MAX];

        let mut bases = Vec::new();
        for &a in &aligns {
            for &s in &sizes {
                for &n in &segs {
                    bases.push(Constraints::UNRESTRICTED.narrow(&c(TagRequest::new()
                        .with_align(a)
                        .with_max_transfer(s)
                        .with_max_segment_size(s.max(4096))
                        .with_max_segments(n))));
                }
            }
        }

        for base in &bases {
            for &a in &aligns {
                for &s in &sizes {
                    for &n in &segs {
                        for &m in &addrs {
                            let t = base.narrow(&c(TagRequest::new()
                                .with_align(a)
                                .with_max_addr(m)
                                .with_max_transfer(s)
                                .with_max_segment_size(s)
                                .with_max_segments(n)));
                            assert!(t.is_within(base), "{t:?} looser than {base:?}");
                            if t.max_segments == 1 {
                                assert_eq!(t.max_segment_size, t.max_transfer);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn arena_refuses_to_drop_tags_with_children() {
        let mut arena = TagArena::new(8).unwrap();
        let root = arena.root();
        let a = arena.insert_narrowed(root, &TagRequest::new(), None).unwrap();
        let b = arena.insert_narrowed(a, &TagRequest::new(), None).unwrap();

        assert!(matches!(arena.remove(a), Err(BusDmaError::ResourceBusy(_))));
        arena.remove(b).unwrap();
        arena.remove(a).unwrap();
        assert_eq!(arena.derived_count(), 0);
        assert!(matches!(arena.remove(root), Err(BusDmaError::InvalidArgument(_))));
    }

    #[test]
    fn arena_refuses_to_drop_tags_with_descriptors() {
        let mut arena = TagArena::new(4).unwrap();
        let t = arena
            .insert_narrowed(arena.root(), &TagRequest::new(), None)
            .unwrap();
        arena.get(t).unwrap().md_count.fetch_add(1, Ordering::AcqRel);
        assert!(matches!(arena.remove(t), Err(BusDmaError::ResourceBusy(_))));
        arena.get(t).unwrap().md_count.fetch_sub(1, Ordering::AcqRel);
        assert!(arena.remove(t).is_ok());
    }

    #[test]
    fn tag_capacity_exhaustion_is_out_of_memory() {
        let mut arena = TagArena::new(2).unwrap();
        let root = arena.root();
        arena.insert_narrowed(root, &TagRequest::new(), None).unwrap();
        assert_eq!(
            arena.insert_narrowed(root, &TagRequest::new(), None),
            Err(BusDmaError::OutOfMemory)
        );
    }
}
