//! # Mapping Descriptors
//!
//! A mapping descriptor (MD) is the hardware view of one logical buffer: an
//! ordered list of [`Segment`]s plus state flags.
//!
//! ```text
//!   create ─► Empty ──load/alloc──► Loaded ──map──► Mapped ──sync──┐
//!               ▲                     │               │  ◄──────────┘
//!               └──────unload/free────┴───────────────┘
//!   destroy: only from Empty
//! ```

use crate::arena::{Arena, Handle};
use crate::device::DeviceId;
use crate::iommu::MapDepth;
use crate::segment::Segment;
use crate::tag::TagId;
use crate::{BusDmaError, MdFlags};
use alloc::vec::Vec;

/// Handle of a mapping descriptor within its [`BusDma`](crate::BusDma) context.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MdId(pub(crate) Handle);

/// Lifecycle state derived from [`MdFlags`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MdState {
    Empty,
    /// Segments attached, bus addresses not (or not all) valid.
    Loaded,
    Mapped,
}

pub(crate) struct MdNode {
    pub tag: TagId,
    /// Device whose bus ancestry maps this descriptor.
    pub device: Option<DeviceId>,
    pub flags: MdFlags,
    pub segments: Vec<Segment>,
    /// Bus levels holding translations, also after a failed map.
    pub map_depth: MapDepth,
}

impl MdNode {
    pub const fn new(tag: TagId, device: Option<DeviceId>) -> Self {
        Self {
            tag,
            device,
            flags: MdFlags::new(),
            segments: Vec::new(),
            map_depth: MapDepth::NONE,
        }
    }

    pub const fn state(&self) -> MdState {
        if self.flags.mapped() {
            MdState::Mapped
        } else if self.flags.loaded() {
            MdState::Loaded
        } else {
            MdState::Empty
        }
    }

    /// Detach every segment and reset the state bits.
    ///
    /// Returns how many segments go back to the store.
    pub fn clear(&mut self) -> usize {
        let n = self.segments.len();
        self.segments.clear();
        self.flags = MdFlags::new();
        self.map_depth = MapDepth::NONE;
        n
    }
}

pub(crate) struct MdPool {
    mds: Arena<MdNode>,
}

impl MdPool {
    pub const fn new(capacity: usize) -> Self {
        Self {
            mds: Arena::new(capacity),
        }
    }

    pub fn insert(&mut self, node: MdNode) -> Result<MdId, BusDmaError> {
        self.mds.insert(node).map(MdId)
    }

    pub fn get(&self, id: MdId) -> Result<&MdNode, BusDmaError> {
        self.mds
            .get(id.0)
            .ok_or(BusDmaError::InvalidArgument("unknown mapping descriptor"))
    }

    pub fn get_mut(&mut self, id: MdId) -> Result<&mut MdNode, BusDmaError> {
        self.mds
            .get_mut(id.0)
            .ok_or(BusDmaError::InvalidArgument("unknown mapping descriptor"))
    }

    pub fn remove(&mut self, id: MdId) -> Option<MdNode> {
        self.mds.remove(id.0)
    }

    pub const fn len(&self) -> usize {
        self.mds.len()
    }
}
