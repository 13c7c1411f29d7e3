//! # Device Tree
//!
//! Devices are attached under a parent bus and never move. Each node captures
//! its ancestry once at attach time, so the IOMMU bridge walks a fixed list
//! instead of chasing parent links while the topology might change.

use crate::BusDmaError;
use crate::iommu::BusHooks;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

/// Handle of a device within its [`BusDma`](crate::BusDma) context.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// The buses between a device and the root, captured at attach time.
///
/// The two traversal orders are deliberately separate:
///
/// - [`upward`](Self::upward): parent first, root last. Capability narrowing
///   (translate), synchronization and unmapping run this way.
/// - [`downward`](Self::downward): root first, parent last. Address rewriting
///   (map) runs this way, outermost translation first.
#[derive(Clone, Debug)]
pub struct Ancestry(Arc<[DeviceId]>);

impl Ancestry {
    #[must_use]
    pub fn upward(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn downward(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.0.iter().rev().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct DeviceNode {
    ancestry: Ancestry,
    hooks: Option<Box<dyn BusHooks>>,
}

#[derive(Default)]
pub(crate) struct DeviceTree {
    nodes: Vec<DeviceNode>,
}

impl DeviceTree {
    pub const fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add(
        &mut self,
        parent: Option<DeviceId>,
        hooks: Option<Box<dyn BusHooks>>,
    ) -> Result<DeviceId, BusDmaError> {
        let mut ancestry = Vec::new();
        if let Some(parent) = parent {
            let up = self.ancestry(parent)?;
            ancestry
                .try_reserve(up.len() + 1)
                .map_err(|_| BusDmaError::OutOfMemory)?;
            ancestry.push(parent);
            ancestry.extend(up.upward());
        }

        let id = DeviceId(u32::try_from(self.nodes.len()).map_err(|_| BusDmaError::OutOfMemory)?);
        self.nodes
            .try_reserve(1)
            .map_err(|_| BusDmaError::OutOfMemory)?;
        self.nodes.push(DeviceNode {
            ancestry: Ancestry(ancestry.into()),
            hooks,
        });
        Ok(id)
    }

    fn node(&self, id: DeviceId) -> Result<&DeviceNode, BusDmaError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(BusDmaError::InvalidArgument("unknown device"))
    }

    pub fn ancestry(&self, id: DeviceId) -> Result<Ancestry, BusDmaError> {
        self.node(id).map(|n| n.ancestry.clone())
    }

    pub fn hooks(&self, id: DeviceId) -> Option<&dyn BusHooks> {
        self.nodes.get(id.0 as usize)?.hooks.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_is_captured_parent_first() {
        let mut tree = DeviceTree::new();
        let root = tree.add(None, None).unwrap();
        let bridge = tree.add(Some(root), None).unwrap();
        let nic = tree.add(Some(bridge), None).unwrap();

        let a = tree.ancestry(nic).unwrap();
        assert_eq!(a.upward().collect::<Vec<_>>(), [bridge, root]);
        assert_eq!(a.downward().collect::<Vec<_>>(), [root, bridge]);
        assert!(tree.ancestry(root).unwrap().is_empty());
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut tree = DeviceTree::new();
        assert!(matches!(
            tree.add(Some(DeviceId(9)), None),
            Err(BusDmaError::InvalidArgument(_))
        ));
    }
}
