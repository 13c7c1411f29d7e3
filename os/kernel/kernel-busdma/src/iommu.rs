//! # IOMMU / Sync Bridge
//!
//! Every bus between a device and the root may sit behind an IOMMU or a
//! bridge with its own addressing rules. The bridge consults each bus's
//! [`BusHooks`] along the device's captured [`Ancestry`](crate::device::Ancestry):
//!
//! | Operation | Direction | Purpose |
//! |-----------|-----------|---------|
//! | [`translate`] | device → root | Each bus narrows the allocation constraints. |
//! | [`map`] | root → device | Bus addresses start as physical addresses and are rewritten outermost first. |
//! | [`unmap`] | device → root | Best effort: errors are collected, never abort. |
//! | [`sync`] | device → root | Cache maintenance; first error aborts. |
//!
//! A device without a bus (the root tag has no device) maps with bus address
//! equal to physical address.

use crate::addresses::BusAddress;
use crate::device::{DeviceId, DeviceTree};
use crate::segment::Segment;
use crate::tag::Constraints;
use crate::{BusDmaError, SyncOp};
use log::{error, trace};
use utils_narrow_derive::Narrow;

/// Per-bus hooks. Every method defaults to pass-through.
///
/// Hooks run while the context's pools are locked and must not call back
/// into the same [`BusDma`](crate::BusDma) context.
pub trait BusHooks: Send + Sync {
    /// Narrow allocation constraints for memory `requester` will access.
    ///
    /// Loosening a field has no effect; the bridge keeps the stricter value.
    ///
    /// # Errors
    /// Any error aborts the translation.
    fn restrict(
        &self,
        _requester: DeviceId,
        _constraints: &mut MemConstraints,
    ) -> Result<(), BusDmaError> {
        Ok(())
    }

    /// Rewrite the bus addresses of `pending`, the segments not processed yet.
    ///
    /// Returns how many leading segments of `pending` were handled; the bridge
    /// calls again with the remainder until the list is exhausted.
    ///
    /// # Errors
    /// Any error aborts the whole mapping and is reported to the caller as
    /// [`BusDmaError::DeviceMappingFailure`]; segments already rewritten keep
    /// their new bus address.
    fn map(&self, _requester: DeviceId, pending: &mut [Segment]) -> Result<usize, BusDmaError> {
        Ok(pending.len())
    }

    /// Release the translation of one segment.
    ///
    /// # Errors
    /// Reported, but the remaining segments are still unmapped.
    fn unmap(&self, _requester: DeviceId, _segment: &Segment) -> Result<(), BusDmaError> {
        Ok(())
    }

    /// Perform cache maintenance for `window` of `segments`.
    ///
    /// # Errors
    /// Any error aborts the synchronization.
    fn sync(
        &self,
        _requester: DeviceId,
        _op: SyncOp,
        _segments: &[Segment],
        _window: SyncWindow,
    ) -> Result<(), BusDmaError> {
        Ok(())
    }
}

/// Concrete allocation parameters, as resolved along the bus ancestry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Narrow)]
pub struct MemConstraints {
    #[narrow(max)]
    pub min_addr: u64,
    #[narrow(min)]
    pub max_addr: u64,
    #[narrow(max)]
    pub align: u64,
    #[narrow(min)]
    pub boundary: u64,
}

impl From<&Constraints> for MemConstraints {
    fn from(c: &Constraints) -> Self {
        Self {
            min_addr: c.min_addr,
            max_addr: c.max_addr,
            align: c.align,
            boundary: c.boundary,
        }
    }
}

/// Bus address window of a synchronization request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SyncWindow {
    pub addr: BusAddress,
    pub len: u64,
}

impl SyncWindow {
    /// Every byte of the descriptor.
    pub const WHOLE: Self = Self {
        addr: BusAddress::new(0),
        len: u64::MAX,
    };
}

/// Resolve `constraints` for memory used by `device`, then apply the
/// cache-line floor.
pub(crate) fn translate(
    tree: &DeviceTree,
    device: Option<DeviceId>,
    mut constraints: MemConstraints,
    cache_line: u64,
) -> Result<MemConstraints, BusDmaError> {
    if let Some(device) = device {
        for bus in tree.ancestry(device)?.upward() {
            let Some(hooks) = tree.hooks(bus) else {
                continue;
            };
            let mut proposed = constraints;
            hooks.restrict(device, &mut proposed)?;
            constraints = constraints.narrowed_by(&proposed);
        }
    }

    if !constraints.align.is_power_of_two() || !constraints.boundary.is_power_of_two() {
        return Err(BusDmaError::DeviceMappingFailure(
            "bus produced a non power-of-two alignment or boundary",
        ));
    }

    constraints.align = constraints.align.max(cache_line);
    Ok(constraints)
}

/// How many levels of a device's ancestry, counted from the root, hold
/// translations for a descriptor.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct MapDepth(usize);

impl MapDepth {
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Assign bus addresses to `segments` on behalf of `device`.
///
/// `depth` records every level that mapped at least one batch, also when a
/// deeper level fails afterwards.
pub(crate) fn map(
    tree: &DeviceTree,
    device: Option<DeviceId>,
    segments: &mut [Segment],
    depth: &mut MapDepth,
) -> Result<(), BusDmaError> {
    // Root of the hierarchy: the bus sees physical memory as is.
    for seg in segments.iter_mut() {
        seg.set_bus_addr(BusAddress::from(seg.phys_addr()));
    }

    let Some(device) = device else {
        return Ok(());
    };

    for (level, bus) in tree.ancestry(device)?.downward().enumerate() {
        let Some(hooks) = tree.hooks(bus) else {
            continue;
        };

        let mut next = 0;
        while next < segments.len() {
            let done = hooks.map(device, &mut segments[next..]).map_err(|e| {
                error!("map: {bus:?} failed at segment {next} for {device:?}: {e}");
                match e {
                    BusDmaError::DeviceMappingFailure(_) => e,
                    _ => BusDmaError::DeviceMappingFailure("bus could not map the segments"),
                }
            })?;
            if done == 0 {
                return Err(BusDmaError::DeviceMappingFailure("bus mapped no segments"));
            }
            *depth = MapDepth(level + 1);
            trace!("map: {bus:?} translated segments {next}..{} for {device:?}", next + done);
            next = next.saturating_add(done);
        }
    }
    Ok(())
}

/// Release the translations of `segments` on the levels `depth` reached;
/// best effort.
///
/// Returns the first error seen after every bus has seen every segment.
pub(crate) fn unmap(
    tree: &DeviceTree,
    device: Option<DeviceId>,
    segments: &mut [Segment],
    depth: MapDepth,
) -> Result<(), BusDmaError> {
    let mut first = None;

    if let Some(device) = device {
        match tree.ancestry(device) {
            Ok(ancestry) => {
                let skip = ancestry.len().saturating_sub(depth.0);
                for bus in ancestry.upward().skip(skip) {
                    let Some(hooks) = tree.hooks(bus) else {
                        continue;
                    };
                    for seg in segments.iter() {
                        if let Err(e) = hooks.unmap(device, seg) {
                            error!("unmap: {bus:?} failed on segment {}: {e}", seg.index());
                            first.get_or_insert(e);
                        }
                    }
                }
            }
            Err(e) => {
                error!("unmap: no ancestry for {device:?}: {e}");
                first = Some(e);
            }
        }
    }

    for seg in segments.iter_mut() {
        seg.set_bus_addr(BusAddress::INVALID);
    }
    first.map_or(Ok(()), Err)
}

/// Run the sync hooks of every bus above `device`, then report the affected
/// ranges for inspection.
pub(crate) fn sync(
    tree: &DeviceTree,
    device: Option<DeviceId>,
    op: SyncOp,
    segments: &[Segment],
    window: SyncWindow,
) -> Result<(), BusDmaError> {
    if let Some(device) = device {
        for bus in tree.ancestry(device)?.upward() {
            if let Some(hooks) = tree.hooks(bus) {
                hooks.sync(device, op, segments, window)?;
            }
        }
    }

    if op.publishes_cpu_writes() || op.publishes_device_writes() {
        for seg in segments
            .iter()
            .filter(|s| window == SyncWindow::WHOLE || s.overlaps_bus(window.addr, window.len))
        {
            trace!(
                "sync {op:?}: segment {} bus {:?} virt {:?} len {:#x}",
                seg.index(),
                seg.bus_addr(),
                seg.virt_addr(),
                seg.size()
            );
        }
    }
    Ok(())
}
