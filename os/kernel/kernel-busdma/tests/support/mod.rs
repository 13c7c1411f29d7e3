//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use kernel_busdma::*;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Once};

/// Base of the simulated kernel direct map.
pub const DIRECT_MAP: u64 = 0xFFFF_8000_0000_0000;

/// Kernel walker for a direct map: `va = pa + offset`.
pub struct DirectMap {
    pub offset: u64,
}

impl PageTableWalker for DirectMap {
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        va.as_u64().checked_sub(self.offset).map(PhysicalAddress::new)
    }
}

/// Page-granular walker over an explicit page → frame table.
#[derive(Default)]
pub struct PageMap {
    pages: BTreeMap<u64, u64>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map the 4 KiB page at `va` to the frame at `pa`.
    pub fn map(mut self, va: u64, pa: u64) -> Self {
        self.pages.insert(va >> 12, pa >> 12);
        self
    }
}

impl PageTableWalker for PageMap {
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let frame = self.pages.get(&(va.as_u64() >> 12))?;
        Some(PhysicalAddress::new((frame << 12) | va.page_offset(4096)))
    }
}

#[derive(Default)]
struct SimState {
    next: u64,
    calls: usize,
    live: BTreeMap<u64, u64>,
    requests: Vec<ContigRequest>,
}

/// Bump allocator over simulated physical memory, handing out direct-map
/// addresses.
pub struct SimAlloc {
    state: Mutex<SimState>,
    /// Largest chunk that can be satisfied.
    pub max_chunk: u64,
    /// Fail every request after this many successful ones.
    pub fail_after: Option<usize>,
}

impl SimAlloc {
    pub fn new(base: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                next: base,
                ..SimState::default()
            }),
            max_chunk: u64::MAX,
            fail_after: None,
        }
    }

    pub fn with_max_chunk(mut self, max_chunk: u64) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    pub fn with_fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Bytes currently handed out.
    pub fn live_bytes(&self) -> u64 {
        self.state.lock().unwrap().live.values().sum()
    }

    pub fn live_chunks(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn requests(&self) -> Vec<ContigRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl ContiguousAlloc for SimAlloc {
    fn alloc_contiguous(&self, req: &ContigRequest) -> Option<VirtualAddress> {
        let mut s = self.state.lock().unwrap();
        s.requests.push(*req);
        if req.size > self.max_chunk || self.fail_after.is_some_and(|n| s.calls >= n) {
            return None;
        }

        let mask = !(req.boundary - 1);
        let mut pa = align_up(s.next.max(req.min_addr), req.align)?;
        if pa & mask != pa.checked_add(req.size - 1)? & mask {
            pa = align_up(pa, req.boundary)?;
        }
        if pa.checked_add(req.size - 1)? > req.max_addr {
            return None;
        }

        s.next = pa + req.size;
        s.calls += 1;
        s.live.insert(pa, req.size);
        Some(VirtualAddress::new(pa + DIRECT_MAP))
    }

    fn free_contiguous(&self, va: VirtualAddress, size: u64) {
        let pa = va.as_u64() - DIRECT_MAP;
        let freed = self.state.lock().unwrap().live.remove(&pa);
        assert_eq!(freed, Some(size), "free of {va:?} does not match an allocation");
    }
}

/// A context over the simulated direct map.
pub fn context(alloc: SimAlloc) -> BusDma<DirectMap, SimAlloc> {
    BusDma::new(BusDmaConfig::default(), DirectMap { offset: DIRECT_MAP }, alloc).unwrap()
}

/// Context with an allocator starting at 16 MiB.
pub fn default_context() -> BusDma<DirectMap, SimAlloc> {
    context(SimAlloc::new(0x100_0000))
}

/// Something a bus hook was asked to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Restrict { bus: &'static str, requester: DeviceId },
    Map { bus: &'static str, count: usize },
    Unmap { bus: &'static str, index: usize },
    Sync { bus: &'static str, op: SyncOp, window: SyncWindow },
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Bus hooks that record every call and optionally translate or fail.
pub struct RecordingBus {
    pub name: &'static str,
    pub log: EventLog,
    /// Added to every bus address while mapping.
    pub window_offset: u64,
    /// Clamp applied while restricting.
    pub max_addr: Option<u64>,
    /// Handle at most this many segments per map call.
    pub batch: usize,
    pub fail_map: bool,
    pub fail_unmap: bool,
    pub fail_sync: bool,
    /// Proposed alignment while restricting.
    pub align: Option<u64>,
}

impl RecordingBus {
    pub fn new(name: &'static str, log: &EventLog) -> Self {
        Self {
            name,
            log: Arc::clone(log),
            window_offset: 0,
            max_addr: None,
            batch: usize::MAX,
            fail_map: false,
            fail_unmap: false,
            fail_sync: false,
            align: None,
        }
    }

    pub fn boxed(self) -> Option<Box<dyn BusHooks>> {
        Some(Box::new(self))
    }

    fn record(&self, e: Event) {
        self.log.lock().unwrap().push(e);
    }
}

impl BusHooks for RecordingBus {
    fn restrict(
        &self,
        requester: DeviceId,
        constraints: &mut MemConstraints,
    ) -> Result<(), BusDmaError> {
        self.record(Event::Restrict {
            bus: self.name,
            requester,
        });
        if let Some(max) = self.max_addr {
            constraints.max_addr = max;
        }
        if let Some(align) = self.align {
            constraints.align = align;
        }
        Ok(())
    }

    fn map(&self, _requester: DeviceId, pending: &mut [Segment]) -> Result<usize, BusDmaError> {
        if self.fail_map {
            return Err(BusDmaError::ResourceBusy("translation table full"));
        }
        let n = pending.len().min(self.batch);
        for seg in &mut pending[..n] {
            seg.set_bus_addr(BusAddress::new(seg.bus_addr().as_u64() + self.window_offset));
        }
        self.record(Event::Map {
            bus: self.name,
            count: n,
        });
        Ok(n)
    }

    fn unmap(&self, _requester: DeviceId, segment: &Segment) -> Result<(), BusDmaError> {
        self.record(Event::Unmap {
            bus: self.name,
            index: segment.index(),
        });
        if self.fail_unmap {
            return Err(BusDmaError::DeviceMappingFailure("stale translation"));
        }
        Ok(())
    }

    fn sync(
        &self,
        _requester: DeviceId,
        op: SyncOp,
        _segments: &[Segment],
        window: SyncWindow,
    ) -> Result<(), BusDmaError> {
        self.record(Event::Sync {
            bus: self.name,
            op,
            window,
        });
        if self.fail_sync {
            return Err(BusDmaError::DeviceMappingFailure("cache flush timed out"));
        }
        Ok(())
    }
}

thread_local! {
    static CAPTURED: RefCell<Vec<(Level, String)>> = const { RefCell::new(Vec::new()) };
}

struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        CAPTURED.with(|c| {
            c.borrow_mut()
                .push((record.level(), record.args().to_string()));
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INIT: Once = Once::new();

/// Install the capture logger (once per test binary) and clear this thread's
/// records.
pub fn capture_logs() {
    INIT.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURED.with(|c| c.borrow_mut().clear());
}

/// Records captured on this thread since [`capture_logs`].
pub fn captured() -> Vec<(Level, String)> {
    CAPTURED.with(|c| c.borrow().clone())
}
