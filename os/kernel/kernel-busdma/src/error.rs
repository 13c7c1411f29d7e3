/// Errors reported by the bus/DMA subsystem.
///
/// The `&'static str` payloads name the precondition that was violated; they
/// are meant for logs, not for matching.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BusDmaError {
    /// Null, zero-sized or mismatched inputs, or a call in the wrong state.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A pool or physical memory is exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// The object still has dependents (derived tags, descriptors, segments).
    #[error("resource busy: {0}")]
    ResourceBusy(&'static str),
    /// An IOMMU or bus translation step failed.
    #[error("device mapping failure: {0}")]
    DeviceMappingFailure(&'static str),
    /// The requested load variant is not available for this transport.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
