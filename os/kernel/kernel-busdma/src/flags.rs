//! # Flag Words
//!
//! Bit-level flag sets shared by the public operations. They are plain
//! integers underneath so callers coming from a C-style interface can pass
//! raw values through [`DmaFlags::from_bits`].

use bitfield_struct::bitfield;
use core::ops::BitOr;
use log::warn;

/// Caller-supplied request flags (32-bit).
///
/// Layout (LSB→MSB):
/// - bit 0: zero-initialize allocated memory
/// - bit 1: do not block on a contended pool
/// - bits 2..=15: unused, must be zero
/// - bits 16..=31: platform-reserved; stripped with a diagnostic
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct DmaFlags {
    /// Zero the memory handed out by [`mem_alloc`](crate::BusDma::mem_alloc).
    pub zero: bool,

    /// Pool allocations must not spin on a contended lock.
    ///
    /// A contended MD pool or segment store then fails the call with
    /// [`OutOfMemory`](crate::BusDmaError::OutOfMemory) instead of waiting.
    pub nowait: bool,

    #[bits(14)]
    __: u16,

    /// Platform-reserved bits (16..=31). Never honored.
    #[bits(16)]
    pub platform_reserved: u16,
}

impl DmaFlags {
    /// Return a copy with platform-reserved bits cleared, logging if any were set.
    #[must_use]
    pub(crate) fn sanitized(self, operation: &'static str) -> Self {
        let reserved = self.platform_reserved();
        if reserved == 0 {
            return self;
        }

        warn!("{operation}: ignoring platform-reserved flag bits {reserved:#06x}");
        self.with_platform_reserved(0)
    }
}

/// State bits of a mapping descriptor.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct MdFlags {
    /// Backing memory was obtained by the allocator, not supplied by the caller.
    pub allocated: bool,
    /// The descriptor holds a populated segment list.
    pub loaded: bool,
    /// Every segment carries a valid bus address.
    pub mapped: bool,
    #[bits(5)]
    __: u8,
}

/// Cache synchronization operation, combinable as a bitset.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct SyncOp {
    /// Before the device writes memory the CPU will later read.
    pub pre_read: bool,
    /// Before the device reads memory the CPU has written.
    pub pre_write: bool,
    /// After the device wrote memory; the CPU is about to consume it.
    pub post_read: bool,
    /// After the device finished reading memory the CPU had written.
    pub post_write: bool,
    #[bits(4)]
    __: u8,
}

impl SyncOp {
    pub const PRE_READ: Self = Self::new().with_pre_read(true);
    pub const PRE_WRITE: Self = Self::new().with_pre_write(true);
    pub const POST_READ: Self = Self::new().with_post_read(true);
    pub const POST_WRITE: Self = Self::new().with_post_write(true);

    /// Whether CPU writes become visible to the device.
    #[inline]
    #[must_use]
    pub const fn publishes_cpu_writes(self) -> bool {
        self.pre_write()
    }

    /// Whether device writes become visible to the CPU.
    #[inline]
    #[must_use]
    pub const fn publishes_device_writes(self) -> bool {
        self.post_read()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.into_bits() == 0
    }
}

impl BitOr for SyncOp {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bits_are_stripped() {
        let raw = DmaFlags::from_bits(0xABCD_0001);
        assert!(raw.zero());
        assert_eq!(raw.platform_reserved(), 0xABCD);

        let clean = raw.sanitized("test");
        assert!(clean.zero());
        assert!(!clean.nowait());
        assert_eq!(clean.platform_reserved(), 0);
        assert_eq!(clean.into_bits(), 1);
    }

    #[test]
    fn clean_flags_pass_through() {
        let f = DmaFlags::new().with_nowait(true);
        assert_eq!(f.sanitized("test"), f);
    }

    #[test]
    fn sync_ops_combine() {
        let op = SyncOp::PRE_READ | SyncOp::PRE_WRITE;
        assert!(op.pre_read());
        assert!(op.pre_write());
        assert!(!op.post_read());
        assert!(op.publishes_cpu_writes());
        assert!(!op.publishes_device_writes());
        assert!(SyncOp::new().is_empty());
    }
}
