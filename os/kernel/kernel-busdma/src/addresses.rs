//! # Address Kinds
//!
//! A DMA mapping juggles three address spaces for the same bytes:
//!
//! | Type | Seen by | Notes |
//! |------|---------|-------|
//! | [`VirtualAddress`] | the CPU | Only present for CPU-accessible buffers. |
//! | [`PhysicalAddress`] | the memory controller | Result of the page-table walk. |
//! | [`BusAddress`] | the device | Physical address rewritten by every IOMMU on the path. |
//!
//! All three are zero-cost `u64` newtypes so they cannot be mixed up by
//! accident.

use core::fmt;
use core::ops::Add;

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Add `rhs` bytes, or `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Byte offset inside a `page_size` page (power of two).
            #[inline]
            #[must_use]
            pub const fn page_offset(self, page_size: u64) -> u64 {
                self.0 & (page_size - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
    };
}

address_type!(
    /// CPU virtual address of a buffer.
    VirtualAddress,
    "VA"
);

address_type!(
    /// Physical (host RAM) address.
    PhysicalAddress,
    "PA"
);

address_type!(
    /// Address a device puts on the bus to reach memory.
    ///
    /// Starts out as the physical address and is rewritten by every IOMMU
    /// between the root and the device. [`BusAddress::INVALID`] marks a
    /// segment that has not been mapped (or has been unmapped again).
    BusAddress,
    "BA"
);

impl BusAddress {
    /// Sentinel for "not mapped".
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl From<PhysicalAddress> for BusAddress {
    /// Identity translation used at the root of the bus hierarchy.
    #[inline]
    fn from(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64())
    }
}
