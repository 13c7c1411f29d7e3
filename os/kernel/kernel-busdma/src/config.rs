//! # Subsystem Configuration
//!
//! Sizes of the platform (page, cache line) and of the fixed pools that back
//! tags, descriptors and segments.

use crate::BusDmaError;

/// Built-in defaults.
pub mod info {
    /// Base page size used for page-table walks.
    pub const PAGE_SIZE: u64 = 4096;

    /// Every allocation is at least cache-line aligned and sized.
    pub const CACHE_LINE_SIZE: u64 = 64;

    /// Maximum number of segments alive at once.
    pub const SEGMENT_STORE_CAPACITY: usize = 4096;

    /// Maximum number of mapping descriptors alive at once.
    pub const MD_POOL_CAPACITY: usize = 1024;

    /// Maximum number of tags alive at once, root tag included.
    pub const TAG_CAPACITY: usize = 256;
}

/// Configuration for one [`BusDma`](crate::BusDma) context.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BusDmaConfig {
    pub page_size: u64,
    pub cache_line_size: u64,
    pub segment_store_capacity: usize,
    pub md_pool_capacity: usize,
    pub tag_capacity: usize,
}

impl Default for BusDmaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDmaConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            page_size: info::PAGE_SIZE,
            cache_line_size: info::CACHE_LINE_SIZE,
            segment_store_capacity: info::SEGMENT_STORE_CAPACITY,
            md_pool_capacity: info::MD_POOL_CAPACITY,
            tag_capacity: info::TAG_CAPACITY,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_page_size(mut self, value: u64) -> Self {
        self.page_size = value;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_cache_line_size(mut self, value: u64) -> Self {
        self.cache_line_size = value;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_segment_store_capacity(mut self, value: usize) -> Self {
        self.segment_store_capacity = value;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_md_pool_capacity(mut self, value: usize) -> Self {
        self.md_pool_capacity = value;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_tag_capacity(mut self, value: usize) -> Self {
        self.tag_capacity = value;
        self
    }

    /// Check the configuration for internal consistency.
    ///
    /// # Errors
    /// [`BusDmaError::InvalidArgument`] if a size is not a power of two, the
    /// cache line exceeds the page, or a pool has no room at all.
    pub const fn validate(&self) -> Result<(), BusDmaError> {
        if !self.page_size.is_power_of_two() {
            return Err(BusDmaError::InvalidArgument("page size must be a power of two"));
        }
        if !self.cache_line_size.is_power_of_two() {
            return Err(BusDmaError::InvalidArgument(
                "cache line size must be a power of two",
            ));
        }
        if self.cache_line_size > self.page_size {
            return Err(BusDmaError::InvalidArgument(
                "cache line size exceeds page size",
            ));
        }
        if self.segment_store_capacity == 0 || self.md_pool_capacity == 0 {
            return Err(BusDmaError::InvalidArgument("pool capacity must be non-zero"));
        }
        // The root tag always occupies one slot.
        if self.tag_capacity < 2 {
            return Err(BusDmaError::InvalidArgument("tag capacity must exceed one"));
        }
        Ok(())
    }
}
