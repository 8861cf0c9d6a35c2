//! Construction-time parameters of the heap.

use core::ptr::NonNull;

use snafu::{Snafu, ensure};

use crate::{
    error::CallSite,
    platform::PAGE_SIZE,
    segment::{ALIGN, HEADER_SIZE},
};

/// Errors found while validating a [`HeapConfig`].
///
/// Unlike [`HeapError`](crate::HeapError) these are ordinary recoverable
/// errors; they can only happen before the heap exists.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("heap base {base:#x} is not page aligned"))]
    UnalignedBase {
        base: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("reserved minimum {reserved_min:#x} is not a positive multiple of the page size"))]
    InvalidMinimum {
        reserved_min: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display(
        "reserved maximum {reserved_max:#x} must be a page multiple not below the minimum {reserved_min:#x}"
    ))]
    InvalidMaximum {
        reserved_min: usize,
        reserved_max: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("heap window {base:#x} + {reserved_max:#x} overflows the address space"))]
    WindowOverflow {
        base: usize,
        reserved_max: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
}

/// Placement and size limits of the heap window.
///
/// `reserved_min` bytes from `base` are committed when the heap is created
/// and never given back; the heap refuses to grow beyond `reserved_max`
/// bytes from `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    base: NonNull<u8>,
    reserved_min: usize,
    reserved_max: usize,
}

// The base is only ever used as an address here; the heap owns the memory.
unsafe impl Send for HeapConfig {}
unsafe impl Sync for HeapConfig {}

impl HeapConfig {
    /// Creates and validates a configuration.
    pub fn new(
        base: NonNull<u8>,
        reserved_min: usize,
        reserved_max: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            base,
            reserved_min,
            reserved_max,
        };
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration with limits given in pages.
    pub fn from_pages(
        base: NonNull<u8>,
        min_pages: usize,
        max_pages: usize,
    ) -> Result<Self, ConfigError> {
        let base_addr = base.addr().get();
        let reserved_min = min_pages
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| InvalidMinimumSnafu { reserved_min: usize::MAX }.build())?;
        let reserved_max = max_pages.checked_mul(PAGE_SIZE).ok_or_else(|| {
            WindowOverflowSnafu {
                base: base_addr,
                reserved_max: usize::MAX,
            }
            .build()
        })?;
        Self::new(base, reserved_min, reserved_max)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base.addr().get();
        let Self {
            reserved_min,
            reserved_max,
            ..
        } = *self;

        ensure!(base.is_multiple_of(PAGE_SIZE), UnalignedBaseSnafu { base });
        ensure!(
            reserved_min > 0
                && reserved_min.is_multiple_of(PAGE_SIZE)
                && reserved_min >= HEADER_SIZE + ALIGN,
            InvalidMinimumSnafu { reserved_min }
        );
        ensure!(
            reserved_max >= reserved_min && reserved_max.is_multiple_of(PAGE_SIZE),
            InvalidMaximumSnafu {
                reserved_min,
                reserved_max
            }
        );
        ensure!(
            base.checked_add(reserved_max).is_some(),
            WindowOverflowSnafu { base, reserved_max }
        );
        Ok(())
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn reserved_min(&self) -> usize {
        self.reserved_min
    }

    #[must_use]
    pub fn reserved_max(&self) -> usize {
        self.reserved_max
    }
}
