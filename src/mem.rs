// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Physical addresses, page arithmetic, and the page-allocator seam.

use core::fmt;
use core::fmt::{Display, Formatter};

use static_assertions::const_assert;

/// Granularity of every allocation made through [`PageAllocator`].
pub const PAGE_SIZE: usize = 4096;
const_assert!(PAGE_SIZE.is_power_of_two());

/// A physical memory address.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const MAX: Self = Self(usize::MAX);
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[must_use]
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        if let Some(out) = self.0.checked_add(rhs) {
            Some(Self(out))
        } else {
            None
        }
    }

    #[must_use]
    #[inline]
    pub const fn checked_sub_addr(self, rhs: Self) -> Option<usize> {
        self.0.checked_sub(rhs.0)
    }

    /// Whether this address is a multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "is_aligned_to: align is not a power-of-two");

        self.0 & (align - 1) == 0
    }

    /// Rounds up to the next multiple of `align`, `None` if that overflows.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(align.is_power_of_two(), "checked_align_up: align is not a power-of-two");

        let mask = align - 1;
        if let Some(sum) = self.0.checked_add(mask) {
            let aligned = Self(sum & !mask);
            debug_assert!(aligned.is_aligned_to(align));
            debug_assert!(aligned.0 >= self.0);
            Some(aligned)
        } else {
            None
        }
    }

    /// Rounds down to the previous multiple of `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "align_down: align is not a power-of-two");

        let aligned = Self(self.0 & !(align - 1));
        debug_assert!(aligned.0 <= self.0);
        aligned
    }
}

impl Display for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PhysAddr")
            .field(&format_args!("{:#018x}", self.0))
            .finish()
    }
}

/// Number of pages needed to hold `size` bytes.
#[must_use]
pub const fn size_to_pages(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Number of bytes in `pages` pages, `None` if that overflows.
#[must_use]
pub const fn pages_to_size(pages: usize) -> Option<usize> {
    pages.checked_mul(PAGE_SIZE)
}

/// What a loaded region holds, and into which execution phase it survives.
///
/// `Loader*` regions belong to transient applications, `Boot*` regions to
/// drivers that end with the boot phase, and `Runtime*` regions to images
/// that stay mapped across the address-space transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    LoaderCode,
    LoaderData,
    BootCode,
    BootData,
    RuntimeCode,
    RuntimeData,
}

/// How [`PageAllocator::allocate`] picks the base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateKind {
    /// The run must start exactly at the given address.
    Fixed(PhysAddr),
    /// Any suitably aligned address will do.
    AnyPages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("page allocation failed")
    }
}

impl core::error::Error for AllocError {}

/// Allocates and frees page-granular runs of physical memory.
///
/// Implementations are exercised from a single execution context; `&mut self`
/// is the whole synchronization story.
pub trait PageAllocator {
    /// Allocates `pages` pages classified as `kind`.
    ///
    /// Returns the base of the run, which for [`AllocateKind::Fixed`] is the
    /// requested address.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the request cannot be satisfied.
    fn allocate(
        &mut self,
        request: AllocateKind,
        pages: usize,
        kind: MemoryKind,
    ) -> Result<PhysAddr, AllocError>;

    /// Returns a run previously obtained from [`PageAllocator::allocate`].
    fn free(&mut self, base: PhysAddr, pages: usize);
}

/// Makes `len` bytes starting at `base` visible to instruction fetch.
///
/// A zero-length range is a no-op. Debug builds assert that the range stays
/// within the addressable space.
pub fn invalidate_instruction_range(base: PhysAddr, len: usize) {
    if len == 0 {
        return;
    }
    debug_assert!(
        len - 1 <= usize::MAX - base.get(),
        "instruction range escapes the addressable space"
    );

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "riscv64")] {
            // SAFETY: fence.i has no operands and no memory preconditions.
            unsafe { core::arch::asm!("fence.i") };
        } else {
            // Remaining supported targets keep instruction fetch coherent with
            // stores, or synchronize it in the platform layer.
        }
    }
}
