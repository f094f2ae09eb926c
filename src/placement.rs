// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Decides where an image lives and as what memory classification.

use crate::config::LoaderConfig;
use crate::error::Error;
use crate::format::{ImageInfo, Subsystem};
use crate::mem::{AllocError, AllocateKind, MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr};
use crate::{Result, bail, ensure};

/// A caller-supplied destination for the image, with the page budget the
/// caller is willing to spend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub address: PhysAddr,
    pub page_budget: usize,
}

/// Where an image ended up and whether this crate owns the pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Base of the backing page run, before any alignment rounding.
    pub base: PhysAddr,
    pub pages: usize,
    /// The pages came from the allocator and must be freed on teardown.
    /// Caller-supplied destinations stay owned by the caller.
    pub allocated: bool,
}

/// Maps a subsystem to the (code, data) memory classification of its regions.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for subsystems without a defined
/// classification.
pub fn classify(subsystem: Subsystem) -> Result<(MemoryKind, MemoryKind)> {
    match subsystem {
        Subsystem::Application => Ok((MemoryKind::LoaderCode, MemoryKind::LoaderData)),
        Subsystem::BootDriver => Ok((MemoryKind::BootCode, MemoryKind::BootData)),
        Subsystem::RuntimeDriver | Subsystem::RuntimeService => {
            Ok((MemoryKind::RuntimeCode, MemoryKind::RuntimeData))
        }
        Subsystem::Unknown(raw) => {
            bail!(Error::Unsupported, "image subsystem {raw:#x} has no memory classification");
        }
    }
}

/// Pages needed to hold `image_size` bytes plus the worst-case alignment
/// slack, so that an aligned base always fits inside the run.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if the padded size overflows.
pub fn required_pages(image_size: usize, section_alignment: usize) -> Result<usize> {
    let slack = section_alignment.saturating_sub(PAGE_SIZE);
    let Some(padded) = image_size.checked_add(slack) else {
        bail!(Error::InvalidParameter, "image size overflows when padded for alignment");
    };
    Ok(padded.div_ceil(PAGE_SIZE))
}

/// Picks the backing page run for an image.
///
/// Without a destination the run is allocated: at the preferred base when
/// that base clears the reserved low-memory region or the image cannot be
/// relocated, otherwise (and as a fallback) anywhere the allocator likes.
/// With a destination nothing is allocated; the caller's budget is checked
/// against the real requirement.
///
/// # Errors
///
/// - [`Error::InvalidParameter`] if the image cannot be relocated and the
///   destination is not its preferred base.
/// - [`Error::BufferTooSmall`] if the caller's page budget is short; the
///   required count rides along for the retry.
/// - [`Error::OutOfResources`] if allocation fails at the preferred base and
///   a system-chosen one is not permitted or not available either.
pub fn place(
    memory: &mut dyn PageAllocator,
    config: &LoaderConfig,
    info: &ImageInfo,
    code_kind: MemoryKind,
    destination: Option<Destination>,
) -> Result<Placement> {
    let pages = required_pages(info.image_size, info.section_alignment)?;

    if let Some(dest) = destination {
        ensure!(
            !info.relocations_stripped || dest.address == info.preferred_base,
            Error::InvalidParameter,
            "relocation info was stripped, the image can only run at its preferred base"
        );
        if dest.page_budget < pages {
            return Err(Error::BufferTooSmall {
                required_pages: pages,
            });
        }
        return Ok(Placement {
            base: dest.address,
            pages,
            allocated: false,
        });
    }

    // A preferred base inside the reserved low-memory region is only honored
    // when the image physically cannot run elsewhere.
    let try_fixed =
        info.preferred_base.get() >= config.low_memory_top.get() || info.relocations_stripped;

    let mut base = if try_fixed {
        memory.allocate(AllocateKind::Fixed(info.preferred_base), pages, code_kind)
    } else {
        Err(AllocError)
    };
    if base.is_err() && !info.relocations_stripped {
        let preferred = info.preferred_base;
        log::trace!("not using preferred base {preferred}, asking for a system-chosen address");
        base = memory.allocate(AllocateKind::AnyPages, pages, code_kind);
    }
    let Ok(base) = base else {
        bail!(Error::OutOfResources, "no {pages} page run available for the image");
    };

    Ok(Placement {
        base,
        pages,
        allocated: true,
    })
}

/// Returns a placement's pages to the allocator, if this crate owns them.
pub fn release(memory: &mut dyn PageAllocator, placement: &Placement) {
    if placement.allocated {
        memory.free(placement.base, placement.pages);
    }
}
