// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable-image loading and lifecycle management for the preboot phase.
//!
//! Given the raw bytes of a relocatable executable module, this crate decides
//! where the module lives and as what memory classification, drives an
//! external format parser through its load and relocation passes, tracks
//! long-lived images for a later address-space transition, and publishes
//! discovery records to an object directory so other components can find the
//! image by handle. Unloading reverses every one of these effects exactly
//! once, in a fixed order, including forcibly closing any third party's
//! outstanding uses of the image's records before the handle disappears.
//!
//! The surrounding environment plugs in through trait seams:
//! - [`PageAllocator`] places and frees page runs of a given [`MemoryKind`],
//! - [`ImageFormat`] parses headers, materializes bytes, applies relocations,
//! - [`ObjectDirectory`] stores the published records and open-use ledger
//!   ([`BootDirectory`] is an in-memory implementation scoped to one boot
//!   session),
//! - [`SourceResolver`] turns a device path into image bytes,
//! - [`LoadPolicy`] gives the platform a veto before any memory is committed.
//!
//! [`ImageLoader`] ties the seams together and owns the records of all
//! currently loaded images. All of its operations are synchronous and run on
//! a single execution context; nothing in this crate locks. The embedder is
//! responsible for serializing entry.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod directory;
mod error;
mod format;
mod image;
mod load;
mod mem;
mod placement;
mod publish;
mod registry;
mod source;
#[cfg(test)]
mod test_utils;

pub use config::LoaderConfig;
pub use directory::{BootDirectory, Handle, ObjectDirectory, OpenUse, RecordKey, RecordPayload};
pub use error::Error;
pub use format::{ImageFormat, ImageInfo, LoadedImage, Machine, Subsystem};
pub use image::{
    ImageLoader, ImageRecord, LoadFlags, LoadOutcome, LoadPolicy, LoadRequest, PermitAll,
    RECORD_REVISION, Services,
};
pub use mem::{
    AllocError, AllocateKind, MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr,
    invalidate_instruction_range, pages_to_size, size_to_pages,
};
pub use registry::{RuntimeImage, RuntimeRegistry};
pub use source::{DevicePath, ImageSource, ResolvedSource, SourceResolver};

pub type Result<T, E = Error> = core::result::Result<T, E>;
