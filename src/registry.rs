// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Registry of long-lived images that must be fixed up again when the
//! system's address mappings change at the phase transition.

use alloc::sync::Weak;
use alloc::vec::Vec;

use crate::directory::Handle;
use crate::mem::PhysAddr;

/// One long-lived image and the retained relocation data needed to re-apply
/// its fixups against a different address mapping.
#[derive(Debug, Clone)]
pub struct RuntimeImage {
    pub base: PhysAddr,
    pub size: usize,
    /// Relocation data owned by the image's record. A dead reference means
    /// the image was torn down; such entries are skipped by the fixup pass.
    pub fixup: Weak<[u8]>,
    pub handle: Handle,
}

/// Append-only collection of [`RuntimeImage`] entries, consumed by the
/// phase-transition fixup pass.
///
/// Entries are kept in registration order. Nothing here deduplicates or
/// validates; callers register exactly once per load and unregister exactly
/// once per teardown.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    entries: Vec<RuntimeImage>,
}

impl RuntimeRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, image: RuntimeImage) {
        let base = image.base;
        let size = image.size;
        let handle = image.handle;
        log::trace!("registered runtime image {handle:?} at {base} ({size} bytes)");
        self.entries.push(image);
    }

    /// Drops the entry for `handle`. Returns whether one was present.
    ///
    /// The retained relocation data is not touched; its owner frees it.
    pub fn unregister(&mut self, handle: Handle) -> bool {
        let Some(index) = self.entries.iter().position(|entry| entry.handle == handle) else {
            return false;
        };
        self.entries.remove(index);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All registered images, in registration order, for the fixup pass.
    #[must_use]
    pub fn entries(&self) -> &[RuntimeImage] {
        &self.entries
    }
}
