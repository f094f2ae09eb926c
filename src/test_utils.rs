// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fakes shared across the test modules: a bookkeeping page allocator, a
//! scriptable image format, and a directory that fails on demand.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::Result;
use crate::directory::{BootDirectory, Handle, ObjectDirectory, OpenUse, RecordKey, RecordPayload};
use crate::error::Error;
use crate::format::{ImageFormat, ImageInfo, LoadedImage, Machine, Subsystem};
use crate::image::LoadPolicy;
use crate::mem::{AllocError, AllocateKind, MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr};
use crate::source::{DevicePath, ImageSource, ResolvedSource, SourceResolver};

/// Page allocator that tracks every live allocation and panics on mismatched
/// frees, so leaks and double frees fail the test that caused them.
pub struct TestPageAlloc {
    live: BTreeMap<usize, (usize, MemoryKind)>,
    next: usize,
    pub fail_fixed: bool,
    pub fail_any: bool,
    /// Every request seen, in order.
    pub requests: Vec<AllocateKind>,
}

impl TestPageAlloc {
    pub fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            next: 0x100_0000,
            fail_fixed: false,
            fail_any: false,
            requests: Vec::new(),
        }
    }

    pub fn live_pages(&self) -> usize {
        self.live.values().map(|(pages, _)| pages).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for TestPageAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for TestPageAlloc {
    fn allocate(
        &mut self,
        request: AllocateKind,
        pages: usize,
        kind: MemoryKind,
    ) -> Result<PhysAddr, AllocError> {
        self.requests.push(request);
        assert!(pages > 0, "zero-page allocation");
        match request {
            AllocateKind::Fixed(base) => {
                if self.fail_fixed || self.live.contains_key(&base.get()) {
                    return Err(AllocError);
                }
                self.live.insert(base.get(), (pages, kind));
                Ok(base)
            }
            AllocateKind::AnyPages => {
                if self.fail_any {
                    return Err(AllocError);
                }
                let base = self.next;
                self.next = base + pages * PAGE_SIZE;
                self.live.insert(base, (pages, kind));
                Ok(PhysAddr::new(base))
            }
        }
    }

    fn free(&mut self, base: PhysAddr, pages: usize) {
        let Some((live_pages, _)) = self.live.remove(&base.get()) else {
            panic!("freed pages that were never allocated at {base}");
        };
        assert_eq!(live_pages, pages, "allocation at {base} freed with the wrong page count");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFail {
    ReadInfo,
    Load,
    Relocate,
}

/// Scriptable [`ImageFormat`]: hands out a fixed [`ImageInfo`], fails on
/// demand at any stage, and counts how often each stage ran.
pub struct TestFormat {
    pub info: ImageInfo,
    pub fail: Option<FormatFail>,
    pub entry_offset: usize,
    pub debug_name: Option<&'static str>,
    /// Offset of a discovered auxiliary resource, if the fake image has one.
    pub aux_offset: Option<usize>,
    pub loads: usize,
    pub relocations: usize,
}

impl TestFormat {
    pub fn boot_driver(image_size: usize) -> Self {
        Self {
            info: ImageInfo {
                machine: Machine::native(),
                subsystem: Subsystem::BootDriver,
                image_size,
                section_alignment: PAGE_SIZE,
                preferred_base: PhysAddr::new(0x40_0000),
                relocations_stripped: false,
                needs_alignment: false,
                fixup_data_size: 0,
            },
            fail: None,
            entry_offset: 0x40,
            debug_name: None,
            aux_offset: None,
            loads: 0,
            relocations: 0,
        }
    }

    pub fn runtime_driver(image_size: usize) -> Self {
        let mut this = Self::boot_driver(image_size);
        this.info.subsystem = Subsystem::RuntimeDriver;
        this.info.fixup_data_size = 64;
        this.info.needs_alignment = true;
        this
    }
}

impl ImageFormat for TestFormat {
    fn read_info(&mut self, source: &ImageSource<'_>) -> Result<ImageInfo> {
        if self.fail == Some(FormatFail::ReadInfo) {
            return Err(Error::LoadError);
        }
        let _header = source.read_range(0, 64)?;
        Ok(self.info.clone())
    }

    fn load(
        &mut self,
        _source: &ImageSource<'_>,
        info: &ImageInfo,
        base: PhysAddr,
    ) -> Result<LoadedImage> {
        self.loads += 1;
        if self.fail == Some(FormatFail::Load) {
            return Err(Error::LoadError);
        }
        Ok(LoadedImage {
            base,
            size: info.image_size,
            entry: base.checked_add(self.entry_offset).unwrap(),
            debug_name: self.debug_name.map(Arc::from),
            aux_resource: self
                .aux_offset
                .map(|offset| base.checked_add(offset).unwrap()),
        })
    }

    fn relocate(&mut self, _loaded: &LoadedImage, fixup: Option<&mut [u8]>) -> Result<()> {
        self.relocations += 1;
        if self.fail == Some(FormatFail::Relocate) {
            return Err(Error::LoadError);
        }
        if let Some(fixup) = fixup {
            fixup.fill(0xAB);
        }
        Ok(())
    }
}

/// [`BootDirectory`] wrapper that fails scripted operations, for exercising
/// unwind and teardown paths.
pub struct FlakyDirectory {
    pub inner: BootDirectory,
    /// Successful installs remaining before every install fails; `None`
    /// never fails.
    pub installs_before_failure: Option<usize>,
    pub fail_handles: bool,
    pub fail_keys_of: Option<Handle>,
    pub fail_uses_of: Option<(Handle, RecordKey)>,
}

impl FlakyDirectory {
    pub fn new() -> Self {
        Self {
            inner: BootDirectory::new(),
            installs_before_failure: None,
            fail_handles: false,
            fail_keys_of: None,
            fail_uses_of: None,
        }
    }
}

impl Default for FlakyDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDirectory for FlakyDirectory {
    fn install(
        &mut self,
        handle: Option<Handle>,
        key: RecordKey,
        payload: RecordPayload,
    ) -> Result<Handle> {
        if let Some(budget) = &mut self.installs_before_failure {
            if *budget == 0 {
                return Err(Error::OutOfResources);
            }
            *budget -= 1;
        }
        self.inner.install(handle, key, payload)
    }

    fn uninstall(&mut self, handle: Handle, key: RecordKey) -> Result<()> {
        self.inner.uninstall(handle, key)
    }

    fn contains(&self, handle: Handle) -> bool {
        self.inner.contains(handle)
    }

    fn handles(&self) -> Result<Vec<Handle>> {
        if self.fail_handles {
            return Err(Error::OutOfResources);
        }
        self.inner.handles()
    }

    fn record_keys(&self, handle: Handle) -> Result<Vec<RecordKey>> {
        if self.fail_keys_of == Some(handle) {
            return Err(Error::OutOfResources);
        }
        self.inner.record_keys(handle)
    }

    fn open_uses(&self, handle: Handle, key: RecordKey) -> Result<Vec<OpenUse>> {
        if self.fail_uses_of == Some((handle, key)) {
            return Err(Error::OutOfResources);
        }
        self.inner.open_uses(handle, key)
    }

    fn record_use(&mut self, handle: Handle, key: RecordKey, open_use: OpenUse) -> Result<()> {
        self.inner.record_use(handle, key, open_use)
    }

    fn close_use(&mut self, handle: Handle, key: RecordKey, open_use: OpenUse) -> Result<()> {
        self.inner.close_use(handle, key, open_use)
    }
}

/// Policy that rejects everything.
pub struct DenyAll;

impl LoadPolicy for DenyAll {
    fn verify(&mut self, _path: Option<&DevicePath>, _image: &[u8], _boot_policy: bool) -> bool {
        false
    }
}

/// Resolver that serves one canned image for any path.
pub struct StaticResolver {
    bytes: Vec<u8>,
    path: DevicePath,
    pub last_boot_policy: Option<bool>,
}

impl StaticResolver {
    pub fn new(bytes: Vec<u8>, path: DevicePath) -> Self {
        Self {
            bytes,
            path,
            last_boot_policy: None,
        }
    }
}

impl SourceResolver for StaticResolver {
    fn resolve(&mut self, _path: &DevicePath, boot_policy: bool) -> Result<ResolvedSource> {
        self.last_boot_policy = Some(boot_policy);
        Ok(ResolvedSource {
            bytes: self.bytes.clone().into_boxed_slice(),
            path: self.path.clone(),
        })
    }
}
