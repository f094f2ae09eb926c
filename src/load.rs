// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Takes an image from raw bytes to executable memory: header checks,
//! placement, materialization, relocation, cache maintenance.
//!
//! Pages acquired along the way are handed back on every failure path, a
//! failed load leaves the allocator exactly as it found it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::LoaderConfig;
use crate::error::Error;
use crate::format::{ImageFormat, ImageInfo};
use crate::mem::{MemoryKind, PageAllocator, PhysAddr, invalidate_instruction_range};
use crate::placement::{self, Destination, Placement};
use crate::source::ImageSource;
use crate::{Result, bail, ensure};

/// Everything the lifecycle layer needs to know about a freshly loaded
/// image: where it is, what it is, and what teardown will have to undo.
#[derive(Debug)]
pub struct LoadedModule {
    pub info: ImageInfo,
    pub placement: Placement,
    /// Aligned base the image actually runs at; inside the placement's run.
    pub base: PhysAddr,
    pub size: usize,
    pub entry: PhysAddr,
    pub debug_name: Option<Arc<str>>,
    pub aux_resource: Option<PhysAddr>,
    /// Retained relocation data, populated only for long-lived images.
    pub fixup: Option<Arc<[u8]>>,
    pub code_kind: MemoryKind,
    pub data_kind: MemoryKind,
}

/// Loads and relocates one image.
///
/// `destination`, when given, supplies the backing memory instead of the
/// allocator. `want_registration` gates whether relocation data is retained
/// for the runtime fixup pass; it only matters for long-lived images whose
/// format records fixups.
///
/// # Errors
///
/// - [`Error::LoadError`] if the header, content, or relocation tables are
///   unusable.
/// - [`Error::Unsupported`] for machines this platform cannot execute or
///   subsystems without a memory classification.
/// - [`Error::InvalidParameter`] for destinations a relocation-stripped
///   image cannot run at.
/// - [`Error::BufferTooSmall`] when `destination`'s page budget is short.
/// - [`Error::OutOfResources`] when memory for the image or its retained
///   relocation data cannot be allocated.
pub fn load_and_relocate(
    format: &mut dyn ImageFormat,
    memory: &mut dyn PageAllocator,
    config: &LoaderConfig,
    source: &ImageSource<'_>,
    destination: Option<Destination>,
    want_registration: bool,
) -> Result<LoadedModule> {
    let info = format.read_info(source)?;
    ensure!(
        info.section_alignment.is_power_of_two(),
        Error::LoadError,
        "image section alignment is not a power of two"
    );
    ensure!(info.image_size > 0, Error::LoadError, "image has no loadable content");

    let machine = info.machine;
    let native = config.native_machine;
    ensure!(
        config.supports(machine),
        Error::Unsupported,
        "image machine {machine} is not executable on this {native} platform"
    );

    let (code_kind, data_kind) = placement::classify(info.subsystem)?;
    let placement = placement::place(memory, config, &info, code_kind, destination)?;

    // Past this point the placement must be released on every error.
    let base = if info.needs_alignment {
        match placement.base.checked_align_up(info.section_alignment) {
            Some(base) => base,
            None => {
                placement::release(memory, &placement);
                bail!(Error::InvalidParameter, "aligning the image base overflows the address space");
            }
        }
    } else {
        placement.base
    };

    let loaded = match format.load(source, &info, base) {
        Ok(loaded) => loaded,
        Err(err) => {
            placement::release(memory, &placement);
            return Err(err);
        }
    };

    let mut fixup_buf: Option<Box<[u8]>> = None;
    if want_registration && info.subsystem.is_long_lived() && info.fixup_data_size > 0 {
        let size = info.fixup_data_size;
        let mut buf = Vec::new();
        if buf.try_reserve_exact(size).is_err() {
            placement::release(memory, &placement);
            bail!(Error::OutOfResources, "cannot retain {size} bytes of relocation data");
        }
        buf.resize(size, 0);
        fixup_buf = Some(buf.into_boxed_slice());
    }

    if let Err(err) = format.relocate(&loaded, fixup_buf.as_deref_mut()) {
        placement::release(memory, &placement);
        return Err(err);
    }

    // The image is in its final shape, flush it out of the data path before
    // anything jumps to it.
    invalidate_instruction_range(loaded.base, loaded.size);

    let entry = loaded.entry;
    match &loaded.debug_name {
        Some(name) => log::debug!("loaded image at {base}, entry point {entry} ({name})"),
        None => log::debug!("loaded image at {base}, entry point {entry}"),
    }

    Ok(LoadedModule {
        info,
        placement,
        base: loaded.base,
        size: loaded.size,
        entry: loaded.entry,
        debug_name: loaded.debug_name,
        aux_resource: loaded.aux_resource,
        fixup: fixup_buf.map(Arc::from),
        code_kind,
        data_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Machine;
    use crate::mem::PAGE_SIZE;
    use crate::test_utils::{FormatFail, TestFormat, TestPageAlloc};

    #[test]
    fn a_boot_driver_loads_into_boot_code_pages() {
        let mut format = TestFormat::boot_driver(3 * PAGE_SIZE);
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1, 2, 3]).unwrap();

        let module =
            load_and_relocate(&mut format, &mut memory, &config, &source, None, true).unwrap();
        assert_eq!(module.size, 3 * PAGE_SIZE);
        assert_eq!(module.base, module.placement.base);
        assert_eq!(module.entry, module.base.checked_add(format.entry_offset).unwrap());
        assert_eq!(module.code_kind, MemoryKind::BootCode);
        assert_eq!(module.data_kind, MemoryKind::BootData);
        assert!(module.placement.allocated);
        assert!(module.fixup.is_none());
        assert_eq!(memory.live_pages(), 3);
        assert_eq!(format.loads, 1);
        assert_eq!(format.relocations, 1);
    }

    // The rejection log names both sides, the image's machine and the
    // platform's.
    #[test_log::test]
    fn foreign_machines_are_rejected_before_any_allocation() {
        let mut format = TestFormat::boot_driver(PAGE_SIZE);
        format.info.machine = Machine::new(0xbeef);
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();

        let err = load_and_relocate(&mut format, &mut memory, &config, &source, None, true)
            .unwrap_err();
        assert_eq!(err, Error::Unsupported);
        assert!(memory.requests.is_empty());
        assert_eq!(format.loads, 0);
    }

    #[test]
    fn nonsense_headers_are_load_errors() {
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();

        let mut format = TestFormat::boot_driver(PAGE_SIZE);
        format.info.section_alignment = 0x3000;
        let mut memory = TestPageAlloc::new();
        let err = load_and_relocate(&mut format, &mut memory, &config, &source, None, true)
            .unwrap_err();
        assert_eq!(err, Error::LoadError);

        let mut format = TestFormat::boot_driver(0);
        let mut memory = TestPageAlloc::new();
        let err = load_and_relocate(&mut format, &mut memory, &config, &source, None, true)
            .unwrap_err();
        assert_eq!(err, Error::LoadError);
        assert!(memory.requests.is_empty());
    }

    #[test]
    fn failed_materialization_returns_the_pages() {
        let mut format = TestFormat::boot_driver(2 * PAGE_SIZE);
        format.fail = Some(FormatFail::Load);
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();

        let err = load_and_relocate(&mut format, &mut memory, &config, &source, None, true)
            .unwrap_err();
        assert_eq!(err, Error::LoadError);
        assert!(memory.is_empty());
        assert!(!memory.requests.is_empty());
    }

    #[test]
    fn failed_relocation_returns_the_pages() {
        let mut format = TestFormat::boot_driver(2 * PAGE_SIZE);
        format.fail = Some(FormatFail::Relocate);
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();

        let err = load_and_relocate(&mut format, &mut memory, &config, &source, None, true)
            .unwrap_err();
        assert_eq!(err, Error::LoadError);
        assert!(memory.is_empty());
        assert_eq!(format.loads, 1);
    }

    #[test]
    fn unretainable_relocation_data_returns_the_pages() {
        let mut format = TestFormat::runtime_driver(PAGE_SIZE);
        format.info.fixup_data_size = usize::MAX;
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();

        let err = load_and_relocate(&mut format, &mut memory, &config, &source, None, true)
            .unwrap_err();
        assert_eq!(err, Error::OutOfResources);
        assert!(memory.is_empty());
        assert_eq!(format.loads, 1);
        assert_eq!(format.relocations, 0);
    }

    #[test]
    fn relocation_data_is_retained_only_when_asked() {
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();

        let mut format = TestFormat::runtime_driver(PAGE_SIZE);
        let mut memory = TestPageAlloc::new();
        let module =
            load_and_relocate(&mut format, &mut memory, &config, &source, None, true).unwrap();
        let fixup = module.fixup.as_deref().unwrap();
        assert_eq!(fixup.len(), format.info.fixup_data_size);
        assert!(fixup.iter().all(|&byte| byte == 0xAB));

        let mut format = TestFormat::runtime_driver(PAGE_SIZE);
        let mut memory = TestPageAlloc::new();
        let module =
            load_and_relocate(&mut format, &mut memory, &config, &source, None, false).unwrap();
        assert!(module.fixup.is_none());

        // Short-lived images never retain fixups, registered or not.
        let mut format = TestFormat::boot_driver(PAGE_SIZE);
        format.info.fixup_data_size = 64;
        let mut memory = TestPageAlloc::new();
        let module =
            load_and_relocate(&mut format, &mut memory, &config, &source, None, true).unwrap();
        assert!(module.fixup.is_none());
    }

    #[test]
    fn destinations_are_aligned_within_the_budgeted_run() {
        let mut format = TestFormat::runtime_driver(PAGE_SIZE);
        format.info.section_alignment = 2 * PAGE_SIZE;
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();
        let dest = Destination {
            address: PhysAddr::new(0x80_1000),
            page_budget: 2,
        };

        let module =
            load_and_relocate(&mut format, &mut memory, &config, &source, Some(dest), true)
                .unwrap();
        assert_eq!(module.placement.base, PhysAddr::new(0x80_1000));
        assert_eq!(module.base, PhysAddr::new(0x80_2000));
        assert!(!module.placement.allocated);
        assert!(memory.requests.is_empty());
    }

    #[test]
    fn short_destination_budgets_surface_the_requirement() {
        let mut format = TestFormat::boot_driver(4 * PAGE_SIZE);
        let mut memory = TestPageAlloc::new();
        let config = LoaderConfig::new_default();
        let source = ImageSource::borrowed(&[1]).unwrap();
        let dest = Destination {
            address: PhysAddr::new(0x80_0000),
            page_budget: 1,
        };

        let err = load_and_relocate(&mut format, &mut memory, &config, &source, Some(dest), true)
            .unwrap_err();
        assert_eq!(err, Error::BufferTooSmall { required_pages: 4 });
        assert_eq!(format.loads, 0);
    }
}
