// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Image lifecycle: the descriptor table, load requests, and the strictly
//! ordered teardown that is its mirror image.
//!
//! [`ImageLoader`] owns one [`ImageRecord`] per loaded image, keyed by the
//! directory handle the image was published under. A record accumulates
//! every resource its load acquired; unloading releases them in the fixed
//! order revocation, registry removal, transient buffers, pages, and each
//! step checks independently whether its resource is present, so teardown
//! is safe on records that never acquired everything.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::config::LoaderConfig;
use crate::directory::{Handle, ObjectDirectory};
use crate::error::Error;
use crate::format::{ImageFormat, Machine, Subsystem};
use crate::load;
use crate::mem::{MemoryKind, PAGE_SIZE, PageAllocator, PhysAddr};
use crate::placement::{self, Destination};
use crate::publish;
use crate::registry::{RuntimeImage, RuntimeRegistry};
use crate::source::{DevicePath, ImageSource, SourceResolver};
use crate::{Result, bail, ensure};

/// Layout revision of [`ImageRecord`], for consumers that persist or
/// exchange descriptors.
pub const RECORD_REVISION: u32 = 0x1000;

bitflags::bitflags! {
    /// Knobs on a [`LoadRequest`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// The image is being loaded as part of a boot option; source
        /// resolvers may fall back to boot media.
        const BOOT_POLICY = 1 << 0;
        /// Register long-lived images for the runtime fixup pass.
        const RUNTIME_REGISTRATION = 1 << 1;
        /// Publish the image's auxiliary resource, if it carries one.
        const AUX_DISCOVERY = 1 << 2;
    }
}

impl Default for LoadFlags {
    fn default() -> Self {
        Self::RUNTIME_REGISTRATION | Self::AUX_DISCOVERY
    }
}

/// One request to load an image.
///
/// At least one of `path` and `buffer` must be given. When both are, the
/// buffer supplies the bytes and the path is kept as identity metadata.
#[derive(Debug)]
pub struct LoadRequest<'a> {
    /// The already-loaded image this load is done on behalf of.
    pub parent: Handle,
    pub path: Option<DevicePath>,
    pub buffer: Option<&'a [u8]>,
    pub flags: LoadFlags,
}

impl<'a> LoadRequest<'a> {
    pub fn from_path(parent: Handle, path: DevicePath) -> Self {
        Self {
            parent,
            path: Some(path),
            buffer: None,
            flags: LoadFlags::default(),
        }
    }

    pub fn from_buffer(parent: Handle, buffer: &'a [u8]) -> Self {
        Self {
            parent,
            path: None,
            buffer: Some(buffer),
            flags: LoadFlags::default(),
        }
    }
}

/// What a successful load hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub handle: Handle,
    pub entry: PhysAddr,
}

/// Platform verdict on whether an image may be loaded.
pub trait LoadPolicy {
    /// `true` permits the load, `false` rejects it as a policy violation.
    fn verify(&mut self, path: Option<&DevicePath>, image: &[u8], boot_policy: bool) -> bool;
}

/// The null policy: everything loads.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl LoadPolicy for PermitAll {
    fn verify(&mut self, _path: Option<&DevicePath>, _image: &[u8], _boot_policy: bool) -> bool {
        true
    }
}

/// The system services a load or unload operates against, borrowed for the
/// duration of one call.
pub struct Services<'a> {
    pub memory: &'a mut dyn PageAllocator,
    pub directory: &'a mut dyn ObjectDirectory,
    pub registry: &'a mut RuntimeRegistry,
    pub format: &'a mut dyn ImageFormat,
    pub policy: &'a mut dyn LoadPolicy,
    /// Absent on platforms that only ever load from caller buffers.
    pub resolver: Option<&'a mut dyn SourceResolver>,
}

/// A page run owned by the loader, freed at teardown.
#[derive(Debug, Clone, Copy)]
struct OwnedPages {
    base: PhysAddr,
    count: usize,
}

/// Everything known about one loaded image.
///
/// Records are created by a successful load and destroyed by
/// [`ImageLoader::unload_image`]; between the two they are the single
/// authority on the image's identity and owned resources.
#[derive(Debug)]
pub struct ImageRecord {
    handle: Handle,
    /// `None` only for the host image.
    parent: Option<Handle>,
    base: PhysAddr,
    size: usize,
    entry: PhysAddr,
    machine: Machine,
    subsystem: Subsystem,
    code_kind: MemoryKind,
    data_kind: MemoryKind,
    section_alignment: usize,
    relocations_stripped: bool,
    debug_name: Option<Arc<str>>,
    /// The path the caller addressed the image by.
    file_path: Option<DevicePath>,
    /// The full path the bytes were actually read from.
    source_path: Option<DevicePath>,
    /// Present only when the pages came from the allocator.
    pages: Option<OwnedPages>,
    fixup: Option<Arc<[u8]>>,
    aux_resource: Option<PhysAddr>,
    registered: bool,
    load_status: Result<(), Error>,
    revision: u32,
}

impl ImageRecord {
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[must_use]
    pub fn parent(&self) -> Option<Handle> {
        self.parent
    }

    #[must_use]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn entry(&self) -> PhysAddr {
        self.entry
    }

    #[must_use]
    pub fn machine(&self) -> Machine {
        self.machine
    }

    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    #[must_use]
    pub fn code_kind(&self) -> MemoryKind {
        self.code_kind
    }

    #[must_use]
    pub fn data_kind(&self) -> MemoryKind {
        self.data_kind
    }

    #[must_use]
    pub fn section_alignment(&self) -> usize {
        self.section_alignment
    }

    #[must_use]
    pub fn relocations_stripped(&self) -> bool {
        self.relocations_stripped
    }

    #[must_use]
    pub fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }

    #[must_use]
    pub fn file_path(&self) -> Option<&DevicePath> {
        self.file_path.as_ref()
    }

    #[must_use]
    pub fn source_path(&self) -> Option<&DevicePath> {
        self.source_path.as_ref()
    }

    #[must_use]
    pub fn aux_resource(&self) -> Option<PhysAddr> {
        self.aux_resource
    }

    /// Whether the image sits in the runtime fixup registry.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Result of the image's load and relocation stage.
    #[must_use]
    pub fn load_status(&self) -> Result<(), Error> {
        self.load_status
    }

    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revision
    }
}

/// Loads, tracks, and unloads executable images.
#[derive(Debug)]
pub struct ImageLoader {
    config: LoaderConfig,
    images: BTreeMap<Handle, ImageRecord>,
    host: Option<Handle>,
}

impl ImageLoader {
    /// # Panics
    ///
    /// Panics if `config` is inconsistent, see [`LoaderConfig::assert_valid`].
    #[must_use]
    pub fn new(config: LoaderConfig) -> Self {
        config.assert_valid();
        Self {
            config,
            images: BTreeMap::new(),
            host: None,
        }
    }

    /// Publishes the already-running host image so it can parent subsequent
    /// loads. Its memory is not owned here and it can never be unloaded.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if a host image is already installed.
    /// - Directory errors from publication.
    pub fn install_host_image(
        &mut self,
        directory: &mut dyn ObjectDirectory,
        base: PhysAddr,
        size: usize,
        entry: PhysAddr,
    ) -> Result<Handle> {
        ensure!(
            self.host.is_none(),
            Error::InvalidParameter,
            "a host image is already installed"
        );
        let handle = publish::publish(directory, base, None, None)?;

        let record = ImageRecord {
            handle,
            parent: None,
            base,
            size,
            entry,
            machine: self.config.native_machine,
            subsystem: Subsystem::BootDriver,
            code_kind: MemoryKind::BootCode,
            data_kind: MemoryKind::BootData,
            section_alignment: PAGE_SIZE,
            relocations_stripped: false,
            debug_name: None,
            file_path: None,
            source_path: None,
            pages: None,
            fixup: None,
            aux_resource: None,
            registered: false,
            load_status: Ok(()),
            revision: RECORD_REVISION,
        };
        self.images.insert(handle, record);
        self.host = Some(handle);
        log::debug!("host image installed as {handle:?} at {base}");
        Ok(handle)
    }

    #[must_use]
    pub fn host(&self) -> Option<Handle> {
        self.host
    }

    #[must_use]
    pub fn record(&self, handle: Handle) -> Option<&ImageRecord> {
        self.images.get(&handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Loads an image into memory of the loader's choosing.
    ///
    /// On success the image is published in the directory and, when it is
    /// long-lived and registration was requested, entered into the runtime
    /// fixup registry. On failure every intermediate resource has been
    /// released again.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if the request carries neither a path
    ///   nor a buffer, or its parent is not a loaded image.
    /// - [`Error::NotFound`] if the request is by path and no resolver is
    ///   available, or the resolver cannot find the path.
    /// - [`Error::AccessDenied`] if the platform policy rejects the image.
    /// - Everything [`load_and_relocate`](Error) can produce: `LoadError`,
    ///   `Unsupported`, `OutOfResources`.
    pub fn load_image(
        &mut self,
        services: &mut Services<'_>,
        request: LoadRequest<'_>,
    ) -> Result<LoadOutcome> {
        self.load_common(services, request, None)
    }

    /// Like [`ImageLoader::load_image`], but the caller supplies the memory.
    ///
    /// With `destination` set, the image is materialized there instead of
    /// in freshly allocated pages and `page_budget` must cover it. When the
    /// budget is short the load fails with [`Error::BufferTooSmall`] and
    /// `page_budget` is rewritten to the count a retry needs. Without a
    /// destination this behaves exactly like `load_image` and the budget is
    /// not consulted.
    ///
    /// # Errors
    ///
    /// [`Error::BufferTooSmall`] as above, plus everything
    /// [`ImageLoader::load_image`] can produce.
    pub fn load_image_at(
        &mut self,
        services: &mut Services<'_>,
        request: LoadRequest<'_>,
        destination: Option<PhysAddr>,
        page_budget: &mut usize,
    ) -> Result<LoadOutcome> {
        let destination = destination.map(|address| Destination {
            address,
            page_budget: *page_budget,
        });
        match self.load_common(services, request, destination) {
            Err(Error::BufferTooSmall { required_pages }) => {
                *page_budget = required_pages;
                Err(Error::BufferTooSmall { required_pages })
            }
            outcome => outcome,
        }
    }

    fn load_common(
        &mut self,
        services: &mut Services<'_>,
        request: LoadRequest<'_>,
        destination: Option<Destination>,
    ) -> Result<LoadOutcome> {
        ensure!(
            request.path.is_some() || request.buffer.is_some(),
            Error::InvalidParameter,
            "a load request needs a source path or a source buffer"
        );
        ensure!(
            self.images.contains_key(&request.parent),
            Error::InvalidParameter,
            "the requesting parent is not a loaded image"
        );

        let boot_policy = request.flags.contains(LoadFlags::BOOT_POLICY);

        let (source, source_path) = if let Some(buffer) = request.buffer {
            (ImageSource::borrowed(buffer)?, request.path.clone())
        } else {
            let Some(path) = request.path.as_ref() else {
                bail!(Error::InvalidParameter, "a load request needs a source path or a source buffer");
            };
            let Some(resolver) = services.resolver.as_deref_mut() else {
                bail!(Error::NotFound, "no source resolver is available for path requests");
            };
            let resolved = resolver.resolve(path, boot_policy)?;
            (ImageSource::owned(resolved.bytes)?, Some(resolved.path))
        };

        if !services
            .policy
            .verify(request.path.as_ref(), source.as_bytes(), boot_policy)
        {
            bail!(Error::AccessDenied, "platform policy rejected the image");
        }

        let want_registration = request.flags.contains(LoadFlags::RUNTIME_REGISTRATION);
        let module = load::load_and_relocate(
            services.format,
            services.memory,
            &self.config,
            &source,
            destination,
            want_registration,
        )?;

        let aux_resource = if request.flags.contains(LoadFlags::AUX_DISCOVERY) {
            module.aux_resource
        } else {
            None
        };

        let handle = match publish::publish(
            services.directory,
            module.base,
            source_path.as_ref(),
            aux_resource,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                placement::release(services.memory, &module.placement);
                return Err(err);
            }
        };

        // Registration comes after publication so the entry can carry the
        // image's real handle. It cannot fail, so no unwind path is needed.
        let mut registered = false;
        if let Some(fixup) = &module.fixup {
            services.registry.register(RuntimeImage {
                base: module.base,
                size: module.size,
                fixup: Arc::downgrade(fixup),
                handle,
            });
            registered = true;
        }

        let record = ImageRecord {
            handle,
            parent: Some(request.parent),
            base: module.base,
            size: module.size,
            entry: module.entry,
            machine: module.info.machine,
            subsystem: module.info.subsystem,
            code_kind: module.code_kind,
            data_kind: module.data_kind,
            section_alignment: module.info.section_alignment,
            relocations_stripped: module.info.relocations_stripped,
            debug_name: module.debug_name,
            file_path: request.path,
            source_path,
            pages: module.placement.allocated.then_some(OwnedPages {
                base: module.placement.base,
                count: module.placement.pages,
            }),
            fixup: module.fixup,
            aux_resource,
            registered,
            load_status: Ok(()),
            revision: RECORD_REVISION,
        };
        self.images.insert(handle, record);

        let parent = request.parent;
        log::debug!("image {handle:?} loaded on behalf of {parent:?}");
        Ok(LoadOutcome {
            handle,
            entry: module.entry,
        })
    }

    /// Tears an image down and releases everything its load acquired.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `handle` is not a loaded image.
    /// - [`Error::AccessDenied`] for the host image.
    pub fn unload_image(&mut self, services: &mut Services<'_>, handle: Handle) -> Result<()> {
        if self.host == Some(handle) {
            bail!(Error::AccessDenied, "the host image cannot be unloaded");
        }
        let Some(record) = self.images.remove(&handle) else {
            bail!(Error::InvalidParameter, "cannot unload a handle that is not a loaded image");
        };
        Self::release_record(services, record);
        log::debug!("unloaded image {handle:?}");
        Ok(())
    }

    // Teardown order is fixed: directory revocation, registry removal,
    // transient buffers, pages, then the record itself. Each resource is
    // independently optional.
    fn release_record(services: &mut Services<'_>, mut record: ImageRecord) {
        publish::revoke(
            services.directory,
            record.handle,
            record.aux_resource.is_some(),
        );
        if record.registered {
            services.registry.unregister(record.handle);
        }
        record.fixup = None;
        record.file_path = None;
        record.source_path = None;
        if let Some(pages) = record.pages.take() {
            services.memory.free(pages.base, pages.count);
        }
    }
}
