// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The format-parser seam and the header metadata it reports.
//!
//! The loader never touches image internals itself. It asks an [`ImageFormat`]
//! for the header facts it needs to place the image, then drives the parser's
//! load and relocation passes at the address it chose.

use alloc::sync::Arc;
use core::fmt;
use core::fmt::{Display, Formatter};

use crate::Result;
use crate::mem::PhysAddr;
use crate::source::ImageSource;

/// An executable machine type, as reported by image headers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Machine(u16);

impl Machine {
    pub const IA32: Self = Self(0x014c);
    /// ARM with Thumb/mixed execution.
    pub const ARM: Self = Self(0x01c2);
    pub const EBC: Self = Self(0x0ebc);
    pub const RISCV32: Self = Self(0x5032);
    pub const RISCV64: Self = Self(0x5064);
    pub const X64: Self = Self(0x8664);
    pub const AARCH64: Self = Self(0xaa64);

    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// The machine type of the code this crate was compiled for.
    ///
    /// # Panics
    ///
    /// Panics on targets without a defined machine type.
    #[must_use]
    pub const fn native() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86")] {
                Self::IA32
            } else if #[cfg(target_arch = "x86_64")] {
                Self::X64
            } else if #[cfg(target_arch = "arm")] {
                Self::ARM
            } else if #[cfg(target_arch = "aarch64")] {
                Self::AARCH64
            } else if #[cfg(target_arch = "riscv32")] {
                Self::RISCV32
            } else if #[cfg(target_arch = "riscv64")] {
                Self::RISCV64
            } else {
                panic!("no machine type defined for this target")
            }
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0x014c => "IA32",
            0x01c2 => "ARM",
            0x0ebc => "EBC",
            0x5032 => "RISCV32",
            0x5064 => "RISCV64",
            0x8664 => "X64",
            0xaa64 => "AARCH64",
            _ => "unknown",
        }
    }
}

impl Display for Machine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name() {
            "unknown" => write!(f, "unknown ({:#06x})", self.0),
            name => f.write_str(name),
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Machine")
            .field(&format_args!("{:#06x}", self.0))
            .finish()
    }
}

const SUBSYSTEM_APPLICATION: u16 = 10;
const SUBSYSTEM_BOOT_DRIVER: u16 = 11;
const SUBSYSTEM_RUNTIME_DRIVER: u16 = 12;
const SUBSYSTEM_RUNTIME_SERVICE: u16 = 13;

/// The execution subsystem an image was linked for.
///
/// The subsystem decides the memory classification of the image's pages and
/// whether the image is long-lived, meaning it survives into the execution
/// phase after the address-space transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    /// A transient application; its pages are reclaimed when it exits.
    Application,
    /// A driver that ends with the boot phase.
    BootDriver,
    /// A driver that stays resident across the address-space transition.
    RuntimeDriver,
    /// A legacy runtime service, placed like a runtime driver.
    RuntimeService,
    /// Anything else; never executable here.
    Unknown(u16),
}

impl Subsystem {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            SUBSYSTEM_APPLICATION => Self::Application,
            SUBSYSTEM_BOOT_DRIVER => Self::BootDriver,
            SUBSYSTEM_RUNTIME_DRIVER => Self::RuntimeDriver,
            SUBSYSTEM_RUNTIME_SERVICE => Self::RuntimeService,
            _ => Self::Unknown(raw),
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u16 {
        match self {
            Self::Application => SUBSYSTEM_APPLICATION,
            Self::BootDriver => SUBSYSTEM_BOOT_DRIVER,
            Self::RuntimeDriver => SUBSYSTEM_RUNTIME_DRIVER,
            Self::RuntimeService => SUBSYSTEM_RUNTIME_SERVICE,
            Self::Unknown(raw) => raw,
        }
    }

    /// Whether images of this subsystem survive into the later phase.
    #[must_use]
    pub const fn is_long_lived(self) -> bool {
        matches!(self, Self::RuntimeDriver | Self::RuntimeService)
    }
}

/// Header facts the loader needs before any byte is moved.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub machine: Machine,
    pub subsystem: Subsystem,
    /// Size of the materialized image in bytes.
    pub image_size: usize,
    /// Required section alignment; always a power of two.
    pub section_alignment: usize,
    /// The base address the image was linked for.
    pub preferred_base: PhysAddr,
    /// Relocation information was stripped at link time; the image can only
    /// run at [`ImageInfo::preferred_base`].
    pub relocations_stripped: bool,
    /// The loader must round the allocated base up to the section alignment.
    /// Formats that pre-process alignment internally clear this and take the
    /// raw base.
    pub needs_alignment: bool,
    /// Bytes of fixup data [`ImageFormat::relocate`] wants to record, zero if
    /// the format keeps none.
    pub fixup_data_size: usize,
}

/// What [`ImageFormat::load`] materialized.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Address the image actually lives at.
    pub base: PhysAddr,
    /// Bytes occupied at `base`.
    pub size: usize,
    /// Absolute entry-point address.
    pub entry: PhysAddr,
    /// Name embedded in the image's debug directory, shared with the parser.
    pub debug_name: Option<Arc<str>>,
    /// Address of an embedded auxiliary resource section, if the image
    /// carries one.
    pub aux_resource: Option<PhysAddr>,
}

/// Parses and materializes one executable format.
///
/// The parser reads source bytes exclusively through
/// [`ImageSource::read_range`] and reports structural corruption as
/// [`Error::LoadError`](crate::Error::LoadError).
pub trait ImageFormat {
    /// Extracts the header facts without moving any bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadError`](crate::Error::LoadError) if the headers
    /// are malformed.
    fn read_info(&mut self, source: &ImageSource<'_>) -> Result<ImageInfo>;

    /// Materializes the image at `base`, which satisfies the alignment
    /// reported in `info`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadError`](crate::Error::LoadError) if the image
    /// cannot be materialized.
    fn load(
        &mut self,
        source: &ImageSource<'_>,
        info: &ImageInfo,
        base: PhysAddr,
    ) -> Result<LoadedImage>;

    /// Applies relocations to an image now living at its final address,
    /// recording the applied fixups into `fixup` when one is supplied.
    ///
    /// The buffer, when present, is exactly
    /// [`ImageInfo::fixup_data_size`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadError`](crate::Error::LoadError) if the
    /// relocation tables are malformed.
    fn relocate(&mut self, loaded: &LoadedImage, fixup: Option<&mut [u8]>) -> Result<()>;
}
