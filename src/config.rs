// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::format::Machine;
use crate::mem::{PAGE_SIZE, PhysAddr};

/// Addresses below this mark are reserved for legacy firmware shims; images
/// preferring a base below it are not granted a fixed placement.
const LOW_MEMORY_TOP_DEFAULT: usize = 0x10_0000;

/// Platform facts the loader consults on every load.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub struct LoaderConfig {
    /// The machine type executable natively on this platform.
    pub native_machine: Machine,
    /// Machine types executable through interpretation on top of the native
    /// one. Byte-code images are the usual members.
    pub cross_machines: &'static [Machine],
    /// Top of the reserved low-memory region. Preferred bases below this are
    /// only honored for images that physically cannot run elsewhere.
    pub low_memory_top: PhysAddr,
}

impl LoaderConfig {
    /// Creates a new default configuration with the following values:
    ///
    /// - `native_machine`: the machine type this crate was compiled for
    /// - `cross_machines`: EBC byte code
    /// - `low_memory_top`: 1 MiB
    #[must_use]
    pub const fn new_default() -> Self {
        Self {
            native_machine: Machine::native(),
            cross_machines: &[Machine::EBC],
            low_memory_top: PhysAddr::new(LOW_MEMORY_TOP_DEFAULT),
        }
    }

    /// Asserts that the configuration is valid.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn assert_valid(&self) {
        assert!(
            self.low_memory_top.is_aligned_to(PAGE_SIZE),
            "low_memory_top must be page aligned"
        );
        assert!(
            !self.cross_machines.contains(&self.native_machine),
            "the native machine type cannot also be a cross machine type"
        );
    }

    /// Whether images of the given machine type can execute here.
    #[must_use]
    pub fn supports(&self, machine: Machine) -> bool {
        machine == self.native_machine || self.cross_machines.contains(&machine)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::new_default()
    }
}
