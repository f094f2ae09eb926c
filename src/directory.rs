// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The system object directory: handles, typed records, and the open-use
//! bookkeeping other components hang off them.
//!
//! Loaded images become visible to the rest of the system by installing
//! records here and disappear by uninstalling them. The loader only ever
//! talks to the [`ObjectDirectory`] trait; [`BootDirectory`] is the
//! in-memory implementation used during the preboot phase and in tests.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use core::num::NonZeroU64;

use smallvec::{SmallVec, smallvec};

use crate::error::Error;
use crate::mem::PhysAddr;
use crate::source::DevicePath;
use crate::{Result, bail, ensure};

/// Opaque identity of an object in the directory.
///
/// Handles are minted by the directory and never reused within its lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(NonZeroU64);

impl Handle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0.get())
    }
}

/// Identifies the type of a record installed on a handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey(u128);

impl RecordKey {
    /// The record describing a loaded image: its base address and, through
    /// the owning loader, everything else about it.
    pub const IMAGE: Self = Self(0x5b1b31a1_9562_11d2_8e3f_00a0c969723b);
    /// Where the image was loaded from. Present on every image handle, with
    /// an empty payload when the origin is unknown.
    pub const IMAGE_PATH: Self = Self(0xbc62157e_3e33_4fec_9920_2d3b36d750df);
    /// Format-specific auxiliary resource discovered inside the image, for
    /// consumers that know how to parse it.
    pub const AUX_RESOURCE: Self = Self(0x0fd96974_23aa_4cdc_b9cb_98d17750322a);

    #[must_use]
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u128 {
        self.0
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IMAGE => f.write_str("RecordKey::IMAGE"),
            Self::IMAGE_PATH => f.write_str("RecordKey::IMAGE_PATH"),
            Self::AUX_RESOURCE => f.write_str("RecordKey::AUX_RESOURCE"),
            Self(raw) => write!(f, "RecordKey({raw:#034x})"),
        }
    }
}

/// One consumer holding a record open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenUse {
    /// The object doing the opening.
    pub opener: Handle,
    /// The object on whose behalf it was opened, if any.
    pub controller: Option<Handle>,
}

/// What a record carries. The directory stores payloads verbatim; their
/// meaning belongs to the [`RecordKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    None,
    Path(DevicePath),
    Address(PhysAddr),
}

/// Directory of handles and the typed records installed on them.
///
/// Uninstalling a record discards any outstanding uses along with it; it is
/// the caller's job to close uses it wants shut down gracefully first. A
/// handle vanishes when its last record is uninstalled.
pub trait ObjectDirectory {
    /// Installs a record, minting a fresh handle when `handle` is `None`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParameter`] if `handle` names an unknown handle, or
    ///   if it already carries a record with this key.
    /// - [`Error::OutOfResources`] if no more handles can be minted.
    fn install(
        &mut self,
        handle: Option<Handle>,
        key: RecordKey,
        payload: RecordPayload,
    ) -> Result<Handle>;

    /// Removes the record with `key` from `handle`, dropping its uses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle or the record does not
    /// exist.
    fn uninstall(&mut self, handle: Handle, key: RecordKey) -> Result<()>;

    fn contains(&self, handle: Handle) -> bool;

    /// Every live handle in the directory.
    ///
    /// # Errors
    ///
    /// Implementations backed by external state may fail to enumerate.
    fn handles(&self) -> Result<Vec<Handle>>;

    /// The keys of all records installed on `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle does not exist.
    fn record_keys(&self, handle: Handle) -> Result<Vec<RecordKey>>;

    /// The outstanding uses of one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle or the record does not
    /// exist.
    fn open_uses(&self, handle: Handle, key: RecordKey) -> Result<Vec<OpenUse>>;

    /// Notes that `open_use.opener` holds the record open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle or the record does not
    /// exist.
    fn record_use(&mut self, handle: Handle, key: RecordKey, open_use: OpenUse) -> Result<()>;

    /// Removes every use of the record matching `open_use`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the handle or the record does not
    /// exist, or if no use matches.
    fn close_use(&mut self, handle: Handle, key: RecordKey, open_use: OpenUse) -> Result<()>;
}

#[derive(Debug)]
struct Record {
    key: RecordKey,
    payload: RecordPayload,
    uses: SmallVec<[OpenUse; 2]>,
}

/// In-memory [`ObjectDirectory`] for the preboot phase.
#[derive(Debug, Default)]
pub struct BootDirectory {
    objects: BTreeMap<Handle, SmallVec<[Record; 4]>>,
    next_handle: u64,
}

impl BootDirectory {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_handle: 0,
        }
    }

    /// The payload of one record, mostly for inspection and tests.
    #[must_use]
    pub fn payload(&self, handle: Handle, key: RecordKey) -> Option<&RecordPayload> {
        self.objects
            .get(&handle)?
            .iter()
            .find(|record| record.key == key)
            .map(|record| &record.payload)
    }

    fn mint(&mut self) -> Result<Handle> {
        let Some(handle) = self.next_handle.checked_add(1).and_then(Handle::from_raw) else {
            bail!(Error::OutOfResources, "handle space exhausted");
        };
        self.next_handle = handle.as_raw();
        Ok(handle)
    }
}

impl ObjectDirectory for BootDirectory {
    fn install(
        &mut self,
        handle: Option<Handle>,
        key: RecordKey,
        payload: RecordPayload,
    ) -> Result<Handle> {
        match handle {
            Some(handle) => {
                let Some(records) = self.objects.get_mut(&handle) else {
                    bail!(Error::InvalidParameter, "cannot install a record on an unknown handle");
                };
                ensure!(
                    records.iter().all(|record| record.key != key),
                    Error::InvalidParameter,
                    "handle already carries a record with this key"
                );
                records.push(Record {
                    key,
                    payload,
                    uses: SmallVec::new(),
                });
                Ok(handle)
            }
            None => {
                let handle = self.mint()?;
                self.objects.insert(
                    handle,
                    smallvec![Record {
                        key,
                        payload,
                        uses: SmallVec::new(),
                    }],
                );
                Ok(handle)
            }
        }
    }

    fn uninstall(&mut self, handle: Handle, key: RecordKey) -> Result<()> {
        let Some(records) = self.objects.get_mut(&handle) else {
            bail!(Error::NotFound, "no such handle in the directory");
        };
        let Some(index) = records.iter().position(|record| record.key == key) else {
            bail!(Error::NotFound, "handle carries no record with this key");
        };
        // Outstanding uses go down with the record.
        records.remove(index);
        if records.is_empty() {
            self.objects.remove(&handle);
        }
        Ok(())
    }

    fn contains(&self, handle: Handle) -> bool {
        self.objects.contains_key(&handle)
    }

    fn handles(&self) -> Result<Vec<Handle>> {
        Ok(self.objects.keys().copied().collect())
    }

    fn record_keys(&self, handle: Handle) -> Result<Vec<RecordKey>> {
        let Some(records) = self.objects.get(&handle) else {
            bail!(Error::NotFound, "no such handle in the directory");
        };
        Ok(records.iter().map(|record| record.key).collect())
    }

    fn open_uses(&self, handle: Handle, key: RecordKey) -> Result<Vec<OpenUse>> {
        let Some(records) = self.objects.get(&handle) else {
            bail!(Error::NotFound, "no such handle in the directory");
        };
        let Some(record) = records.iter().find(|record| record.key == key) else {
            bail!(Error::NotFound, "handle carries no record with this key");
        };
        Ok(record.uses.to_vec())
    }

    fn record_use(&mut self, handle: Handle, key: RecordKey, open_use: OpenUse) -> Result<()> {
        let Some(records) = self.objects.get_mut(&handle) else {
            bail!(Error::NotFound, "no such handle in the directory");
        };
        let Some(record) = records.iter_mut().find(|record| record.key == key) else {
            bail!(Error::NotFound, "handle carries no record with this key");
        };
        record.uses.push(open_use);
        Ok(())
    }

    fn close_use(&mut self, handle: Handle, key: RecordKey, open_use: OpenUse) -> Result<()> {
        let Some(records) = self.objects.get_mut(&handle) else {
            bail!(Error::NotFound, "no such handle in the directory");
        };
        let Some(record) = records.iter_mut().find(|record| record.key == key) else {
            bail!(Error::NotFound, "handle carries no record with this key");
        };
        let before = record.uses.len();
        record.uses.retain(|existing| *existing != open_use);
        ensure!(
            record.uses.len() != before,
            Error::NotFound,
            "no matching use on the record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opener(raw: u64) -> OpenUse {
        OpenUse {
            opener: Handle::from_raw(raw).unwrap(),
            controller: None,
        }
    }

    #[test]
    fn minted_handles_are_distinct() {
        let mut dir = BootDirectory::new();
        let a = dir.install(None, RecordKey::IMAGE, RecordPayload::None).unwrap();
        let b = dir.install(None, RecordKey::IMAGE, RecordPayload::None).unwrap();
        assert_ne!(a, b);
        assert!(dir.contains(a));
        assert!(dir.contains(b));
        assert_eq!(dir.handles().unwrap(), [a, b]);
    }

    #[test]
    fn duplicate_keys_on_a_handle_are_rejected() {
        let mut dir = BootDirectory::new();
        let handle = dir.install(None, RecordKey::IMAGE, RecordPayload::None).unwrap();
        let err = dir
            .install(Some(handle), RecordKey::IMAGE, RecordPayload::None)
            .unwrap_err();
        assert_eq!(err, Error::InvalidParameter);

        dir.install(Some(handle), RecordKey::IMAGE_PATH, RecordPayload::None)
            .unwrap();
        assert_eq!(
            dir.record_keys(handle).unwrap(),
            [RecordKey::IMAGE, RecordKey::IMAGE_PATH]
        );
    }

    #[test]
    fn installing_on_an_unknown_handle_is_rejected() {
        let mut dir = BootDirectory::new();
        let bogus = Handle::from_raw(77).unwrap();
        let err = dir
            .install(Some(bogus), RecordKey::IMAGE, RecordPayload::None)
            .unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
        assert!(!dir.contains(bogus));
    }

    #[test]
    fn a_handle_disappears_with_its_last_record() {
        let mut dir = BootDirectory::new();
        let handle = dir.install(None, RecordKey::IMAGE, RecordPayload::None).unwrap();
        dir.install(Some(handle), RecordKey::IMAGE_PATH, RecordPayload::None)
            .unwrap();

        dir.uninstall(handle, RecordKey::IMAGE_PATH).unwrap();
        assert!(dir.contains(handle));
        dir.uninstall(handle, RecordKey::IMAGE).unwrap();
        assert!(!dir.contains(handle));

        assert_eq!(dir.uninstall(handle, RecordKey::IMAGE).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn uses_are_recorded_and_closed_per_record() {
        let mut dir = BootDirectory::new();
        let handle = dir.install(None, RecordKey::IMAGE, RecordPayload::None).unwrap();

        dir.record_use(handle, RecordKey::IMAGE, opener(10)).unwrap();
        dir.record_use(handle, RecordKey::IMAGE, opener(11)).unwrap();
        assert_eq!(
            dir.open_uses(handle, RecordKey::IMAGE).unwrap(),
            [opener(10), opener(11)]
        );

        dir.close_use(handle, RecordKey::IMAGE, opener(10)).unwrap();
        assert_eq!(dir.open_uses(handle, RecordKey::IMAGE).unwrap(), [opener(11)]);

        let err = dir.close_use(handle, RecordKey::IMAGE, opener(10)).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn uninstall_discards_outstanding_uses() {
        let mut dir = BootDirectory::new();
        let handle = dir.install(None, RecordKey::IMAGE, RecordPayload::None).unwrap();
        dir.install(Some(handle), RecordKey::IMAGE_PATH, RecordPayload::None)
            .unwrap();
        dir.record_use(handle, RecordKey::IMAGE_PATH, opener(10)).unwrap();

        dir.uninstall(handle, RecordKey::IMAGE_PATH).unwrap();
        assert!(dir.contains(handle));
        assert_eq!(
            dir.open_uses(handle, RecordKey::IMAGE_PATH).unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn payloads_are_stored_verbatim() {
        let mut dir = BootDirectory::new();
        let base = PhysAddr::new(0x40_0000);
        let handle = dir
            .install(None, RecordKey::IMAGE, RecordPayload::Address(base))
            .unwrap();
        let path = DevicePath::new([1u8, 2, 3]);
        dir.install(Some(handle), RecordKey::IMAGE_PATH, RecordPayload::Path(path.clone()))
            .unwrap();

        assert_eq!(
            dir.payload(handle, RecordKey::IMAGE),
            Some(&RecordPayload::Address(base))
        );
        assert_eq!(
            dir.payload(handle, RecordKey::IMAGE_PATH),
            Some(&RecordPayload::Path(path))
        );
        assert_eq!(dir.payload(handle, RecordKey::AUX_RESOURCE), None);
    }
}
