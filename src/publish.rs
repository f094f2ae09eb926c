// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Publishing images to the object directory and taking them back out.
//!
//! Publication is transactional: either every record lands on the new
//! handle or none do. Revocation deliberately is not, teardown has to keep
//! going past individual failures.

use alloc::vec;
use alloc::vec::Vec;

use fallible_iterator::FallibleIterator;

use crate::Result;
use crate::directory::{Handle, ObjectDirectory, OpenUse, RecordKey, RecordPayload};
use crate::error::Error;
use crate::mem::PhysAddr;
use crate::source::DevicePath;

/// Installs the records that make a loaded image visible: [`RecordKey::IMAGE`]
/// on a freshly minted handle, [`RecordKey::IMAGE_PATH`] always (empty when
/// the origin is unknown), and [`RecordKey::AUX_RESOURCE`] only when the
/// image carries one.
///
/// # Errors
///
/// Forwards the directory's error. Records installed before the failure are
/// uninstalled again, so a failed publish leaves no trace.
pub fn publish(
    directory: &mut dyn ObjectDirectory,
    base: PhysAddr,
    path: Option<&DevicePath>,
    aux: Option<PhysAddr>,
) -> Result<Handle> {
    let handle = directory.install(None, RecordKey::IMAGE, RecordPayload::Address(base))?;

    let payload = path.map_or(RecordPayload::None, |path| RecordPayload::Path(path.clone()));
    if let Err(err) = directory.install(Some(handle), RecordKey::IMAGE_PATH, payload) {
        uninstall_quiet(directory, handle, RecordKey::IMAGE);
        return Err(err);
    }

    if let Some(address) = aux {
        let payload = RecordPayload::Address(address);
        if let Err(err) = directory.install(Some(handle), RecordKey::AUX_RESOURCE, payload) {
            uninstall_quiet(directory, handle, RecordKey::IMAGE_PATH);
            uninstall_quiet(directory, handle, RecordKey::IMAGE);
            return Err(err);
        }
    }

    log::trace!("published image records on {handle:?}");
    Ok(handle)
}

/// Withdraws a published image from the directory.
///
/// First forces closed every use the image holds on other objects, then
/// uninstalls its own records. Failures are logged and skipped over;
/// revocation completes regardless.
pub fn revoke(directory: &mut dyn ObjectDirectory, handle: Handle, has_aux: bool) {
    close_uses_by(directory, handle);
    uninstall_quiet(directory, handle, RecordKey::IMAGE_PATH);
    uninstall_quiet(directory, handle, RecordKey::IMAGE);
    if has_aux {
        uninstall_quiet(directory, handle, RecordKey::AUX_RESOURCE);
    }
}

fn uninstall_quiet(directory: &mut dyn ObjectDirectory, handle: Handle, key: RecordKey) {
    if let Err(err) = directory.uninstall(handle, key) {
        log::warn!("failed to uninstall {key:?} from {handle:?}: {err}");
    }
}

/// Walks every open use in the directory, one record at a time.
///
/// Enumeration failures consume the failing handle or record key; the scan
/// resumes at the next element, so a single misbehaving object cannot hide
/// the rest of the directory.
pub struct UseScan<'a> {
    directory: &'a dyn ObjectDirectory,
    handles: vec::IntoIter<Handle>,
    keys: Option<(Handle, vec::IntoIter<RecordKey>)>,
    uses: Option<(Handle, RecordKey, vec::IntoIter<OpenUse>)>,
}

impl<'a> UseScan<'a> {
    /// # Errors
    ///
    /// Fails when the directory cannot enumerate its handles at all.
    pub fn new(directory: &'a dyn ObjectDirectory) -> Result<Self> {
        Ok(Self {
            handles: directory.handles()?.into_iter(),
            directory,
            keys: None,
            uses: None,
        })
    }
}

impl FallibleIterator for UseScan<'_> {
    type Item = (Handle, RecordKey, OpenUse);
    type Error = Error;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        loop {
            if let Some((handle, key, uses)) = &mut self.uses {
                if let Some(open_use) = uses.next() {
                    return Ok(Some((*handle, *key, open_use)));
                }
                self.uses = None;
            }

            if let Some((handle, keys)) = &mut self.keys {
                let handle = *handle;
                if let Some(key) = keys.next() {
                    let uses = self.directory.open_uses(handle, key)?;
                    self.uses = Some((handle, key, uses.into_iter()));
                    continue;
                }
                self.keys = None;
                continue;
            }

            let Some(handle) = self.handles.next() else {
                return Ok(None);
            };
            let keys = self.directory.record_keys(handle)?;
            self.keys = Some((handle, keys.into_iter()));
        }
    }
}

fn uses_held_by(
    directory: &dyn ObjectDirectory,
    owner: Handle,
) -> Vec<(Handle, RecordKey, OpenUse)> {
    let mut scan = match UseScan::new(directory) {
        Ok(scan) => scan,
        Err(err) => {
            log::warn!("could not enumerate directory handles: {err}");
            return Vec::new();
        }
    };

    let mut matches = Vec::new();
    loop {
        match scan.next() {
            Ok(Some((handle, key, open_use))) if open_use.opener == owner => {
                matches.push((handle, key, open_use));
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(err) => log::warn!("use enumeration failed on one record: {err}"),
        }
    }
    matches
}

/// Forces closed every use `owner` holds anywhere in the directory.
///
/// The scan completes before any use is closed so the directory is never
/// mutated mid-enumeration.
pub fn close_uses_by(directory: &mut dyn ObjectDirectory, owner: Handle) {
    for (handle, key, open_use) in uses_held_by(&*directory, owner) {
        if let Err(err) = directory.close_use(handle, key, open_use) {
            log::warn!("failed to close a use held by {owner:?}: {err}");
        }
    }
}
