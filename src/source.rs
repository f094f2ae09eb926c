// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Byte sources for one load attempt, and the seam that resolves them.

use alloc::boxed::Box;

use crate::error::Error;
use crate::{Result, bail, ensure};

/// An opaque path identifying where an image came from.
///
/// The loader never interprets the bytes; it duplicates and publishes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePath(Box<[u8]>);

impl DevicePath {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

enum SourceBytes<'a> {
    /// Supplied by the caller, who keeps ownership.
    Borrowed(&'a [u8]),
    /// Read by this crate, released when the load attempt concludes.
    Owned(Box<[u8]>),
}

/// The raw bytes of one image, alive for exactly one load attempt.
pub struct ImageSource<'a> {
    bytes: SourceBytes<'a>,
}

impl<'a> ImageSource<'a> {
    /// Wraps a caller-supplied buffer without taking ownership.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadError`] if the buffer is empty.
    pub fn borrowed(bytes: &'a [u8]) -> Result<Self> {
        ensure!(!bytes.is_empty(), Error::LoadError, "image source is empty");
        Ok(Self {
            bytes: SourceBytes::Borrowed(bytes),
        })
    }

    /// Takes ownership of bytes this crate resolved itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadError`] if the buffer is empty.
    pub fn owned(bytes: Box<[u8]>) -> Result<Self> {
        ensure!(!bytes.is_empty(), Error::LoadError, "image source is empty");
        Ok(Self {
            bytes: SourceBytes::Owned(bytes),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Always false; empty sources are rejected at construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.bytes {
            SourceBytes::Borrowed(bytes) => bytes,
            SourceBytes::Owned(bytes) => bytes,
        }
    }

    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// The read is clamped to the remaining source size; an offset at or past
    /// the end yields an empty slice rather than an error. This is the only
    /// I/O primitive the format parser sees.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `offset + length` overflows the
    /// addressable space.
    pub fn read_range(&self, offset: usize, length: usize) -> Result<&[u8]> {
        let Some(end) = offset.checked_add(length) else {
            bail!(Error::InvalidParameter, "read range overflows the addressable space");
        };
        let bytes = self.as_bytes();
        if offset >= bytes.len() {
            return Ok(&[]);
        }
        Ok(bytes.get(offset..end.min(bytes.len())).unwrap_or(&[]))
    }
}

/// What a [`SourceResolver`] hands back for a device path.
#[derive(Debug)]
pub struct ResolvedSource {
    pub bytes: Box<[u8]>,
    /// The full path the bytes were actually read from.
    pub path: DevicePath,
}

/// Turns a device path into image bytes.
///
/// Volume, file-system, and network access live behind this seam; the loader
/// only ever sees the finished buffer.
pub trait SourceResolver {
    /// Reads the image identified by `path`.
    ///
    /// `boot_policy` selects the boot-media fallback behavior for sources
    /// that distinguish boot reads from application reads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the path does not lead to readable
    /// bytes.
    fn resolve(&mut self, path: &DevicePath, boot_policy: bool) -> Result<ResolvedSource>;
}
