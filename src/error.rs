// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

use crate::mem::AllocError;

/// The ways an image load or unload can fail.
///
/// Every failure unwinds only the resources its own stage acquired and then
/// surfaces here unchanged; nothing is downgraded or retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A call argument is malformed or contradicts another argument.
    InvalidParameter,
    /// The image bytes could not be resolved from the given source.
    NotFound,
    /// The image's machine type or subsystem is not executable here.
    Unsupported,
    /// A caller-supplied placement is too small for the image.
    ///
    /// Carries the page count the placement actually needs; the caller is
    /// expected to retry with at least that budget.
    BufferTooSmall { required_pages: usize },
    /// Memory for the image or one of its buffers could not be allocated.
    OutOfResources,
    /// The platform policy rejected the image, or the operation is forbidden.
    AccessDenied,
    /// The parser reported the image as structurally corrupt.
    LoadError,
}

impl From<AllocError> for Error {
    fn from(_value: AllocError) -> Self {
        Self::OutOfResources
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidParameter => write!(f, "An argument is invalid"),
            Error::NotFound => write!(f, "The image source could not be resolved"),
            Error::Unsupported => {
                write!(f, "The image is not executable on this platform")
            }
            Error::BufferTooSmall { required_pages } => write!(
                f,
                "The supplied placement is too small, {required_pages} pages are required",
            ),
            Error::OutOfResources => write!(
                f,
                "The system was not able to allocate some resource needed for the operation",
            ),
            Error::AccessDenied => {
                write!(f, "The caller did not have permission to perform the specified operation")
            }
            Error::LoadError => write!(f, "The image is structurally corrupt"),
        }
    }
}

impl core::error::Error for Error {}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error:expr, $msg:expr) => {
        if !$cond {
            log::error!($msg);
            return Err($error);
        }
    };
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}

#[macro_export]
macro_rules! bail {
    ($error:expr) => {
        return Err($error);
    };
    ($error:expr, $msg:expr) => {
        log::error!($msg);
        return Err($error);
    };
}
