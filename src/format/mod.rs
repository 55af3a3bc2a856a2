/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{io, str::Utf8Error};

use bstr::ByteSlice;
use thiserror::Error;

pub mod android;
pub mod bump;
pub mod loki;
pub mod padding;
pub mod sony_elf;

/// Errors reported by the individual format codecs. The [`BootImage`]
/// facade folds all of these into a single coarse parse-error code.
///
/// [`BootImage`]: crate::bootimage::BootImage
#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown boot image format")]
    UnknownFormat,
    #[error("No {0:?} magic found within the search range")]
    MagicNotFound(&'static str),
    #[error("{0:?} field: invalid value: {1}")]
    InvalidFieldValue(&'static str, u32),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("Failed to read {0:?} field")]
    ReadFieldError(&'static str, #[source] io::Error),
    #[error("Failed to write {0:?} field")]
    WriteFieldError(&'static str, #[source] io::Error),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .1.as_bstr())]
    StringNotUtf8(&'static str, Vec<u8>, #[source] Utf8Error),
    #[error("An aboot image is required to create a Loki image")]
    MissingAboot,
    #[error("No signature check function found in the aboot image")]
    AbootTargetNotFound,
    #[error("Loki shellcode not found in the boot image")]
    ShellcodeNotFound,
    #[error("No ramdisk found in old-style Loki image")]
    RamdiskNotFound,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
