// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use crate::{
    bootimage::Intermediate,
    format::{android, Result},
};

/// Trailer appended by the Bump tool after the last payload page.
pub const BUMP_MAGIC: [u8; 16] = [
    0x41, 0xa9, 0xe4, 0x67, 0x74, 0x4d, 0x1d, 0x1b, 0xa4, 0x29, 0xf2, 0xec, 0xea, 0x65, 0x52, 0x79,
];

pub fn is_valid(data: &[u8]) -> bool {
    data.ends_with(&BUMP_MAGIC) && android::is_valid(data)
}

pub fn load_image(i10e: &mut Intermediate, data: &[u8]) -> Result<()> {
    let inner = data.strip_suffix(&BUMP_MAGIC).unwrap_or(data);

    android::load_image(i10e, inner)
}

pub fn create_image(i10e: &Intermediate) -> Result<Vec<u8>> {
    let mut data = android::create_image(i10e)?;
    data.extend_from_slice(&BUMP_MAGIC);

    Ok(data)
}
