// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::mem;

use bstr::ByteSlice;
use tracing::debug;
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    bootimage::{Intermediate, DEFAULT_BASE, DEFAULT_TAGS_OFFSET},
    format::{android, padding, Error, Result},
};
use crate::format::padding::ZeroPadding;

pub const LOKI_MAGIC: [u8; 4] = *b"LOKI";
pub const LOKI_MAGIC_OFFSET: usize = 0x400;

/// Loki'd images keep the Android header at the front of the file, so only
/// a small prefix needs to be searched.
const HEADER_SEARCH_RANGE: usize = 32;

/// Thumb shellcode the Loki tool writes over the copied aboot code,
/// including the string literal's trailing NUL, which the tool writes too.
/// The last two words are placeholders: `0xffffffff` is replaced with the
/// address of the patched signature check and `0xeeeeeeee` with the original
/// ramdisk load address.
const LOKI_SHELLCODE: [u8; 69] = [
    0xfe, 0xb5, 0x0d, 0x4d, 0xd5, 0xf8, 0x88, 0x04, 0xab, 0x68, 0x98, 0x42, 0x12, 0xd0, 0xd5,
    0xf8, 0x90, 0x64, 0x0a, 0x4c, 0xd5, 0xf8, 0x8c, 0x74, 0x07, 0xf5, 0x80, 0x57, 0x0f, 0xce,
    0x0f, 0xc4, 0x10, 0x3f, 0xfb, 0xdc, 0xd5, 0xf8, 0x88, 0x04, 0x04, 0x49, 0xd5, 0xf8, 0x8c,
    0x24, 0xa8, 0x60, 0x69, 0x61, 0x2a, 0x61, 0x00, 0x20, 0xd5, 0xf8, 0x8c, 0x04, 0xf9, 0xe7,
    0xff, 0xff, 0xff, 0xff, 0xee, 0xee, 0xee, 0xee, 0x00,
];

/// Fixed part of the shellcode, ending right before the placeholder words.
const SHELLCODE_PREFIX_LEN: usize = LOKI_SHELLCODE.len() - 9;

/// Offset of the original ramdisk address within a patched shellcode copy.
const SHELLCODE_RAMDISK_OFFSET: usize = LOKI_SHELLCODE.len() - 5;

/// Byte signatures of the signature check function in vulnerable Samsung
/// aboot builds.
const ABOOT_PATTERNS: [[u8; 8]; 3] = [
    [0xf0, 0xb5, 0x8f, 0xb0, 0x06, 0x46, 0xf0, 0xf7],
    [0xf0, 0xb5, 0x8f, 0xb0, 0x07, 0x46, 0xf0, 0xf7],
    [0x2d, 0xe9, 0xf0, 0x41, 0x86, 0xb0, 0xf1, 0xf7],
];

/// LG variants, checked in a second pass. Some LG aboot builds contain more
/// than one of these, so the Samsung patterns must be exhausted first.
const ABOOT_PATTERNS_LG: [[u8; 8]; 3] = [
    [0x2d, 0xe9, 0xf0, 0x4f, 0xad, 0xf5, 0xc6, 0x6d],
    [0x2d, 0xe9, 0xf0, 0x4f, 0xad, 0xf5, 0x21, 0x7d],
    [0x2d, 0xe9, 0xf0, 0x4f, 0xf3, 0xb0, 0x05, 0x46],
];

/// Raw on-disk layout of the Loki header at [`LOKI_MAGIC_OFFSET`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawLokiHeader {
    /// Magic value. This should be equal to [`LOKI_MAGIC`].
    magic: [u8; 4],
    /// 0 for a boot image, 1 for a recovery image.
    recovery: little_endian::U32,
    build: [u8; 128],
    orig_kernel_size: little_endian::U32,
    orig_ramdisk_size: little_endian::U32,
    /// Load address of the shellcode's relocated ramdisk.
    ramdisk_addr: little_endian::U32,
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;

    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn is_valid(data: &[u8]) -> bool {
    data.len() >= LOKI_MAGIC_OFFSET + mem::size_of::<RawLokiHeader>()
        && data[LOKI_MAGIC_OFFSET..LOKI_MAGIC_OFFSET + LOKI_MAGIC.len()] == LOKI_MAGIC
        && android::find_header(data, HEADER_SEARCH_RANGE).is_some()
}

pub fn load_image(i10e: &mut Intermediate, data: &[u8]) -> Result<()> {
    let offset =
        android::find_header(data, HEADER_SEARCH_RANGE).ok_or(Error::MagicNotFound("ANDROID!"))?;

    // The Android header's size fields are rewritten by the Loki patch and
    // cannot be trusted. Everything else is taken from it as usual.
    android::load_header(i10e, data, offset)?;

    let loki_data = data
        .get(LOKI_MAGIC_OFFSET..)
        .ok_or(Error::FieldOutOfBounds("loki_header"))?;
    let (loki, _) = RawLokiHeader::read_from_prefix(loki_data)
        .map_err(|_| Error::FieldOutOfBounds("loki_header"))?;

    if loki.magic != LOKI_MAGIC {
        return Err(Error::MagicNotFound("LOKI"));
    }

    if loki.orig_kernel_size.get() != 0
        && loki.orig_ramdisk_size.get() != 0
        && loki.ramdisk_addr.get() != 0
    {
        debug!("Loki image is new-style");
        load_new_image(i10e, data, &loki)
    } else {
        debug!("Loki image is old-style");
        load_old_image(i10e, data, &loki)
    }
}

fn load_new_image(i10e: &mut Intermediate, data: &[u8], loki: &RawLokiHeader) -> Result<()> {
    let page_size = i10e.page_size as usize;
    let kernel_size = loki.orig_kernel_size.get() as usize;
    let ramdisk_size = loki.orig_ramdisk_size.get() as usize;

    let ramdisk_addr = find_ramdisk_address(data, loki, i10e.kernel_addr)?;

    let page_kernel_size = padding::round(kernel_size, page_size)
        .ok_or(Error::FieldOutOfBounds("orig_kernel_size"))?;

    // The kernel occupies the pages after the header; the ramdisk follows on
    // the next page boundary.
    let kernel = data
        .get(page_size..page_size + kernel_size)
        .ok_or(Error::FieldOutOfBounds("orig_kernel_size"))?;
    let ramdisk_offset = page_size + page_kernel_size;
    let ramdisk = data
        .get(ramdisk_offset..ramdisk_offset + ramdisk_size)
        .ok_or(Error::FieldOutOfBounds("orig_ramdisk_size"))?;

    i10e.hdr_kernel_size = kernel_size as u32;
    i10e.hdr_ramdisk_size = ramdisk_size as u32;
    i10e.ramdisk_addr = ramdisk_addr;
    i10e.kernel = kernel.to_vec();
    i10e.ramdisk = ramdisk.to_vec();

    // Neither a second bootloader nor a device tree survives the patch.
    i10e.hdr_second_size = 0;
    i10e.second.clear();
    i10e.hdr_dt_size = 0;
    i10e.device_tree.clear();

    Ok(())
}

fn load_old_image(i10e: &mut Intermediate, data: &[u8], loki: &RawLokiHeader) -> Result<()> {
    // Old Loki clobbers the kernel tags address, so fall back to the default.
    i10e.tags_addr = DEFAULT_BASE.wrapping_add(DEFAULT_TAGS_OFFSET);

    let page_size = i10e.page_size as usize;

    // The kernel size field is zeroed, but the zImage header stores the
    // image's own size at a fixed offset.
    let kernel_size =
        read_u32_le(data, page_size + 0x2c).ok_or(Error::FieldOutOfBounds("kernel_size"))? as usize;
    let kernel = data
        .get(page_size..page_size + kernel_size)
        .ok_or(Error::FieldOutOfBounds("kernel_size"))?;

    // The ramdisk size field is also zeroed. The gzip archive runs from its
    // header to the aboot copy at the end of the file, padded with zeros.
    let ramdisk_offset =
        find_gzip_offset(data, page_size + kernel_size).ok_or(Error::RamdiskNotFound)?;
    let aboot_offset = data
        .len()
        .checked_sub(0x200)
        .filter(|offset| *offset > ramdisk_offset)
        .ok_or(Error::FieldOutOfBounds("ramdisk_size"))?;

    let ramdisk = data[ramdisk_offset..aboot_offset].trim_end_padding();
    if ramdisk.is_empty() {
        return Err(Error::RamdiskNotFound);
    }

    let ramdisk_addr = find_ramdisk_address(data, loki, i10e.kernel_addr)?;

    i10e.hdr_kernel_size = kernel_size as u32;
    i10e.hdr_ramdisk_size = ramdisk.len() as u32;
    i10e.ramdisk_addr = ramdisk_addr;
    i10e.kernel = kernel.to_vec();
    i10e.ramdisk = ramdisk.to_vec();
    i10e.aboot = data[aboot_offset..].to_vec();

    i10e.hdr_second_size = 0;
    i10e.second.clear();
    i10e.hdr_dt_size = 0;
    i10e.device_tree.clear();

    Ok(())
}

/// Recover the original ramdisk load address. Newer Loki versions store it
/// in the patched shellcode; older versions never saved it, so the jflte-era
/// default relative to the kernel address is used.
fn find_ramdisk_address(data: &[u8], loki: &RawLokiHeader, kernel_addr: u32) -> Result<u32> {
    if loki.ramdisk_addr.get() == 0 {
        return Ok(kernel_addr.wrapping_add(0x01ff_8000));
    }

    let offset = data
        .find(&LOKI_SHELLCODE[..SHELLCODE_PREFIX_LEN])
        .ok_or(Error::ShellcodeNotFound)?;

    read_u32_le(data, offset + SHELLCODE_RAMDISK_OFFSET).ok_or(Error::ShellcodeNotFound)
}

/// Search for a gzip deflate header, preferring a candidate with a non-zero
/// mtime field to filter out deflate-looking bytes inside the kernel image.
fn find_gzip_offset(data: &[u8], start: usize) -> Option<usize> {
    const GZIP_DEFLATE: [u8; 3] = [0x1f, 0x8b, 0x08];

    let mut fallback = None;
    let mut cur = start;

    loop {
        let Some(pos) = data.get(cur..).and_then(|hay| hay.find(GZIP_DEFLATE)) else {
            break;
        };
        let offset = cur + pos;

        match read_u32_le(data, offset + 4) {
            Some(0) => {
                if fallback.is_none() {
                    fallback = Some(offset);
                }
            }
            Some(_) => return Some(offset),
            None => break,
        }

        cur = offset + 1;
    }

    fallback
}

/// Locate the signature check function in the aboot image. Returns its load
/// address and file offset, plus whether an LG pattern matched.
fn find_aboot_target(aboot: &[u8]) -> Result<(u32, usize, bool)> {
    let aboot_base = read_u32_le(aboot, 12)
        .ok_or(Error::MissingAboot)?
        .wrapping_sub(0x28);

    let search_limit = aboot
        .len()
        .checked_sub(0x1000)
        .ok_or(Error::AbootTargetNotFound)?;

    for (patterns, lg) in [(&ABOOT_PATTERNS, false), (&ABOOT_PATTERNS_LG, true)] {
        for offset in 0..search_limit {
            let window = &aboot[offset..offset + 8];

            if patterns.iter().any(|p| window == p) {
                return Ok((aboot_base.wrapping_add(offset as u32), offset, lg));
            }
        }
    }

    Err(Error::AbootTargetNotFound)
}

fn patch_shellcode(shellcode: &mut [u8], target: u32, ramdisk_addr: u32) {
    let mut offset = 0;

    while offset + 4 <= shellcode.len() {
        let word = u32::from_le_bytes([
            shellcode[offset],
            shellcode[offset + 1],
            shellcode[offset + 2],
            shellcode[offset + 3],
        ]);

        if word == 0xffff_ffff {
            shellcode[offset..offset + 4].copy_from_slice(&target.to_le_bytes());
        } else if word == 0xeeee_eeee {
            shellcode[offset..offset + 4].copy_from_slice(&ramdisk_addr.to_le_bytes());
        }

        offset += 1;
    }
}

pub fn create_image(i10e: &Intermediate) -> Result<Vec<u8>> {
    if i10e.aboot.is_empty() {
        return Err(Error::MissingAboot);
    }

    let data = android::create_image(i10e)?;

    patch_image(&data, &i10e.aboot)
}

/// Apply the Loki transformation to a canonical Android image, as the Loki
/// tool does: relabel the kernel area to cover kernel plus ramdisk, point the
/// ramdisk at the patch target, and append a window of the original aboot
/// code with the shellcode at the 16-byte-aligned patch point, followed by
/// the device tree.
fn patch_image(orig: &[u8], aboot: &[u8]) -> Result<Vec<u8>> {
    let (target, aboot_offset, lg) = find_aboot_target(aboot)?;

    // The patch point must stay 16-byte aligned in memory, so the copied
    // window starts at the aligned-down address.
    let align_offset = (target & 0xf) as usize;

    let (raw, _) = android::RawHeader::read_from_prefix(orig)
        .map_err(|_| Error::FieldOutOfBounds("header"))?;

    let page_size = raw.page_size.get() as usize;
    let orig_kernel_size = raw.kernel_size.get();
    let orig_ramdisk_size = raw.ramdisk_size.get();
    let orig_ramdisk_addr = raw.ramdisk_addr.get();
    let dt_size = raw.dt_size.get() as usize;

    let page_kernel_size = padding::round(orig_kernel_size as usize, page_size)
        .ok_or(Error::FieldOutOfBounds("kernel_size"))?;
    let page_ramdisk_size = padding::round(orig_ramdisk_size as usize, page_size)
        .ok_or(Error::FieldOutOfBounds("ramdisk_size"))?;

    let fake_size = if lg { page_size } else { 0x200 };
    let fake_start = aboot_offset
        .checked_sub(align_offset)
        .ok_or(Error::FieldOutOfBounds("aboot"))?;
    let fake = aboot
        .get(fake_start..fake_start + fake_size)
        .ok_or(Error::FieldOutOfBounds("aboot"))?;

    let mut shellcode = LOKI_SHELLCODE;
    patch_shellcode(&mut shellcode, target, orig_ramdisk_addr);

    let mut out =
        Vec::with_capacity(page_size + page_kernel_size + page_ramdisk_size + fake_size + dt_size);

    // Header page, with the rewritten Android header and the Loki header at
    // its fixed offset.
    out.extend_from_slice(&orig[..page_size]);
    {
        let (hdr, _) = android::RawHeader::mut_from_prefix(&mut out[..])
            .map_err(|_| Error::FieldOutOfBounds("header"))?;

        let fake_ramdisk_size = if lg { page_size as u32 } else { 0 };

        hdr.kernel_size = (page_kernel_size as u32).wrapping_add(orig_ramdisk_size).into();
        hdr.ramdisk_size = fake_ramdisk_size.into();
        hdr.ramdisk_addr = target.wrapping_sub(align_offset as u32).into();
    }

    let loki = RawLokiHeader {
        magic: LOKI_MAGIC,
        recovery: little_endian::U32::ZERO,
        build: [0u8; 128],
        orig_kernel_size: orig_kernel_size.into(),
        orig_ramdisk_size: orig_ramdisk_size.into(),
        ramdisk_addr: raw
            .kernel_addr
            .get()
            .wrapping_add(page_kernel_size as u32)
            .into(),
    };
    out[LOKI_MAGIC_OFFSET..LOKI_MAGIC_OFFSET + mem::size_of::<RawLokiHeader>()]
        .copy_from_slice(loki.as_bytes());

    // Kernel and ramdisk pages, verbatim.
    out.extend_from_slice(&orig[page_size..page_size + page_kernel_size + page_ramdisk_size]);

    // Aboot window with the patched shellcode, then the raw device tree. The
    // Loki tool assumes there is no second bootloader between them.
    let patch_start = out.len() + align_offset;
    out.extend_from_slice(fake);

    if dt_size > 0 {
        let dt_offset = page_size + page_kernel_size + page_ramdisk_size;
        out.extend_from_slice(&orig[dt_offset..dt_offset + dt_size]);
    }

    out[patch_start..patch_start + shellcode.len()].copy_from_slice(&shellcode);

    Ok(out)
}
