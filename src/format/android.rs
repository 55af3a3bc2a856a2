// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{Cursor, Write},
    mem, str,
};

use bstr::ByteSlice;
use ring::digest::{self, Context};
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    bootimage::Intermediate,
    format::{
        padding::{self, ZeroPadding},
        Error, Result,
    },
    stream::{CountingReader, CountingWriter, ReadDiscardExt, ReadFixedSizeExt},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

/// Maximum offset at which the header may start. Some OEM images prepend
/// vendor data before the real header, so the magic is searched for instead
/// of being required at offset zero.
pub const MAX_HEADER_OFFSET: usize = 512;

/// Page sizes that appear in the wild. Anything else is rejected.
const PAGE_SIZES: [u32; 7] = [2048, 4096, 8192, 16384, 32768, 65536, 131072];

/// Raw on-disk layout of the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RawHeader {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    pub(crate) magic: [u8; 8],
    pub(crate) kernel_size: little_endian::U32,
    pub(crate) kernel_addr: little_endian::U32,
    pub(crate) ramdisk_size: little_endian::U32,
    pub(crate) ramdisk_addr: little_endian::U32,
    pub(crate) second_size: little_endian::U32,
    pub(crate) second_addr: little_endian::U32,
    pub(crate) tags_addr: little_endian::U32,
    pub(crate) page_size: little_endian::U32,
    pub(crate) dt_size: little_endian::U32,
    pub(crate) unused: little_endian::U32,
    pub(crate) name: [u8; BOOT_NAME_SIZE],
    pub(crate) cmdline: [u8; BOOT_ARGS_SIZE],
    pub(crate) id: [little_endian::U32; 8],
}

/// Find the header origin within the first `search_range` bytes. The input
/// must be large enough to hold the search window plus one header.
pub(crate) fn find_header(data: &[u8], search_range: usize) -> Option<usize> {
    if data.len() < search_range + mem::size_of::<RawHeader>() {
        return None;
    }

    data[..search_range + BOOT_MAGIC.len()].find(BOOT_MAGIC)
}

pub fn is_valid(data: &[u8]) -> bool {
    find_header(data, MAX_HEADER_OFFSET).is_some()
}

/// Parse the raw header at `offset` into the intermediate representation.
/// Size fields are copied as-is; callers that read payloads are responsible
/// for bounds checking them first.
pub(crate) fn load_header(i10e: &mut Intermediate, data: &[u8], offset: usize) -> Result<()> {
    let (raw, _) = RawHeader::read_from_prefix(&data[offset..])
        .map_err(|_| Error::FieldOutOfBounds("header"))?;

    let page_size = raw.page_size.get();
    if !PAGE_SIZES.contains(&page_size) {
        return Err(Error::InvalidFieldValue("page_size", page_size));
    }

    let name = raw.name.trim_end_padding();
    let name = str::from_utf8(name).map_err(|e| Error::StringNotUtf8("name", name.to_vec(), e))?;

    let cmdline = raw.cmdline.trim_end_padding();
    let cmdline = str::from_utf8(cmdline)
        .map_err(|e| Error::StringNotUtf8("cmdline", cmdline.to_vec(), e))?;

    i10e.hdr_kernel_size = raw.kernel_size.get();
    i10e.kernel_addr = raw.kernel_addr.get();
    i10e.hdr_ramdisk_size = raw.ramdisk_size.get();
    i10e.ramdisk_addr = raw.ramdisk_addr.get();
    i10e.hdr_second_size = raw.second_size.get();
    i10e.second_addr = raw.second_addr.get();
    i10e.tags_addr = raw.tags_addr.get();
    i10e.page_size = page_size;
    i10e.hdr_dt_size = raw.dt_size.get();
    i10e.hdr_unused = raw.unused.get();
    i10e.board_name = name.to_owned();
    i10e.cmdline = cmdline.to_owned();
    i10e.hdr_id = raw.id.map(|id| id.get());

    Ok(())
}

pub fn load_image(i10e: &mut Intermediate, data: &[u8]) -> Result<()> {
    let offset = find_header(data, MAX_HEADER_OFFSET).ok_or(Error::MagicNotFound("ANDROID!"))?;

    load_header(i10e, data, offset)?;

    // Checked before allocating the payload buffers.
    for (field, size) in [
        ("kernel_size", i10e.hdr_kernel_size),
        ("ramdisk_size", i10e.hdr_ramdisk_size),
        ("second_size", i10e.hdr_second_size),
        ("dt_size", i10e.hdr_dt_size),
    ] {
        if size as usize > data.len() {
            return Err(Error::FieldOutOfBounds(field));
        }
    }

    // All payload offsets are relative to the header origin, one payload per
    // page-aligned slot.
    let mut reader = CountingReader::new(Cursor::new(&data[offset..]));
    reader.read_discard_exact(mem::size_of::<RawHeader>() as u64)?;
    padding::read_discard(&mut reader, i10e.page_size.into())?;

    i10e.kernel = reader
        .read_vec_exact(i10e.hdr_kernel_size as usize)
        .map_err(|e| Error::ReadFieldError("kernel", e))?;
    padding::read_discard(&mut reader, i10e.page_size.into())?;

    i10e.ramdisk = reader
        .read_vec_exact(i10e.hdr_ramdisk_size as usize)
        .map_err(|e| Error::ReadFieldError("ramdisk", e))?;
    padding::read_discard(&mut reader, i10e.page_size.into())?;

    i10e.second = reader
        .read_vec_exact(i10e.hdr_second_size as usize)
        .map_err(|e| Error::ReadFieldError("second", e))?;
    padding::read_discard(&mut reader, i10e.page_size.into())?;

    i10e.device_tree = reader
        .read_vec_exact(i10e.hdr_dt_size as usize)
        .map_err(|e| Error::ReadFieldError("device_tree", e))?;

    Ok(())
}

/// Compute the identity field the way mkbootimg does: each image followed by
/// its size as a little-endian word, with the device tree only contributing
/// when present. The digest fills the first five words; the rest stay zero.
fn compute_id(i10e: &Intermediate) -> [little_endian::U32; 8] {
    let mut context = Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);

    context.update(&i10e.kernel);
    context.update(&(i10e.kernel.len() as u32).to_le_bytes());
    context.update(&i10e.ramdisk);
    context.update(&(i10e.ramdisk.len() as u32).to_le_bytes());
    context.update(&i10e.second);
    context.update(&(i10e.second.len() as u32).to_le_bytes());

    if !i10e.device_tree.is_empty() {
        context.update(&i10e.device_tree);
        context.update(&(i10e.device_tree.len() as u32).to_le_bytes());
    }

    let digest = context.finish();

    let mut id = [little_endian::U32::ZERO; 8];
    for (word, chunk) in id.iter_mut().zip(digest.as_ref().chunks_exact(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]).into();
    }

    id
}

pub fn create_image(i10e: &Intermediate) -> Result<Vec<u8>> {
    if i10e.page_size == 0 {
        return Err(Error::InvalidFieldValue("page_size", 0));
    }

    let raw = RawHeader {
        magic: BOOT_MAGIC,
        kernel_size: (i10e.kernel.len() as u32).into(),
        kernel_addr: i10e.kernel_addr.into(),
        ramdisk_size: (i10e.ramdisk.len() as u32).into(),
        ramdisk_addr: i10e.ramdisk_addr.into(),
        second_size: (i10e.second.len() as u32).into(),
        second_addr: i10e.second_addr.into(),
        tags_addr: i10e.tags_addr.into(),
        page_size: i10e.page_size.into(),
        dt_size: (i10e.device_tree.len() as u32).into(),
        unused: i10e.hdr_unused.into(),
        // Strings are silently truncated, not rejected.
        name: i10e.board_name.as_bytes().to_truncated_array(),
        cmdline: i10e.cmdline.as_bytes().to_truncated_array(),
        id: compute_id(i10e),
    };

    let mut writer = CountingWriter::new(Cursor::new(Vec::new()));

    raw.write_to_io(&mut writer)?;
    padding::write_zeros(&mut writer, i10e.page_size.into())?;

    writer
        .write_all(&i10e.kernel)
        .map_err(|e| Error::WriteFieldError("kernel", e))?;
    padding::write_zeros(&mut writer, i10e.page_size.into())?;

    writer
        .write_all(&i10e.ramdisk)
        .map_err(|e| Error::WriteFieldError("ramdisk", e))?;
    padding::write_zeros(&mut writer, i10e.page_size.into())?;

    writer
        .write_all(&i10e.second)
        .map_err(|e| Error::WriteFieldError("second", e))?;
    padding::write_zeros(&mut writer, i10e.page_size.into())?;

    writer
        .write_all(&i10e.device_tree)
        .map_err(|e| Error::WriteFieldError("device_tree", e))?;
    padding::write_zeros(&mut writer, i10e.page_size.into())?;

    let (cursor, _) = writer.finish();

    Ok(cursor.into_inner())
}
