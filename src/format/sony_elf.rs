// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::mem;

use tracing::warn;
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    bootimage::Intermediate,
    format::{Error, Result},
};

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const ELF_CLASS_32: u8 = 1;
const ELF_DATA_LSB: u8 = 1;
const ELF_VERSION_CURRENT: u8 = 1;
const ELF_TYPE_EXEC: u16 = 2;
const ELF_MACHINE_ARM: u16 = 40;

const PT_LOAD: u32 = 1;

// Sony's segment tagging convention: loadable payloads are told apart by a
// marker in p_flags; the SIN segment has its own vendor p_type.
const SONY_E_TYPE_SIN: u32 = 0x8000_0000;
const SONY_E_FLAGS_KERNEL: u32 = 0x0000_0000;
const SONY_E_FLAGS_RAMDISK: u32 = 0x8000_0000;
const SONY_E_FLAGS_IPL: u32 = 0x4000_0000;
const SONY_E_FLAGS_RPM: u32 = 0x0100_0000;
const SONY_E_FLAGS_APPSBL: u32 = 0x0200_0000;

/// Raw on-disk layout of the ELF32 file header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawElfHeader {
    /// Magic value. This should be equal to [`ELF_MAGIC`].
    magic: [u8; 4],
    class: u8,
    data: u8,
    version: u8,
    os_abi: u8,
    abi_version: u8,
    pad: [u8; 7],
    e_type: little_endian::U16,
    e_machine: little_endian::U16,
    e_version: little_endian::U32,
    e_entry: little_endian::U32,
    e_phoff: little_endian::U32,
    e_shoff: little_endian::U32,
    e_flags: little_endian::U32,
    e_ehsize: little_endian::U16,
    e_phentsize: little_endian::U16,
    e_phnum: little_endian::U16,
    e_shentsize: little_endian::U16,
    e_shnum: little_endian::U16,
    e_shstrndx: little_endian::U16,
}

/// Raw on-disk layout of an ELF32 program header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawProgramHeader {
    p_type: little_endian::U32,
    p_offset: little_endian::U32,
    p_vaddr: little_endian::U32,
    p_paddr: little_endian::U32,
    p_filesz: little_endian::U32,
    p_memsz: little_endian::U32,
    p_flags: little_endian::U32,
    p_align: little_endian::U32,
}

pub fn is_valid(data: &[u8]) -> bool {
    let Ok((raw, _)) = RawElfHeader::read_from_prefix(data) else {
        return false;
    };

    raw.magic == ELF_MAGIC
        && raw.class == ELF_CLASS_32
        && raw.data == ELF_DATA_LSB
        && raw.e_type.get() == ELF_TYPE_EXEC
}

pub fn load_image(i10e: &mut Intermediate, data: &[u8]) -> Result<()> {
    if !is_valid(data) {
        return Err(Error::MagicNotFound("ELF"));
    }

    let (raw, _) = RawElfHeader::read_from_prefix(data)
        .map_err(|_| Error::FieldOutOfBounds("elf_header"))?;

    let phentsize = raw.e_phentsize.get() as usize;
    if phentsize != mem::size_of::<RawProgramHeader>() {
        return Err(Error::InvalidFieldValue("e_phentsize", phentsize as u32));
    }

    i10e.entrypoint = raw.e_entry.get();

    let phoff = raw.e_phoff.get() as usize;

    for index in 0..raw.e_phnum.get() as usize {
        let offset = phoff
            .checked_add(index * phentsize)
            .ok_or(Error::FieldOutOfBounds("e_phoff"))?;
        let phdr_bytes = data
            .get(offset..offset + phentsize)
            .ok_or(Error::FieldOutOfBounds("program_headers"))?;
        let (phdr, _) = RawProgramHeader::read_from_prefix(phdr_bytes)
            .map_err(|_| Error::FieldOutOfBounds("program_headers"))?;

        let seg_offset = phdr.p_offset.get() as usize;
        let seg_size = phdr.p_filesz.get() as usize;
        let segment = data
            .get(seg_offset..seg_offset + seg_size)
            .ok_or(Error::FieldOutOfBounds("p_filesz"))?;

        if phdr.p_type.get() == SONY_E_TYPE_SIN {
            // The SIN program header contains vendor fields, so it is kept
            // verbatim alongside the segment itself.
            i10e.sony_sin = segment.to_vec();
            i10e.sony_sin_hdr = phdr_bytes.to_vec();
            continue;
        }

        match phdr.p_flags.get() {
            SONY_E_FLAGS_KERNEL => {
                i10e.hdr_kernel_size = phdr.p_filesz.get();
                i10e.kernel_addr = phdr.p_vaddr.get();
                i10e.kernel = segment.to_vec();
            }
            SONY_E_FLAGS_RAMDISK => {
                i10e.hdr_ramdisk_size = phdr.p_filesz.get();
                i10e.ramdisk_addr = phdr.p_vaddr.get();
                i10e.ramdisk = segment.to_vec();
            }
            SONY_E_FLAGS_IPL => {
                i10e.ipl_addr = phdr.p_vaddr.get();
                i10e.ipl = segment.to_vec();
            }
            SONY_E_FLAGS_RPM => {
                i10e.rpm_addr = phdr.p_vaddr.get();
                i10e.rpm = segment.to_vec();
            }
            SONY_E_FLAGS_APPSBL => {
                i10e.appsbl_addr = phdr.p_vaddr.get();
                i10e.appsbl = segment.to_vec();
            }
            flags => warn!("Skipping segment {index} with unknown flags: {flags:#010x}"),
        }
    }

    Ok(())
}

pub fn create_image(i10e: &Intermediate) -> Result<Vec<u8>> {
    // Canonical segment order. Empty payloads contribute no program header.
    let payloads: [(&[u8], u32, u32); 5] = [
        (&i10e.kernel, i10e.kernel_addr, SONY_E_FLAGS_KERNEL),
        (&i10e.ramdisk, i10e.ramdisk_addr, SONY_E_FLAGS_RAMDISK),
        (&i10e.ipl, i10e.ipl_addr, SONY_E_FLAGS_IPL),
        (&i10e.rpm, i10e.rpm_addr, SONY_E_FLAGS_RPM),
        (&i10e.appsbl, i10e.appsbl_addr, SONY_E_FLAGS_APPSBL),
    ];

    let present: Vec<_> = payloads.iter().filter(|(data, ..)| !data.is_empty()).collect();
    let has_sin = !i10e.sony_sin.is_empty();
    let phnum = present.len() + usize::from(has_sin);

    let raw = RawElfHeader {
        magic: ELF_MAGIC,
        class: ELF_CLASS_32,
        data: ELF_DATA_LSB,
        version: ELF_VERSION_CURRENT,
        os_abi: 0,
        abi_version: 0,
        pad: [0u8; 7],
        e_type: ELF_TYPE_EXEC.into(),
        e_machine: ELF_MACHINE_ARM.into(),
        e_version: u32::from(ELF_VERSION_CURRENT).into(),
        e_entry: i10e.entrypoint.into(),
        e_phoff: (mem::size_of::<RawElfHeader>() as u32).into(),
        e_shoff: little_endian::U32::ZERO,
        e_flags: little_endian::U32::ZERO,
        e_ehsize: (mem::size_of::<RawElfHeader>() as u16).into(),
        e_phentsize: (mem::size_of::<RawProgramHeader>() as u16).into(),
        e_phnum: (phnum as u16).into(),
        e_shentsize: little_endian::U16::ZERO,
        e_shnum: little_endian::U16::ZERO,
        e_shstrndx: little_endian::U16::ZERO,
    };

    let mut out = Vec::new();
    out.extend_from_slice(raw.as_bytes());

    // Payload bytes are packed back to back after the header table.
    let mut seg_offset =
        mem::size_of::<RawElfHeader>() + phnum * mem::size_of::<RawProgramHeader>();

    for (data, vaddr, flags) in &present {
        let phdr = RawProgramHeader {
            p_type: PT_LOAD.into(),
            p_offset: (seg_offset as u32).into(),
            p_vaddr: (*vaddr).into(),
            p_paddr: (*vaddr).into(),
            p_filesz: (data.len() as u32).into(),
            p_memsz: (data.len() as u32).into(),
            p_flags: (*flags).into(),
            p_align: little_endian::U32::ZERO,
        };

        out.extend_from_slice(phdr.as_bytes());
        seg_offset += data.len();
    }

    if has_sin {
        // Reuse the preserved header's vendor fields when there is one,
        // recomputing only the offset and sizes.
        let mut phdr = match RawProgramHeader::read_from_bytes(&i10e.sony_sin_hdr) {
            Ok(phdr) => phdr,
            Err(_) => RawProgramHeader {
                p_type: SONY_E_TYPE_SIN.into(),
                p_offset: little_endian::U32::ZERO,
                p_vaddr: little_endian::U32::ZERO,
                p_paddr: little_endian::U32::ZERO,
                p_filesz: little_endian::U32::ZERO,
                p_memsz: little_endian::U32::ZERO,
                p_flags: little_endian::U32::ZERO,
                p_align: little_endian::U32::ZERO,
            },
        };

        phdr.p_offset = (seg_offset as u32).into();
        phdr.p_filesz = (i10e.sony_sin.len() as u32).into();
        phdr.p_memsz = (i10e.sony_sin.len() as u32).into();

        out.extend_from_slice(phdr.as_bytes());
    }

    for (data, ..) in &present {
        out.extend_from_slice(data);
    }

    if has_sin {
        out.extend_from_slice(&i10e.sony_sin);
    }

    Ok(out)
}
