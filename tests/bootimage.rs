/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use mbootimg::{
    bootimage::{BootImage, ErrorCode, Type},
    format::{android, bump},
};

/// SHA-1 of twelve NUL bytes: the kernel, ramdisk, and second size words
/// hashed when every payload is empty. The device tree size word only
/// contributes when a device tree is present.
const EMPTY_PAYLOAD_SHA1: [u8; 20] = [
    0x2c, 0x51, 0x3f, 0x14, 0x9e, 0x73, 0x7e, 0xc4, 0x06, 0x3f, 0xc1, 0xd3, 0x7a, 0xee, 0x9b,
    0xea, 0xbc, 0x4b, 0x4b, 0xbf,
];

fn le32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Pattern matching a vulnerable Samsung aboot build, plus enough
/// surrounding data for the patcher's base pointer and copy window.
fn fake_aboot() -> Vec<u8> {
    let mut aboot = vec![0u8; 0x2000];
    // Image base (stored at offset 12, biased by 0x28).
    aboot[12..16].copy_from_slice(&0x8800_0028u32.to_le_bytes());
    // Signature check function.
    aboot[0x100..0x108].copy_from_slice(&[0xf0, 0xb5, 0x8f, 0xb0, 0x06, 0x46, 0xf0, 0xf7]);
    aboot
}

#[test]
fn create_empty_default_image() {
    let mut image = BootImage::new();
    assert!(image.was_type().is_none());
    assert!(image.error().is_none());

    let data = image.create().unwrap();

    // One header page and nothing else.
    assert_eq!(data.len(), 2048);
    assert_eq!(&data[0..8], b"ANDROID!");
    assert_eq!(le32(&data, 8), 0); // kernel_size
    assert_eq!(le32(&data, 12), 0x1000_8000); // kernel_addr
    assert_eq!(le32(&data, 16), 0); // ramdisk_size
    assert_eq!(le32(&data, 20), 0x1100_0000); // ramdisk_addr
    assert_eq!(le32(&data, 24), 0); // second_size
    assert_eq!(le32(&data, 28), 0x10f0_0000); // second_addr
    assert_eq!(le32(&data, 32), 0x1000_0100); // tags_addr
    assert_eq!(le32(&data, 36), 2048); // page_size
    assert_eq!(le32(&data, 40), 0); // dt_size
    assert_eq!(le32(&data, 44), 0); // unused
    assert!(data[48..576].iter().all(|b| *b == 0)); // name + cmdline
    assert_eq!(&data[576..596], &EMPTY_PAYLOAD_SHA1);
    assert!(data[596..2048].iter().all(|b| *b == 0));
}

#[test]
fn android_round_trip() {
    let mut image = BootImage::new();
    image.set_kernel_image(vec![0xde, 0xad, 0xbe, 0xef]);
    image.set_ramdisk_image(vec![0x01, 0x02]);
    image.set_kernel_cmdline("console=ttyS0");

    let data = image.create().unwrap();
    assert_eq!(data.len(), 3 * 2048);
    assert_eq!(le32(&data, 8), 4);
    assert_eq!(le32(&data, 16), 2);

    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.was_type(), Some(Type::Android));
    assert_eq!(loaded.kernel_image(), &[0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(loaded.ramdisk_image(), &[0x01, 0x02]);
    assert_eq!(loaded.kernel_cmdline(), "console=ttyS0");

    // load ∘ create is a fixed point.
    let new_data = loaded.create().unwrap();
    assert_eq!(new_data, data);

    let mut reloaded = BootImage::new();
    assert!(reloaded.load(&new_data));
    assert_eq!(reloaded, loaded);
}

#[test]
fn bump_strip_and_restore() {
    let mut image = BootImage::new();
    image.set_kernel_image(b"kernel data".to_vec());
    image.set_type(Type::Bump);

    let data = image.create().unwrap();
    assert_eq!(data.len(), 2 * 2048 + 16);
    assert!(data.ends_with(&bump::BUMP_MAGIC));

    // The trailer wins over the plain Android detector.
    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.was_type(), Some(Type::Bump));
    assert_eq!(loaded.kernel_image(), b"kernel data");

    loaded.set_type(Type::Bump);
    assert_eq!(loaded.create().unwrap(), data);

    loaded.set_type(Type::Android);
    let plain = loaded.create().unwrap();
    assert!(!plain.ends_with(&bump::BUMP_MAGIC));
    assert_eq!(&data[..plain.len()], &plain[..]);

    let mut from_plain = BootImage::new();
    assert!(from_plain.load(&plain));
    assert_eq!(from_plain.was_type(), Some(Type::Android));
    assert_eq!(from_plain, loaded);
}

#[test]
fn loki_new_style_round_trip() {
    let mut image = BootImage::new();
    image.set_kernel_image(vec![0xaa; 100]);
    image.set_ramdisk_image(vec![0xbb; 50]);
    image.set_kernel_cmdline("androidboot.hardware=qcom");
    image.set_aboot_image(fake_aboot());
    image.set_type(Type::Loki);

    let data = image.create().unwrap();
    assert_eq!(&data[0x400..0x404], b"LOKI");
    assert_eq!(&data[0..8], b"ANDROID!");
    // Original sizes live in the Loki header.
    assert_eq!(le32(&data, 0x400 + 136), 100);
    assert_eq!(le32(&data, 0x400 + 140), 50);
    // The Android header now covers kernel + ramdisk with a fake ramdisk.
    assert_eq!(le32(&data, 8), 2048 + 50);
    assert_eq!(le32(&data, 16), 0);
    assert_eq!(le32(&data, 20), 0x8800_0100);

    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.was_type(), Some(Type::Loki));
    assert_eq!(loaded.kernel_image(), &[0xaa; 100][..]);
    assert_eq!(loaded.ramdisk_image(), &[0xbb; 50][..]);
    assert_eq!(loaded.kernel_cmdline(), "androidboot.hardware=qcom");
    // Recovered from the shellcode, not the patched header.
    assert_eq!(loaded.ramdisk_address(), 0x1100_0000);

    // Un-loki'ing: the re-encoded Android image must stand on its own.
    loaded.set_type(Type::Android);
    let plain = loaded.create().unwrap();
    assert!(android::is_valid(&plain));

    let mut from_plain = BootImage::new();
    assert!(from_plain.load(&plain));
    assert_eq!(from_plain.was_type(), Some(Type::Android));
    assert_eq!(from_plain, loaded);

    // With the patch material restored, the Loki round-trip is exact too.
    loaded.set_aboot_image(fake_aboot());
    loaded.set_type(Type::Loki);
    assert_eq!(loaded.create().unwrap(), data);
}

#[test]
fn loki_old_style_content_scan() {
    let kernel = {
        let mut kernel = vec![0xaa; 256];
        // zImage header stores the image size at 0x2c.
        kernel[0x2c..0x30].copy_from_slice(&256u32.to_le_bytes());
        kernel
    };

    let mut image = BootImage::new();
    image.set_kernel_image(kernel.clone());
    image.set_kernel_address(0x8020_8000);
    let android_data = image.create().unwrap();
    assert_eq!(android_data.len(), 2 * 2048);

    // Old Loki zeroes the size fields and leaves everything else stale.
    let mut data = android_data;
    data[8..12].copy_from_slice(&[0u8; 4]);
    data[16..20].copy_from_slice(&[0u8; 4]);
    data[0x400..0x404].copy_from_slice(b"LOKI");

    // Gzip'd ramdisk on the next page boundary, zero padded up to the aboot
    // copy in the last 0x200 bytes.
    let mut ramdisk = vec![0xbb; 200];
    ramdisk[0..3].copy_from_slice(&[0x1f, 0x8b, 0x08]);
    ramdisk[3] = 0;
    ramdisk[4..8].copy_from_slice(&0x5566_7788u32.to_le_bytes());

    data.extend_from_slice(&ramdisk);
    data.resize(8192 - 0x200, 0);
    data.extend_from_slice(&[0xcc; 0x200]);

    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.was_type(), Some(Type::Loki));
    assert_eq!(loaded.kernel_image(), &kernel[..]);
    assert_eq!(loaded.ramdisk_image(), &ramdisk[..]);
    assert_eq!(loaded.aboot_image(), &[0xcc; 0x200][..]);
    assert_eq!(loaded.ramdisk_address(), 0x8020_8000 + 0x01ff_8000);
    // Old Loki clobbers the tags address; the default takes its place.
    assert_eq!(loaded.kernel_tags_address(), 0x1000_0100);
    // The identity is whatever the original image carried.
    assert_eq!(loaded.id()[0], le32(&data, 576));
}

#[test]
fn sony_elf_round_trip() {
    let mut image = BootImage::new();
    image.set_kernel_image(b"sony kernel".to_vec());
    image.set_ramdisk_image(b"sony ramdisk".to_vec());
    image.set_ipl_image(b"ipl data".to_vec());
    image.set_kernel_address(0x0020_8000);
    image.set_ramdisk_address(0x0200_0000);
    image.set_ipl_address(0x0010_0000);
    image.set_entrypoint_address(0x0020_8000);
    image.set_type(Type::SonyElf);

    let data = image.create().unwrap();
    assert_eq!(&data[0..4], b"\x7fELF");
    assert_eq!(le32(&data, 24), 0x0020_8000); // e_entry
    assert_eq!(u16::from_le_bytes(data[44..46].try_into().unwrap()), 3);

    // Program headers in canonical order: kernel, ramdisk, ipl.
    assert_eq!(le32(&data, 52 + 24), 0x0000_0000);
    assert_eq!(le32(&data, 84 + 24), 0x8000_0000);
    assert_eq!(le32(&data, 116 + 24), 0x4000_0000);
    // Payloads packed back to back after the headers.
    assert_eq!(le32(&data, 52 + 4), 52 + 3 * 32);
    assert_eq!(&data[148..159], b"sony kernel");

    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.was_type(), Some(Type::SonyElf));
    assert_eq!(loaded.kernel_image(), b"sony kernel");
    assert_eq!(loaded.ramdisk_image(), b"sony ramdisk");
    assert_eq!(loaded.ipl_image(), b"ipl data");
    assert_eq!(loaded.kernel_address(), 0x0020_8000);
    assert_eq!(loaded.ramdisk_address(), 0x0200_0000);
    assert_eq!(loaded.ipl_address(), 0x0010_0000);
    assert_eq!(loaded.entrypoint_address(), 0x0020_8000);
    assert_eq!(loaded, image);

    loaded.set_type(Type::SonyElf);
    assert_eq!(loaded.create().unwrap(), data);
}

#[test]
fn sony_elf_sin_segment() {
    let mut image = BootImage::new();
    image.set_kernel_image(b"kernel".to_vec());
    image.set_sin_image(vec![0x5a; 64]);
    image.set_type(Type::SonyElf);

    let data = image.create().unwrap();
    assert_eq!(u16::from_le_bytes(data[44..46].try_into().unwrap()), 2);

    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.sin_image(), &[0x5a; 64][..]);
    assert_eq!(loaded.sin_header().len(), 32);

    loaded.set_type(Type::SonyElf);
    assert_eq!(loaded.create().unwrap(), data);
}

#[test]
fn board_name_truncated_on_create_only() {
    let mut image = BootImage::new();
    image.set_board_name("ABCDEFGHIJKLMNOPQRST");

    let data = image.create().unwrap();
    assert_eq!(&data[48..64], b"ABCDEFGHIJKLMNO\0");
    // The untruncated value stays accessible.
    assert_eq!(image.board_name(), "ABCDEFGHIJKLMNOPQRST");

    let long_cmdline = "x".repeat(600);
    image.set_kernel_cmdline(long_cmdline.clone());

    let data = image.create().unwrap();
    assert_eq!(&data[64..575], long_cmdline[..511].as_bytes());
    assert_eq!(data[575], 0);
    assert_eq!(image.kernel_cmdline(), long_cmdline);
}

#[test]
fn payload_setters_update_size_fields() {
    let mut image = BootImage::new();
    image.set_kernel_image(vec![1, 2, 3, 4]);
    image.set_ramdisk_image(vec![5]);
    image.set_second_bootloader_image(vec![6, 7]);
    image.set_device_tree_image(vec![8, 9, 10]);

    let data = image.create().unwrap();
    assert_eq!(le32(&data, 8), 4);
    assert_eq!(le32(&data, 16), 1);
    assert_eq!(le32(&data, 24), 2);
    assert_eq!(le32(&data, 40), 3);

    image.set_kernel_image(vec![]);
    let data = image.create().unwrap();
    assert_eq!(le32(&data, 8), 0);
}

#[test]
fn equality_ignores_conversion_state_and_unused() {
    let mut image = BootImage::new();
    image.set_kernel_image(b"kernel".to_vec());
    let data = image.create().unwrap();

    // Same image with a different value in the unused header word.
    let mut patched = data.clone();
    patched[44..48].copy_from_slice(&0xcafe_babeu32.to_le_bytes());

    let mut a = BootImage::new();
    let mut b = BootImage::new();
    assert!(a.load(&data));
    assert!(b.load(&patched));
    assert_eq!(a, b);

    // The unused word itself round-trips.
    let reout = b.create().unwrap();
    assert_eq!(le32(&reout, 44), 0xcafe_babe);

    // Differing content compares unequal.
    b.set_kernel_image(b"other".to_vec());
    assert_ne!(a, b);
}

#[test]
fn id_upper_words_preserved_on_load_zeroed_on_create() {
    let mut image = BootImage::new();
    image.set_kernel_image(b"kernel".to_vec());
    let mut data = image.create().unwrap();
    assert!(data[596..608].iter().all(|b| *b == 0));

    data[596..600].copy_from_slice(&0x1122_3344u32.to_le_bytes());

    let mut loaded = BootImage::new();
    assert!(loaded.load(&data));
    assert_eq!(loaded.id()[5], 0x1122_3344);

    let reout = loaded.create().unwrap();
    assert_eq!(le32(&reout, 596), 0);
}

#[test]
fn accessor_defaults_and_resets() {
    let mut image = BootImage::new();
    assert_eq!(image.page_size(), 2048);
    assert_eq!(image.kernel_address(), 0x1000_8000);
    assert_eq!(image.ramdisk_address(), 0x1100_0000);
    assert_eq!(image.second_bootloader_address(), 0x10f0_0000);
    assert_eq!(image.kernel_tags_address(), 0x1000_0100);
    assert_eq!(image.ipl_address(), 0);
    assert_eq!(image.rpm_address(), 0);
    assert_eq!(image.appsbl_address(), 0);
    assert_eq!(image.entrypoint_address(), 0);
    assert_eq!(image.board_name(), "");
    assert_eq!(image.kernel_cmdline(), "");

    image.set_page_size(4096);
    image.set_kernel_address(0x4000_0000);
    image.set_board_name("herolte");
    image.reset_page_size();
    image.reset_kernel_address();
    image.reset_board_name();
    assert_eq!(image.page_size(), 2048);
    assert_eq!(image.kernel_address(), 0x1000_8000);
    assert_eq!(image.board_name(), "");

    image.set_addresses(0x8000_0000, 0x8000, 0x0100_0000, 0x00f0_0000, 0x100);
    assert_eq!(image.kernel_address(), 0x8000_8000);
    assert_eq!(image.ramdisk_address(), 0x8100_0000);
    assert_eq!(image.second_bootloader_address(), 0x80f0_0000);
    assert_eq!(image.kernel_tags_address(), 0x8000_0100);

    // Offsets wrap around 32 bits.
    image.set_addresses(0xffff_ff00, 0x200, 0, 0, 0);
    assert_eq!(image.kernel_address(), 0x100);
}

#[test]
fn load_failures_report_parse_error() {
    let mut image = BootImage::new();
    assert!(!image.load(b"definitely not a boot image"));
    assert_eq!(
        image.error().map(|e| e.code()),
        Some(ErrorCode::BootImageParseError),
    );
    assert!(image.was_type().is_none());

    // A Loki target without patch material cannot be created.
    let mut image = BootImage::new();
    image.set_kernel_image(b"kernel".to_vec());
    image.set_type(Type::Loki);
    assert!(image.create().is_none());
    assert_eq!(
        image.error().map(|e| e.code()),
        Some(ErrorCode::BootImageParseError),
    );
}

#[test]
fn file_round_trip() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("boot.img");

    let mut image = BootImage::new();
    image.set_kernel_image(b"kernel".to_vec());
    assert!(image.create_file(&path));

    let mut loaded = BootImage::new();
    assert!(loaded.load_file(&path));
    assert_eq!(loaded.was_type(), Some(Type::Android));
    assert_eq!(loaded.kernel_image(), b"kernel");

    let mut missing = BootImage::new();
    assert!(!missing.load_file(temp_dir.path().join("missing.img")));
    let error = missing.error().unwrap();
    assert_eq!(error.code(), ErrorCode::FileOpenError);
    assert!(error.path().is_some());
}
