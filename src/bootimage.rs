// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    format::{self, android, bump, loki, sony_elf},
    util::NumBytes,
};

pub const DEFAULT_PAGE_SIZE: u32 = 2048;
pub const DEFAULT_BASE: u32 = 0x1000_0000;
pub const DEFAULT_KERNEL_OFFSET: u32 = 0x0000_8000;
pub const DEFAULT_RAMDISK_OFFSET: u32 = 0x0100_0000;
pub const DEFAULT_SECOND_OFFSET: u32 = 0x00f0_0000;
pub const DEFAULT_TAGS_OFFSET: u32 = 0x0000_0100;

/// Boot image container formats.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
pub enum Type {
    Android,
    Loki,
    Bump,
    SonyElf,
}

/// Coarse error codes exposed to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    BootImageParseError,
    FileOpenError,
    FileReadError,
    FileWriteError,
}

/// The last error recorded by a [`BootImage`] operation.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Failed to parse boot image")]
    Parse(#[source] format::Error),
    #[error("{path:?}: Failed to open file")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path:?}: Failed to read file")]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path:?}: Failed to write file")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ImageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::BootImageParseError,
            Self::FileOpen { .. } => ErrorCode::FileOpenError,
            Self::FileRead { .. } => ErrorCode::FileReadError,
            Self::FileWrite { .. } => ErrorCode::FileWriteError,
        }
    }

    /// Path of the offending file for the I/O error codes.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Parse(_) => None,
            Self::FileOpen { path, .. }
            | Self::FileRead { path, .. }
            | Self::FileWrite { path, .. } => Some(path),
        }
    }
}

/// Neutral in-memory representation shared by every codec. Fields a given
/// format does not use are left at their defaults or previously loaded
/// values and round-trip through untouched.
#[derive(Clone, Serialize)]
pub(crate) struct Intermediate {
    pub(crate) board_name: String,
    pub(crate) cmdline: String,
    pub(crate) page_size: u32,
    pub(crate) kernel_addr: u32,
    pub(crate) ramdisk_addr: u32,
    pub(crate) second_addr: u32,
    pub(crate) tags_addr: u32,
    pub(crate) ipl_addr: u32,
    pub(crate) rpm_addr: u32,
    pub(crate) appsbl_addr: u32,
    pub(crate) entrypoint: u32,
    pub(crate) hdr_kernel_size: u32,
    pub(crate) hdr_ramdisk_size: u32,
    pub(crate) hdr_second_size: u32,
    pub(crate) hdr_dt_size: u32,
    pub(crate) hdr_unused: u32,
    pub(crate) hdr_id: [u32; 8],
    #[serde(skip)]
    pub(crate) kernel: Vec<u8>,
    #[serde(skip)]
    pub(crate) ramdisk: Vec<u8>,
    #[serde(skip)]
    pub(crate) second: Vec<u8>,
    #[serde(skip)]
    pub(crate) device_tree: Vec<u8>,
    #[serde(skip)]
    pub(crate) aboot: Vec<u8>,
    #[serde(skip)]
    pub(crate) ipl: Vec<u8>,
    #[serde(skip)]
    pub(crate) rpm: Vec<u8>,
    #[serde(skip)]
    pub(crate) appsbl: Vec<u8>,
    #[serde(skip)]
    pub(crate) sony_sin: Vec<u8>,
    #[serde(skip)]
    pub(crate) sony_sin_hdr: Vec<u8>,
}

impl Default for Intermediate {
    fn default() -> Self {
        Self {
            board_name: String::new(),
            cmdline: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            kernel_addr: DEFAULT_BASE + DEFAULT_KERNEL_OFFSET,
            ramdisk_addr: DEFAULT_BASE + DEFAULT_RAMDISK_OFFSET,
            second_addr: DEFAULT_BASE + DEFAULT_SECOND_OFFSET,
            tags_addr: DEFAULT_BASE + DEFAULT_TAGS_OFFSET,
            ipl_addr: 0,
            rpm_addr: 0,
            appsbl_addr: 0,
            entrypoint: 0,
            hdr_kernel_size: 0,
            hdr_ramdisk_size: 0,
            hdr_second_size: 0,
            hdr_dt_size: 0,
            hdr_unused: 0,
            hdr_id: [0u32; 8],
            kernel: vec![],
            ramdisk: vec![],
            second: vec![],
            device_tree: vec![],
            aboot: vec![],
            ipl: vec![],
            rpm: vec![],
            appsbl: vec![],
            sony_sin: vec![],
            sony_sin_hdr: vec![],
        }
    }
}

impl fmt::Debug for Intermediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intermediate")
            .field("board_name", &self.board_name)
            .field("cmdline", &self.cmdline)
            .field("page_size", &self.page_size)
            .field("kernel_addr", &self.kernel_addr)
            .field("ramdisk_addr", &self.ramdisk_addr)
            .field("second_addr", &self.second_addr)
            .field("tags_addr", &self.tags_addr)
            .field("ipl_addr", &self.ipl_addr)
            .field("rpm_addr", &self.rpm_addr)
            .field("appsbl_addr", &self.appsbl_addr)
            .field("entrypoint", &self.entrypoint)
            .field("hdr_unused", &self.hdr_unused)
            .field("hdr_id", &self.hdr_id)
            .field("kernel", &NumBytes(self.kernel.len()))
            .field("ramdisk", &NumBytes(self.ramdisk.len()))
            .field("second", &NumBytes(self.second.len()))
            .field("device_tree", &NumBytes(self.device_tree.len()))
            .field("aboot", &NumBytes(self.aboot.len()))
            .field("ipl", &NumBytes(self.ipl.len()))
            .field("rpm", &NumBytes(self.rpm.len()))
            .field("appsbl", &NumBytes(self.appsbl.len()))
            .field("sony_sin", &NumBytes(self.sony_sin.len()))
            .field("sony_sin_hdr", &NumBytes(self.sony_sin_hdr.len()))
            .finish()
    }
}

/// Handles the creation and manipulation of Android-family boot images.
///
/// | Format           | Load | Create |
/// |------------------|------|--------|
/// | Android          | Yes  | Yes    |
/// | Loki (old-style) | Yes  | No [1] |
/// | Loki (new-style) | Yes  | Yes    |
/// | Bump             | Yes  | Yes    |
/// | Sony ELF32       | Yes  | Yes    |
///
/// [1] Images loaded from an old-style Loki file are created as new-style.
///
/// Setting a payload automatically updates the matching size field, and the
/// SHA-1 identity is recomputed whenever an Android-layout image is created.
///
/// A single instance must not be mutated from multiple threads, but distinct
/// instances are fully independent.
#[derive(Debug, Default)]
pub struct BootImage {
    i10e: Intermediate,
    target_type: Type,
    source_type: Option<Type>,
    error: Option<ImageError>,
}

impl Default for Type {
    fn default() -> Self {
        Self::Android
    }
}

impl BootImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the last error.
    ///
    /// The result is only meaningful after an operation has returned failure.
    pub fn error(&self) -> Option<&ImageError> {
        self.error.as_ref()
    }

    /// Load a boot image from binary data. Detectors are probed in a fixed
    /// order: Loki and Bump images contain a valid Android header, so both
    /// must be checked before the plain Android codec.
    ///
    /// If loading fails, the instance may contain partially loaded data and
    /// should not be reused for another load.
    pub fn load(&mut self, data: &[u8]) -> bool {
        let (ty, result) = if loki::is_valid(data) {
            debug!("Boot image is a loki'd Android boot image");
            (Type::Loki, loki::load_image(&mut self.i10e, data))
        } else if bump::is_valid(data) {
            debug!("Boot image is a bump'd Android boot image");
            (Type::Bump, bump::load_image(&mut self.i10e, data))
        } else if android::is_valid(data) {
            debug!("Boot image is a plain Android boot image");
            (Type::Android, android::load_image(&mut self.i10e, data))
        } else if sony_elf::is_valid(data) {
            debug!("Boot image is a Sony ELF32 boot image");
            (Type::SonyElf, sony_elf::load_image(&mut self.i10e, data))
        } else {
            debug!("Unknown boot image type");
            (Type::Android, Err(format::Error::UnknownFormat))
        };

        match result {
            Ok(()) => {
                self.source_type = Some(ty);
                true
            }
            Err(e) => {
                warn!("Failed to load boot image: {e}");
                self.error = Some(ImageError::Parse(e));
                false
            }
        }
    }

    /// Read a boot image file and load it with [`Self::load`].
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                self.error = Some(ImageError::FileOpen {
                    path: path.to_owned(),
                    source: e,
                });
                return false;
            }
        };

        let mut data = Vec::new();
        if let Err(e) = file.read_to_end(&mut data) {
            self.error = Some(ImageError::FileRead {
                path: path.to_owned(),
                source: e,
            });
            return false;
        }

        self.load(&data)
    }

    /// Construct the boot image binary data in the target format. This is
    /// equivalent to AOSP's mkbootimg tool for the Android format.
    pub fn create(&mut self) -> Option<Vec<u8>> {
        let result = match self.target_type {
            Type::Android => {
                debug!("Creating Android boot image");
                android::create_image(&self.i10e)
            }
            Type::Bump => {
                debug!("Creating bump'd Android boot image");
                bump::create_image(&self.i10e)
            }
            Type::Loki => {
                debug!("Creating loki'd Android boot image");
                loki::create_image(&self.i10e)
            }
            Type::SonyElf => {
                debug!("Creating Sony ELF32 boot image");
                sony_elf::create_image(&self.i10e)
            }
        };

        match result {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Failed to create boot image: {e}");
                self.error = Some(ImageError::Parse(e));
                None
            }
        }
    }

    /// Construct the boot image and write it to a file.
    pub fn create_file(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();

        let Some(data) = self.create() else {
            return false;
        };

        let mut file = match File::create(path) {
            Ok(file) => file,
            Err(e) => {
                self.error = Some(ImageError::FileOpen {
                    path: path.to_owned(),
                    source: e,
                });
                return false;
            }
        };

        if let Err(e) = file.write_all(&data) {
            self.error = Some(ImageError::FileWrite {
                path: path.to_owned(),
                source: e,
            });
            return false;
        }

        true
    }

    /// Format of the most recently loaded boot image. [`None`] until a load
    /// has succeeded.
    pub fn was_type(&self) -> Option<Type> {
        self.source_type
    }

    /// Set the format used by subsequent [`Self::create`] calls. Defaults to
    /// [`Type::Android`].
    pub fn set_type(&mut self, ty: Type) {
        self.target_type = ty;
    }

    /// Board name field in the boot image header. The in-memory value is
    /// unbounded; it is truncated to 15 bytes when an image is created.
    pub fn board_name(&self) -> &str {
        &self.i10e.board_name
    }

    pub fn set_board_name(&mut self, name: impl Into<String>) {
        self.i10e.board_name = name.into();
    }

    pub fn reset_board_name(&mut self) {
        self.i10e.board_name = String::new();
    }

    /// Kernel cmdline in the boot image header. The in-memory value is
    /// unbounded; it is truncated to 511 bytes when an image is created.
    pub fn kernel_cmdline(&self) -> &str {
        &self.i10e.cmdline
    }

    pub fn set_kernel_cmdline(&mut self, cmdline: impl Into<String>) {
        self.i10e.cmdline = cmdline.into();
    }

    pub fn reset_kernel_cmdline(&mut self) {
        self.i10e.cmdline = String::new();
    }

    /// Page size field in the boot image header. Real images use one of
    /// 2048, 4096, 8192, 16384, 32768, 65536, or 131072; other values are
    /// emitted as-is but will not load back.
    pub fn page_size(&self) -> u32 {
        self.i10e.page_size
    }

    pub fn set_page_size(&mut self, size: u32) {
        self.i10e.page_size = size;
    }

    pub fn reset_page_size(&mut self) {
        self.i10e.page_size = DEFAULT_PAGE_SIZE;
    }

    pub fn kernel_address(&self) -> u32 {
        self.i10e.kernel_addr
    }

    pub fn set_kernel_address(&mut self, address: u32) {
        self.i10e.kernel_addr = address;
    }

    pub fn reset_kernel_address(&mut self) {
        self.i10e.kernel_addr = DEFAULT_BASE + DEFAULT_KERNEL_OFFSET;
    }

    pub fn ramdisk_address(&self) -> u32 {
        self.i10e.ramdisk_addr
    }

    pub fn set_ramdisk_address(&mut self, address: u32) {
        self.i10e.ramdisk_addr = address;
    }

    pub fn reset_ramdisk_address(&mut self) {
        self.i10e.ramdisk_addr = DEFAULT_BASE + DEFAULT_RAMDISK_OFFSET;
    }

    pub fn second_bootloader_address(&self) -> u32 {
        self.i10e.second_addr
    }

    pub fn set_second_bootloader_address(&mut self, address: u32) {
        self.i10e.second_addr = address;
    }

    pub fn reset_second_bootloader_address(&mut self) {
        self.i10e.second_addr = DEFAULT_BASE + DEFAULT_SECOND_OFFSET;
    }

    pub fn kernel_tags_address(&self) -> u32 {
        self.i10e.tags_addr
    }

    pub fn set_kernel_tags_address(&mut self, address: u32) {
        self.i10e.tags_addr = address;
    }

    pub fn reset_kernel_tags_address(&mut self) {
        self.i10e.tags_addr = DEFAULT_BASE + DEFAULT_TAGS_OFFSET;
    }

    pub fn ipl_address(&self) -> u32 {
        self.i10e.ipl_addr
    }

    pub fn set_ipl_address(&mut self, address: u32) {
        self.i10e.ipl_addr = address;
    }

    pub fn reset_ipl_address(&mut self) {
        self.i10e.ipl_addr = 0;
    }

    pub fn rpm_address(&self) -> u32 {
        self.i10e.rpm_addr
    }

    pub fn set_rpm_address(&mut self, address: u32) {
        self.i10e.rpm_addr = address;
    }

    pub fn reset_rpm_address(&mut self) {
        self.i10e.rpm_addr = 0;
    }

    pub fn appsbl_address(&self) -> u32 {
        self.i10e.appsbl_addr
    }

    pub fn set_appsbl_address(&mut self, address: u32) {
        self.i10e.appsbl_addr = address;
    }

    pub fn reset_appsbl_address(&mut self) {
        self.i10e.appsbl_addr = 0;
    }

    pub fn entrypoint_address(&self) -> u32 {
        self.i10e.entrypoint
    }

    pub fn set_entrypoint_address(&mut self, address: u32) {
        self.i10e.entrypoint = address;
    }

    pub fn reset_entrypoint_address(&mut self) {
        self.i10e.entrypoint = 0;
    }

    /// Set all of the Android-layout addresses from a base and per-payload
    /// offsets, with 32-bit wraparound:
    ///
    /// - `kernel address = base + kernel offset`
    /// - `ramdisk address = base + ramdisk offset`
    /// - `second bootloader address = base + second bootloader offset`
    /// - `kernel tags address = base + kernel tags offset`
    pub fn set_addresses(
        &mut self,
        base: u32,
        kernel_offset: u32,
        ramdisk_offset: u32,
        second_offset: u32,
        tags_offset: u32,
    ) {
        self.i10e.kernel_addr = base.wrapping_add(kernel_offset);
        self.i10e.ramdisk_addr = base.wrapping_add(ramdisk_offset);
        self.i10e.second_addr = base.wrapping_add(second_offset);
        self.i10e.tags_addr = base.wrapping_add(tags_offset);
    }

    /// Identity field from the boot image header. The first five words hold
    /// the SHA-1 of the payloads; they are recomputed whenever an
    /// Android-layout image is created.
    pub fn id(&self) -> &[u32; 8] {
        &self.i10e.hdr_id
    }

    pub fn kernel_image(&self) -> &[u8] {
        &self.i10e.kernel
    }

    /// Set the kernel image. This automatically updates the kernel size in
    /// the boot image header.
    pub fn set_kernel_image(&mut self, data: Vec<u8>) {
        self.i10e.hdr_kernel_size = data.len() as u32;
        self.i10e.kernel = data;
    }

    pub fn ramdisk_image(&self) -> &[u8] {
        &self.i10e.ramdisk
    }

    /// Set the ramdisk image. This automatically updates the ramdisk size in
    /// the boot image header.
    pub fn set_ramdisk_image(&mut self, data: Vec<u8>) {
        self.i10e.hdr_ramdisk_size = data.len() as u32;
        self.i10e.ramdisk = data;
    }

    pub fn second_bootloader_image(&self) -> &[u8] {
        &self.i10e.second
    }

    /// Set the second bootloader image. This automatically updates the
    /// second bootloader size in the boot image header.
    pub fn set_second_bootloader_image(&mut self, data: Vec<u8>) {
        self.i10e.hdr_second_size = data.len() as u32;
        self.i10e.second = data;
    }

    pub fn device_tree_image(&self) -> &[u8] {
        &self.i10e.device_tree
    }

    /// Set the device tree image. This automatically updates the device tree
    /// size in the boot image header.
    pub fn set_device_tree_image(&mut self, data: Vec<u8>) {
        self.i10e.hdr_dt_size = data.len() as u32;
        self.i10e.device_tree = data;
    }

    /// Aboot image used as patch material when creating Loki images.
    pub fn aboot_image(&self) -> &[u8] {
        &self.i10e.aboot
    }

    pub fn set_aboot_image(&mut self, data: Vec<u8>) {
        self.i10e.aboot = data;
    }

    pub fn ipl_image(&self) -> &[u8] {
        &self.i10e.ipl
    }

    pub fn set_ipl_image(&mut self, data: Vec<u8>) {
        self.i10e.ipl = data;
    }

    pub fn rpm_image(&self) -> &[u8] {
        &self.i10e.rpm
    }

    pub fn set_rpm_image(&mut self, data: Vec<u8>) {
        self.i10e.rpm = data;
    }

    pub fn appsbl_image(&self) -> &[u8] {
        &self.i10e.appsbl
    }

    pub fn set_appsbl_image(&mut self, data: Vec<u8>) {
        self.i10e.appsbl = data;
    }

    /// Sony SIN segment payload.
    pub fn sin_image(&self) -> &[u8] {
        &self.i10e.sony_sin
    }

    pub fn set_sin_image(&mut self, data: Vec<u8>) {
        self.i10e.sony_sin = data;
    }

    /// Raw program header of the Sony SIN segment, preserved verbatim from
    /// the loaded image.
    pub fn sin_header(&self) -> &[u8] {
        &self.i10e.sony_sin_hdr
    }

    pub fn set_sin_header(&mut self, data: Vec<u8>) {
        self.i10e.sony_sin_hdr = data;
    }
}

impl PartialEq for BootImage {
    /// Check that the images, addresses, and metadata are equal. This does
    /// not care if eg. one boot image is loki'd and the other is not, as
    /// long as the contents are the same. The preserved `unused` header word
    /// is ignored for the same reason.
    fn eq(&self, other: &Self) -> bool {
        let a = &self.i10e;
        let b = &other.i10e;

        // Images
        a.kernel == b.kernel
            && a.ramdisk == b.ramdisk
            && a.second == b.second
            && a.device_tree == b.device_tree
            && a.aboot == b.aboot
            // Sony images
            && a.ipl == b.ipl
            && a.rpm == b.rpm
            && a.appsbl == b.appsbl
            && a.sony_sin == b.sony_sin
            && a.sony_sin_hdr == b.sony_sin_hdr
            // Header's integral values
            && a.hdr_kernel_size == b.hdr_kernel_size
            && a.kernel_addr == b.kernel_addr
            && a.hdr_ramdisk_size == b.hdr_ramdisk_size
            && a.ramdisk_addr == b.ramdisk_addr
            && a.hdr_second_size == b.hdr_second_size
            && a.second_addr == b.second_addr
            && a.tags_addr == b.tags_addr
            && a.ipl_addr == b.ipl_addr
            && a.rpm_addr == b.rpm_addr
            && a.appsbl_addr == b.appsbl_addr
            && a.entrypoint == b.entrypoint
            && a.page_size == b.page_size
            && a.hdr_dt_size == b.hdr_dt_size
            && a.hdr_id == b.hdr_id
            // Header's string values
            && a.board_name == b.board_name
            && a.cmdline == b.cmdline
    }
}

impl Eq for BootImage {}

impl fmt::Display for BootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Boot image header:")?;
        writeln!(f, "- Board name:           {:?}", self.i10e.board_name)?;
        writeln!(f, "- Kernel cmdline:       {:?}", self.i10e.cmdline)?;
        writeln!(f, "- Page size:            {}", self.i10e.page_size)?;
        writeln!(f, "- Kernel size:          {}", self.i10e.kernel.len())?;
        writeln!(f, "- Kernel address:       {:#x}", self.i10e.kernel_addr)?;
        writeln!(f, "- Ramdisk size:         {}", self.i10e.ramdisk.len())?;
        writeln!(f, "- Ramdisk address:      {:#x}", self.i10e.ramdisk_addr)?;
        writeln!(f, "- Second stage size:    {}", self.i10e.second.len())?;
        writeln!(f, "- Second stage address: {:#x}", self.i10e.second_addr)?;
        writeln!(f, "- Kernel tags address:  {:#x}", self.i10e.tags_addr)?;
        writeln!(f, "- Device tree size:     {}", self.i10e.device_tree.len())?;
        writeln!(f, "- IPL address:          {:#x}", self.i10e.ipl_addr)?;
        writeln!(f, "- RPM address:          {:#x}", self.i10e.rpm_addr)?;
        writeln!(f, "- APPSBL address:       {:#x}", self.i10e.appsbl_addr)?;
        writeln!(f, "- Entrypoint address:   {:#x}", self.i10e.entrypoint)?;
        write!(f, "- ID:                   {:?}", self.i10e.hdr_id)
    }
}

impl Serialize for BootImage {
    /// Serialize the header metadata. Payload contents are skipped so that
    /// info dumps stay readable.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.i10e.serialize(serializer)
    }
}
