/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! A library for reading, editing, and writing the boot image containers
//! used across the Android ecosystem: the plain AOSP layout, the loki'd and
//! bump'd variants of it, and Sony's ELF32 layout. All four formats share
//! one neutral in-memory representation, so an image loaded from one
//! container can be written back out as any other.

pub mod bootimage;
pub mod format;
pub mod stream;
pub mod util;
