// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Deterministic re-stamping of PE images and their PDB files.
//!
//! A freshly linked PE carries a link-time timestamp in several headers
//! and a random GUID binding it to its PDB, so rebuilding identical
//! sources yields different binaries. [`patch_image`] rewrites those
//! fields in place with values derived from the file's own content: the
//! timestamps become a fixed constant and the GUID becomes a 128-bit
//! hash of every byte that is not itself being rewritten. The paired
//! PDB, when given, is rewritten so the two files stay mutually linked.
//!
//! The tool assumes exclusive access to the files it patches.
//!
//! Reference:
//! <https://docs.microsoft.com/en-us/windows/win32/debug/pe-format>

#![warn(missing_docs)]

mod content_digest;
mod error;
mod mmap;
mod msf;
mod patch;
mod patcher;
mod pdb;
mod pe;

pub use content_digest::content_digest;
pub use error::Error;
pub use mmap::MappedImage;
pub use msf::{Msf, MsfError};
pub use patch::{
    Patch, PatchSet, PatchValue, PatchValues, REPRO_AGE, REPRO_TIMESTAMP,
};
pub use patcher::{patch_image, patch_image_data, CodeViewInfo};
pub use pdb::{
    rewrite_pdb, PdbHeader70, PDB_HEADER_STREAM, PDB_OLD_DIRECTORY_STREAM,
    PDB_VERSION_VC70,
};
pub use pe::{PeOffsetError, PeTrait};

/// Convert a `u32` to a `usize`, panicking if the value does not fit.
///
/// This can only panic on targets where `usize` is smaller than 32
/// bits, which is not considered a supported use case by this library.
fn usize_from_u32(val: u32) -> usize {
    val.try_into().unwrap()
}
