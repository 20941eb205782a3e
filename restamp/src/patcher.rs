// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The driver: finds every non-deterministic field in a PE image,
//! plans the overwrites, computes the deterministic signature, and
//! commits.
//!
//! Patches are only planned while the image is being parsed; if any
//! part of the parse fails the buffer is never touched. The content
//! digest runs after planning and before commit, over exactly the
//! bytes no patch will overwrite, which is what makes the deposited
//! CodeView signature a fixed point: hashing the patched file with the
//! same exclusions reproduces it.

use crate::error::Error;
use crate::mmap::MappedImage;
use crate::patch::{PatchSet, PatchValue, PatchValues};
use crate::pdb::rewrite_pdb;
use crate::pe::PeTrait;
use crate::{content_digest, usize_from_u32};
use core::mem;
use log::debug;
use md5::{Digest, Md5};
use memoffset::offset_of;
use object::pe::{
    ImageDebugDirectory, ImageExportDirectory, ImageResourceDirectory,
    IMAGE_DEBUG_TYPE_CODEVIEW, IMAGE_DIRECTORY_ENTRY_DEBUG,
    IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DIRECTORY_ENTRY_RESOURCE,
};
use object::read::pe::{PeFile32, PeFile64};
use object::{pod, LittleEndian};
use std::path::Path;

/// Layout of the CodeView `RSDS` record referenced by the debug
/// directory: 4-byte magic, 16-byte GUID, 4-byte age, then the
/// zero-terminated PDB path.
const CV_INFO_PDB70_SIZE: usize = 24;
const CV_GUID_OFFSET: usize = 4;
const CV_AGE_OFFSET: usize = 20;

/// The CodeView record linking a PE to its PDB, as found in the image
/// before patching.
#[derive(Clone, Copy, Debug)]
pub struct CodeViewInfo {
    /// GUID currently stored in the record.
    pub guid: [u8; 16],
    /// Age currently stored in the record.
    pub age: u32,
    /// File offset of the GUID field.
    pub guid_offset: usize,
    /// File offset of the age field.
    pub age_offset: usize,
}

/// Re-stamp the PE image at `image_path`, and its paired PDB when
/// `pdb_path` is given.
///
/// Maps the image read-write, runs [`patch_image_data`], and flushes
/// the mapping unless `dry_run` is set. On error the image file is
/// left unmodified; no patch is committed before every validation, the
/// digest, and the PDB rewrite have succeeded.
pub fn patch_image(
    image_path: &Path,
    pdb_path: Option<&Path>,
    dry_run: bool,
) -> Result<(), Error> {
    let mut image = MappedImage::open(image_path)?;
    patch_image_data(image.data_mut(), pdb_path, dry_run)?;
    if !dry_run {
        image.flush()?;
    }
    Ok(())
}

/// Re-stamp a PE image held in memory.
///
/// This is the whole pipeline minus file mapping: parse, plan patches,
/// digest the stable content, rewrite the PDB (when given), commit.
/// Nothing in `data` changes unless every prior step succeeded, and in
/// dry-run mode nothing changes at all.
pub fn patch_image_data(
    data: &mut [u8],
    pdb_path: Option<&Path>,
    dry_run: bool,
) -> Result<(), Error> {
    let (mut patches, cv_info) = {
        let pe = parse_pe(data)?;
        enumerate_patches(&*pe)?
    };
    patches.sort()?;

    // The signature is a hash of everything the patches will not
    // overwrite. Filling it into the side table now is what the
    // CodeView patches will deposit at commit.
    let mut values = PatchValues::new();
    let mut md5 = Md5::new();
    content_digest(data, &patches, &mut md5)?;
    values.signature = md5.finalize().into();

    // The PDB is rewritten before the image is committed so that a
    // failure on the PDB side leaves the image untouched.
    if let Some(pdb_path) = pdb_path {
        let cv = cv_info
            .as_ref()
            .ok_or(Error::InvalidPdb("PE and PDB signatures do not match"))?;
        rewrite_pdb(pdb_path, cv, &values, dry_run)?;
    }

    patches.commit(data, &values, dry_run)
}

/// Parse as PE32+ first, falling back to PE32. The variant is erased
/// behind [`PeTrait`] from here on.
fn parse_pe(bytes: &[u8]) -> Result<Box<dyn PeTrait + '_>, Error> {
    if let Ok(pe) = PeFile64::parse(bytes) {
        return Ok(Box::new(pe));
    }
    match PeFile32::parse(bytes) {
        Ok(pe) => Ok(Box::new(pe)),
        Err(err) => {
            debug!("PE parse failed: {err}");
            Err(Error::InvalidImage("not a valid PE image"))
        }
    }
}

/// Register every patch site in the image.
///
/// Also returns the CodeView record, when present, for the PDB
/// rewrite.
fn enumerate_patches(
    pe: &dyn PeTrait,
) -> Result<(PatchSet, Option<CodeViewInfo>), Error> {
    let mut patches = PatchSet::new();

    patches.add(
        pe.coff_timestamp_offset()?,
        PatchValue::Timestamp,
        "IMAGE_FILE_HEADER.TimeDateStamp",
    );

    // Deliberately not a recomputed PE checksum: the field is
    // overwritten with the reproducible constant, matching what
    // zap_timestamp does. Consumers that validate the checksum will
    // reject the file.
    patches.add(
        pe.check_sum_offset()?,
        PatchValue::Timestamp,
        "OptionalHeader.CheckSum",
    );

    if let Some(range) =
        pe.data_directory_file_range(IMAGE_DIRECTORY_ENTRY_EXPORT)?
    {
        if range.len() < mem::size_of::<ImageExportDirectory>() {
            return Err(Error::InvalidImage("truncated export directory"));
        }
        patches.add(
            range.start + offset_of!(ImageExportDirectory, time_date_stamp),
            PatchValue::Timestamp,
            "IMAGE_EXPORT_DIRECTORY.TimeDateStamp",
        );
    }

    if let Some(range) =
        pe.data_directory_file_range(IMAGE_DIRECTORY_ENTRY_RESOURCE)?
    {
        if range.len() < mem::size_of::<ImageResourceDirectory>() {
            return Err(Error::InvalidImage("truncated resource directory"));
        }
        patches.add(
            range.start + offset_of!(ImageResourceDirectory, time_date_stamp),
            PatchValue::Timestamp,
            "IMAGE_RESOURCE_DIRECTORY.TimeDateStamp",
        );
    }

    let mut cv_info = None;
    if let Some(range) =
        pe.data_directory_file_range(IMAGE_DIRECTORY_ENTRY_DEBUG)?
    {
        let bytes = pe
            .data()
            .get(range.clone())
            .ok_or(Error::InvalidImage("debug directory out of bounds"))?;
        let entry_size = mem::size_of::<ImageDebugDirectory>();
        if bytes.len() % entry_size != 0 {
            return Err(Error::InvalidImage("invalid debug directory size"));
        }
        let count = bytes.len() / entry_size;
        let (entries, _) =
            pod::slice_from_bytes::<ImageDebugDirectory>(bytes, count)
                .map_err(|()| {
                    Error::InvalidImage("misaligned debug directory")
                })?;

        for (i, entry) in entries.iter().enumerate() {
            // A zero timestamp marks a deliberately absent value and is
            // preserved.
            if entry.time_date_stamp.get(LittleEndian) != 0 {
                patches.add(
                    range.start
                        + i * entry_size
                        + offset_of!(ImageDebugDirectory, time_date_stamp),
                    PatchValue::Timestamp,
                    "IMAGE_DEBUG_DIRECTORY.TimeDateStamp",
                );
            }

            if entry.typ.get(LittleEndian) == IMAGE_DEBUG_TYPE_CODEVIEW {
                if cv_info.is_some() {
                    return Err(Error::InvalidImage(
                        "found multiple CodeView debug entries",
                    ));
                }
                cv_info = Some(read_code_view(pe.data(), entry)?);
            }
        }
    }

    if let Some(cv) = &cv_info {
        patches.add(cv.guid_offset, PatchValue::PdbSignature, "PDB Signature");
        patches.add(cv.age_offset, PatchValue::PdbAge, "PDB Age");
    }

    Ok((patches, cv_info))
}

fn read_code_view(
    data: &[u8],
    entry: &ImageDebugDirectory,
) -> Result<CodeViewInfo, Error> {
    let start = usize_from_u32(entry.pointer_to_raw_data.get(LittleEndian));
    let size = usize_from_u32(entry.size_of_data.get(LittleEndian));
    if size < CV_INFO_PDB70_SIZE {
        return Err(Error::InvalidImage("truncated CodeView debug entry"));
    }
    let end = start
        .checked_add(size)
        .ok_or(Error::InvalidImage("invalid CodeView debug entry location"))?;
    let bytes = data
        .get(start..end)
        .ok_or(Error::InvalidImage("invalid CodeView debug entry location"))?;

    if &bytes[..4] != b"RSDS" {
        return Err(Error::InvalidImage(
            "unsupported PDB format, only version 7.0 is supported",
        ));
    }

    let mut guid = [0; 16];
    guid.copy_from_slice(&bytes[CV_GUID_OFFSET..CV_GUID_OFFSET + 16]);
    let age = u32::from_le_bytes(
        bytes[CV_AGE_OFFSET..CV_AGE_OFFSET + 4].try_into().unwrap(),
    );

    Ok(CodeViewInfo {
        guid,
        age,
        guid_offset: start + CV_GUID_OFFSET,
        age_offset: start + CV_AGE_OFFSET,
    })
}
