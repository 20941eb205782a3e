// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::error::Error;
use crate::msf::{Msf, MsfError};
use crate::patch::PatchValues;
use crate::patcher::CodeViewInfo;
use log::{debug, info};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stream holding the stale copy of the stream directory left behind by
/// older tooling. It is emptied during the rewrite so no shadow of the
/// old identity survives.
pub const PDB_OLD_DIRECTORY_STREAM: usize = 0;

/// Stream holding the PDB header.
pub const PDB_HEADER_STREAM: usize = 1;

/// Lowest PDB implementation version with the 7.0 header layout.
pub const PDB_VERSION_VC70: u32 = 20000404;

/// Size of the fixed part of the 7.0 header stream.
const PDB_HEADER_SIZE: usize = 28;

/// Fixed fields at the start of the PDB header stream.
///
/// The trailing bytes of the stream hold the named-stream table, which
/// passes through the rewrite untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PdbHeader70 {
    /// Implementation version; `VC70` or newer.
    pub version: u32,
    /// Build timestamp.
    pub timestamp: u32,
    /// Incremental-link count, also stored in the image's CodeView
    /// record.
    pub age: u32,
    /// GUID binding this PDB to its image.
    pub guid: [u8; 16],
}

impl PdbHeader70 {
    /// Decode the header from the front of the header stream.
    pub fn parse(stream: &[u8]) -> Result<Self, Error> {
        if stream.len() < PDB_HEADER_SIZE {
            return Err(Error::InvalidPdb("missing PDB 7.0 header"));
        }
        let mut guid = [0; 16];
        guid.copy_from_slice(&stream[12..28]);
        Ok(Self {
            version: u32::from_le_bytes(stream[0..4].try_into().unwrap()),
            timestamp: u32::from_le_bytes(stream[4..8].try_into().unwrap()),
            age: u32::from_le_bytes(stream[8..12].try_into().unwrap()),
            guid,
        })
    }

    /// Encode the header back over the front of the header stream.
    ///
    /// # Panics
    ///
    /// Panics if `stream` is shorter than the fixed header.
    pub fn write(&self, stream: &mut [u8]) {
        stream[0..4].copy_from_slice(&self.version.to_le_bytes());
        stream[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        stream[8..12].copy_from_slice(&self.age.to_le_bytes());
        stream[12..28].copy_from_slice(&self.guid);
    }
}

/// Rewrite the PDB at `pdb_path` so its identity matches what the image
/// will hold after its patches commit.
///
/// The old stream-directory stream is emptied, the header stream's
/// timestamp, age, and GUID are replaced from `values`, and the result
/// is serialized to `<pdb_path>.tmp`. The temp file replaces the
/// original by rename on success, or is deleted in dry-run mode. The
/// original file is never modified in place, so a failure at any step
/// leaves it untouched (an orphaned `.tmp` may remain for the caller to
/// reap).
///
/// Fails with [`Error::InvalidPdb`] if the PDB's current age and GUID
/// do not match `cv`, the image's CodeView record: that means the
/// caller paired the wrong PDB with this image.
pub fn rewrite_pdb(
    pdb_path: &Path,
    cv: &CodeViewInfo,
    values: &PatchValues,
    dry_run: bool,
) -> Result<(), Error> {
    let data = fs::read(pdb_path)?;
    let tmp_path = temp_pdb_path(pdb_path);
    let mut tmp = fs::File::create(&tmp_path)?;

    let mut msf = Msf::parse(&data).map_err(invalid_msf)?;

    msf.replace_stream(PDB_OLD_DIRECTORY_STREAM, Vec::new())
        .map_err(|_| Error::InvalidPdb("missing old directory stream"))?;

    let stream = msf
        .stream_mut(PDB_HEADER_STREAM)
        .ok_or(Error::InvalidPdb("missing PDB header stream"))?;
    let mut header = PdbHeader70::parse(stream)?;
    if header.version < PDB_VERSION_VC70 {
        return Err(Error::InvalidPdb("unsupported PDB implementation version"));
    }
    if cv.age != header.age || cv.guid != header.guid {
        return Err(Error::InvalidPdb("PE and PDB signatures do not match"));
    }

    info!("PDB timestamp: {}", header.timestamp);
    info!("PDB age: {}", header.age);

    header.timestamp = values.timestamp;
    header.age = values.age;
    header.guid = values.signature;
    header.write(stream);

    let bytes = msf.to_bytes().map_err(invalid_msf)?;
    tmp.write_all(&bytes)?;
    drop(tmp);

    if dry_run {
        fs::remove_file(&tmp_path)?;
    } else {
        fs::rename(&tmp_path, pdb_path)?;
    }
    Ok(())
}

fn invalid_msf(err: MsfError) -> Error {
    debug!("MSF error: {err}");
    Error::InvalidPdb("corrupt MSF container")
}

/// The PDB is serialized here first and renamed into place once
/// everything has succeeded.
fn temp_pdb_path(pdb_path: &Path) -> PathBuf {
    let mut path = pdb_path.as_os_str().to_os_string();
    path.push(".tmp");
    PathBuf::from(path)
}
