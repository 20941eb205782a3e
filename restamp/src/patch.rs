// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::error::Error;
use log::{debug, info};

/// Timestamp stored in every patched `TimeDateStamp` field: Jan 1 2010
/// 00:00:00 UTC, the same value Google's zap_timestamp uses. Zero is
/// not an option since the loader gives it a reserved meaning.
pub const REPRO_TIMESTAMP: u32 = 0x4B8C_E2C7;

/// Age stored in the CodeView record and the PDB header after patching.
pub const REPRO_AGE: u32 = 1;

/// Names the side-table entry that supplies a patch's bytes.
///
/// Patches do not own their replacement bytes; they refer to one of the
/// entries of a [`PatchValues`] table resolved at commit time. The
/// length of every entry is fixed, so a patch can never copy more bytes
/// than its source holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PatchValue {
    /// The 4-byte reproducible timestamp.
    Timestamp,
    /// The 16-byte deterministic PDB signature.
    PdbSignature,
    /// The 4-byte PDB age.
    PdbAge,
}

impl PatchValue {
    /// Number of bytes this value occupies in the image.
    pub fn size(self) -> usize {
        match self {
            Self::Timestamp | Self::PdbAge => 4,
            Self::PdbSignature => 16,
        }
    }
}

/// The constants a [`PatchSet`] deposits into the image.
///
/// The signature starts out zeroed and is filled from the content
/// digest after all patches are planned. The committed CodeView record
/// therefore ends up holding a hash that excludes its own bytes.
#[derive(Clone, Debug)]
pub struct PatchValues {
    /// Replacement for every `TimeDateStamp` and `CheckSum` field.
    pub timestamp: u32,
    /// Replacement for the CodeView GUID and the PDB `sig70`.
    pub signature: [u8; 16],
    /// Replacement for the CodeView and PDB age.
    pub age: u32,
}

impl PatchValues {
    /// Side table holding the reproducible defaults and a zeroed
    /// signature.
    pub fn new() -> Self {
        Self {
            timestamp: REPRO_TIMESTAMP,
            signature: [0; 16],
            age: REPRO_AGE,
        }
    }

    fn write(&self, value: PatchValue, dest: &mut [u8]) {
        match value {
            PatchValue::Timestamp => {
                dest.copy_from_slice(&self.timestamp.to_le_bytes());
            }
            PatchValue::PdbSignature => dest.copy_from_slice(&self.signature),
            PatchValue::PdbAge => {
                dest.copy_from_slice(&self.age.to_le_bytes());
            }
        }
    }
}

impl Default for PatchValues {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending overwrite of a byte range within the image.
#[derive(Clone, Copy, Debug)]
pub struct Patch {
    /// Destination offset within the image.
    pub offset: usize,
    /// Which side-table entry supplies the bytes.
    pub value: PatchValue,
    /// Name of the patched field, for diagnostics.
    pub label: &'static str,
}

/// Append-only set of pending patches, committed in one step.
///
/// Patches are planned while the image is still being parsed; nothing
/// touches the buffer until every validation has passed and
/// [`PatchSet::commit`] runs. A parse failure simply drops the set.
#[derive(Debug, Default)]
pub struct PatchSet {
    patches: Vec<Patch>,
    sorted: bool,
}

impl PatchSet {
    /// Create an empty patch set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan an overwrite of `value.size()` bytes at `offset`.
    pub fn add(&mut self, offset: usize, value: PatchValue, label: &'static str) {
        debug!(
            "planned patch: {label} at {offset:#x} ({} bytes)",
            value.size()
        );
        self.patches.push(Patch {
            offset,
            value,
            label,
        });
        self.sorted = false;
    }

    /// The planned patches, in insertion order until [`PatchSet::sort`]
    /// runs.
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Whether [`PatchSet::sort`] has run since the last addition.
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Order the patches by destination offset.
    ///
    /// Every patched field occurs at most once in a well-formed image,
    /// so any two patches sharing a byte mean the image lied about its
    /// layout.
    pub fn sort(&mut self) -> Result<(), Error> {
        self.patches.sort_unstable_by_key(|patch| patch.offset);
        for pair in self.patches.windows(2) {
            let end = pair[0]
                .offset
                .checked_add(pair[0].value.size())
                .ok_or(Error::InvalidImage("patch range overflows"))?;
            if end > pair[1].offset {
                return Err(Error::InvalidImage("overlapping patch"));
            }
        }
        self.sorted = true;
        Ok(())
    }

    /// Write every planned patch into `data`.
    ///
    /// The set must be sorted; ranges are re-checked to be disjoint and
    /// in bounds before the first byte is written. In dry-run mode each
    /// labeled patch is logged and `data` is left untouched.
    pub fn commit(
        &self,
        data: &mut [u8],
        values: &PatchValues,
        dry_run: bool,
    ) -> Result<(), Error> {
        if !self.sorted {
            return Err(Error::InvalidImage("patch set not sorted"));
        }

        let mut prev_end = 0;
        for patch in &self.patches {
            if patch.offset < prev_end {
                return Err(Error::InvalidImage("overlapping patch"));
            }
            prev_end = patch
                .offset
                .checked_add(patch.value.size())
                .ok_or(Error::InvalidImage("patch range overflows"))?;
            if prev_end > data.len() {
                return Err(Error::InvalidImage("patch out of bounds"));
            }
        }

        for patch in &self.patches {
            if dry_run {
                info!("would patch {} at {:#x}", patch.label, patch.offset);
            } else {
                debug!("patching {} at {:#x}", patch.label, patch.offset);
                let end = patch.offset + patch.value.size();
                values.write(patch.value, &mut data[patch.offset..end]);
            }
        }

        Ok(())
    }
}
