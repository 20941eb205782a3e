// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::usize_from_u32;
use core::fmt::{self, Display, Formatter};
use core::ops::Range;
use memoffset::offset_of;
use object::pe::ImageFileHeader;
use object::read::pe::{ImageNtHeaders, PeFile};
use object::{pod, LittleEndian};

/// An offset within the PE is invalid.
///
/// This can occur if an offset is larger than the PE itself, or if
/// arithmetic overflow occurs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PeOffsetError;

impl Display for PeOffsetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "an offset within the PE is invalid")
    }
}

impl std::error::Error for PeOffsetError {}

/// Trait for locating patchable fields within a PE file.
///
/// Implemented for both the PE32 and PE32+ variants of
/// [`object::read::pe::PeFile`]; the variant is selected once when the
/// file is parsed and erased behind this trait everywhere else.
pub trait PeTrait {
    /// Get the raw bytes of the PE file.
    fn data(&self) -> &[u8];

    /// File offset of `FILE_HEADER.TimeDateStamp`.
    fn coff_timestamp_offset(&self) -> Result<usize, PeOffsetError>;

    /// File offset of the optional header's `CheckSum` field.
    fn check_sum_offset(&self) -> Result<usize, PeOffsetError>;

    /// On-disk byte range of a data directory's payload.
    ///
    /// Returns `Ok(None)` if the directory entry is absent or has zero
    /// size. The entry's virtual address is translated through the
    /// section table; an address that lies in no section, or a payload
    /// running past the end of a section or of the file, is an error.
    fn data_directory_file_range(
        &self,
        index: usize,
    ) -> Result<Option<Range<usize>>, PeOffsetError>;
}

impl<'data, I> PeTrait for PeFile<'data, I>
where
    I: ImageNtHeaders,
{
    fn data(&self) -> &'data [u8] {
        self.data()
    }

    fn coff_timestamp_offset(&self) -> Result<usize, PeOffsetError> {
        let file_header = self.nt_headers().file_header();
        let header_offset =
            offset_in(self.data(), pod::bytes_of(file_header))
                .ok_or(PeOffsetError)?;
        header_offset
            .checked_add(offset_of!(ImageFileHeader, time_date_stamp))
            .ok_or(PeOffsetError)
    }

    fn check_sum_offset(&self) -> Result<usize, PeOffsetError> {
        let optional_header = self.nt_headers().optional_header();
        let optional_header_offset =
            offset_in(self.data(), pod::bytes_of(optional_header))
                .ok_or(PeOffsetError)?;
        // The `check_sum` field sits at the same offset within both the
        // 32-bit and 64-bit optional headers.
        optional_header_offset.checked_add(64).ok_or(PeOffsetError)
    }

    fn data_directory_file_range(
        &self,
        index: usize,
    ) -> Result<Option<Range<usize>>, PeOffsetError> {
        let dir = match self.data_directory(index) {
            Some(dir) => dir,
            None => return Ok(None),
        };
        let size = dir.size.get(LittleEndian);
        if size == 0 {
            return Ok(None);
        }
        let va = dir.virtual_address.get(LittleEndian);

        // Translate the virtual address through the section table to
        // find where the payload sits on disk.
        for section in self.section_table().iter() {
            let section_va = section.virtual_address.get(LittleEndian);
            let raw_size = section.size_of_raw_data.get(LittleEndian);
            if va < section_va || va.wrapping_sub(section_va) >= raw_size {
                continue;
            }
            let into_section = va - section_va;
            if size > raw_size - into_section {
                return Err(PeOffsetError);
            }
            let start = usize_from_u32(
                section.pointer_to_raw_data.get(LittleEndian),
            )
            .checked_add(usize_from_u32(into_section))
            .ok_or(PeOffsetError)?;
            let end = start
                .checked_add(usize_from_u32(size))
                .ok_or(PeOffsetError)?;
            if end > self.data().len() {
                return Err(PeOffsetError);
            }
            return Ok(Some(start..end));
        }

        Err(PeOffsetError)
    }
}

/// Offset of `bytes` from the start of `data`, assuming `bytes` is a
/// subslice of `data`.
fn offset_in(data: &[u8], bytes: &[u8]) -> Option<usize> {
    let base = data.as_ptr() as usize;
    let start = bytes.as_ptr() as usize;
    start.checked_sub(base)
}
