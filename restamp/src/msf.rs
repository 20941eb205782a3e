// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Minimal MSF 7.0 container support.
//!
//! A PDB is an MSF file: a page-oriented store holding numbered byte
//! streams. The rewriter only needs to load every stream, swap a couple
//! of them, and serialize the result, so this module keeps the whole
//! container in memory rather than paging streams on demand.
//!
//! Layout reference: <https://llvm.org/docs/PDB/MsfFile.html>

use crate::usize_from_u32;
use thiserror::Error;

/// Magic at the start of every MSF 7.0 file.
const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1aDS\0\0\0";

/// Size of the fixed superblock fields: the magic plus six `u32`s.
const SUPERBLOCK_SIZE: usize = 56;

/// A stream size of `u32::MAX` marks a nil stream in the directory.
const NIL_STREAM_SIZE: u32 = u32::MAX;

/// An error encountered while reading or writing an MSF container.
#[derive(Debug, Error)]
pub enum MsfError {
    /// The input was not recognized as an MSF 7.0 file.
    #[error("not an MSF 7.0 file")]
    UnrecognizedFormat,

    /// The superblock specifies an unsupported page size.
    #[error("invalid MSF page size: {0}")]
    InvalidPageSize(u32),

    /// A page number referred outside the file.
    #[error("MSF page reference out of range: {0}")]
    PageOutOfRange(u32),

    /// The requested stream is not in the directory.
    #[error("MSF stream not found: {0}")]
    StreamNotFound(usize),

    /// The stream directory does not fit in a single page map page.
    #[error("MSF stream directory too large: {0} bytes")]
    DirectoryTooLarge(u32),

    /// A stream is too large to be described by the directory.
    #[error("MSF stream too long")]
    StreamTooLong,

    /// The stream directory ended before its declared contents.
    #[error("unexpected end of MSF stream directory")]
    UnexpectedEof,
}

/// An MSF container loaded fully into memory.
#[derive(Debug)]
pub struct Msf {
    page_size: u32,
    streams: Vec<Vec<u8>>,
}

impl Msf {
    /// Create an empty container.
    pub fn new(page_size: u32) -> Result<Self, MsfError> {
        check_page_size(page_size)?;
        Ok(Self {
            page_size,
            streams: Vec::new(),
        })
    }

    /// Parse an MSF file.
    pub fn parse(data: &[u8]) -> Result<Self, MsfError> {
        if data.len() < SUPERBLOCK_SIZE || &data[..32] != MSF_MAGIC {
            return Err(MsfError::UnrecognizedFormat);
        }
        let page_size = read_u32(data, 32);
        check_page_size(page_size)?;
        // Offset 36 holds the free page map page and offset 48 is
        // reserved; neither matters for reading.
        let page_count = read_u32(data, 40);
        let dir_size = read_u32(data, 44);
        let page_map_page = read_u32(data, 52);

        // The page map is a single page listing the directory's pages.
        let dir_page_count = pages_needed(dir_size, page_size);
        if dir_page_count
            .checked_mul(4)
            .map_or(true, |len| len > page_size)
        {
            return Err(MsfError::DirectoryTooLarge(dir_size));
        }
        let page_map = read_page(data, page_size, page_count, page_map_page)?;
        let mut directory = Vec::with_capacity(usize_from_u32(dir_size));
        for i in 0..usize_from_u32(dir_page_count) {
            let page = read_u32(page_map, i * 4);
            directory.extend_from_slice(read_page(
                data, page_size, page_count, page,
            )?);
        }
        directory.truncate(usize_from_u32(dir_size));

        // Decode the directory: stream count, sizes, then page lists.
        let mut cursor = DirCursor::new(&directory);
        let stream_count = usize_from_u32(cursor.u32()?);
        if stream_count
            .checked_mul(4)
            .and_then(|len| len.checked_add(4))
            .map_or(true, |len| len > directory.len())
        {
            return Err(MsfError::UnexpectedEof);
        }
        let mut sizes = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            sizes.push(cursor.u32()?);
        }

        let mut streams = Vec::with_capacity(stream_count);
        for &size in &sizes {
            // Nil streams read back as empty.
            let size = if size == NIL_STREAM_SIZE { 0 } else { size };
            // Bound the preallocation by the file length; a directory
            // claiming more is rejected below when its pages run out.
            let mut stream =
                Vec::with_capacity(usize_from_u32(size).min(data.len()));
            for _ in 0..pages_needed(size, page_size) {
                let page = cursor.u32()?;
                stream.extend_from_slice(read_page(
                    data, page_size, page_count, page,
                )?);
            }
            stream.truncate(usize_from_u32(size));
            streams.push(stream);
        }

        Ok(Self { page_size, streams })
    }

    /// The container's page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of streams in the directory.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Contents of stream `index`.
    pub fn stream(&self, index: usize) -> Option<&[u8]> {
        self.streams.get(index).map(Vec::as_slice)
    }

    /// Writable contents of stream `index`.
    pub fn stream_mut(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        self.streams.get_mut(index)
    }

    /// Append a stream, returning its index.
    pub fn push_stream(&mut self, contents: Vec<u8>) -> usize {
        self.streams.push(contents);
        self.streams.len() - 1
    }

    /// Replace the contents of stream `index`.
    pub fn replace_stream(
        &mut self,
        index: usize,
        contents: Vec<u8>,
    ) -> Result<(), MsfError> {
        let stream = self
            .streams
            .get_mut(index)
            .ok_or(MsfError::StreamNotFound(index))?;
        *stream = contents;
        Ok(())
    }

    /// Serialize the container.
    ///
    /// Pages are laid out as: superblock, zero-filled free page maps at
    /// every interval position, stream pages in stream order, directory
    /// pages, directory page map. The output depends only on the page
    /// size and the stream contents, so serialization is deterministic.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MsfError> {
        let page_size = usize_from_u32(self.page_size);
        let mut writer = PageWriter::new(page_size);

        // Page 0 is the superblock; its fields are filled in last.
        writer.push(&[0; SUPERBLOCK_SIZE]);

        let mut directory = Vec::new();
        directory.extend_from_slice(&u32_len(self.streams.len())?.to_le_bytes());
        for stream in &self.streams {
            directory.extend_from_slice(&u32_len(stream.len())?.to_le_bytes());
        }
        for stream in &self.streams {
            for chunk in stream.chunks(page_size) {
                let page = writer.push(chunk);
                directory.extend_from_slice(&page.to_le_bytes());
            }
        }

        let mut page_map = Vec::new();
        for chunk in directory.chunks(page_size) {
            let page = writer.push(chunk);
            page_map.extend_from_slice(&page.to_le_bytes());
        }
        if page_map.len() > page_size {
            return Err(MsfError::DirectoryTooLarge(u32_len(directory.len())?));
        }
        let page_map_page = writer.push(&page_map);

        let page_count = writer.page_count();
        let mut out = writer.into_bytes();
        out[..32].copy_from_slice(MSF_MAGIC);
        out[32..36].copy_from_slice(&self.page_size.to_le_bytes());
        out[36..40].copy_from_slice(&1u32.to_le_bytes());
        out[40..44].copy_from_slice(&page_count.to_le_bytes());
        out[44..48].copy_from_slice(&u32_len(directory.len())?.to_le_bytes());
        // Bytes 48..52 are reserved and stay zero.
        out[52..56].copy_from_slice(&page_map_page.to_le_bytes());
        Ok(out)
    }
}

fn check_page_size(page_size: u32) -> Result<(), MsfError> {
    if !(512..=4096).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(MsfError::InvalidPageSize(page_size));
    }
    Ok(())
}

/// Number of pages needed to hold `size` bytes.
fn pages_needed(size: u32, page_size: u32) -> u32 {
    (u64::from(size) + u64::from(page_size) - 1)
        .checked_div(u64::from(page_size))
        .unwrap_or(0) as u32
}

/// Read a `u32` at `offset`; the caller has already bounds-checked.
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn read_page(
    data: &[u8],
    page_size: u32,
    page_count: u32,
    page: u32,
) -> Result<&[u8], MsfError> {
    if page >= page_count {
        return Err(MsfError::PageOutOfRange(page));
    }
    let start = usize_from_u32(page)
        .checked_mul(usize_from_u32(page_size))
        .ok_or(MsfError::PageOutOfRange(page))?;
    let end = start
        .checked_add(usize_from_u32(page_size))
        .ok_or(MsfError::PageOutOfRange(page))?;
    data.get(start..end).ok_or(MsfError::PageOutOfRange(page))
}

fn u32_len(len: usize) -> Result<u32, MsfError> {
    u32::try_from(len).map_err(|_| MsfError::StreamTooLong)
}

/// Cursor over the decoded stream directory bytes.
struct DirCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DirCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32, MsfError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(MsfError::UnexpectedEof)?;
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// Accumulates whole pages, skipping the positions reserved for the
/// free page maps (pages 1 and 2 of every `page_size`-page interval).
struct PageWriter {
    page_size: usize,
    buf: Vec<u8>,
}

impl PageWriter {
    fn new(page_size: usize) -> Self {
        Self {
            page_size,
            buf: Vec::new(),
        }
    }

    fn page_index(&self) -> usize {
        self.buf.len() / self.page_size
    }

    /// Append one page of content and return its page number.
    fn push(&mut self, contents: &[u8]) -> u32 {
        debug_assert!(contents.len() <= self.page_size);
        while matches!(self.page_index() % self.page_size, 1 | 2) {
            self.buf.resize(self.buf.len() + self.page_size, 0);
        }
        let page = self.page_index();
        self.buf.extend_from_slice(contents);
        self.buf.resize((page + 1) * self.page_size, 0);
        page as u32
    }

    fn page_count(&self) -> u32 {
        self.page_index() as u32
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Msf {
        let mut msf = Msf::new(512).unwrap();
        msf.push_stream(vec![0xAA; 100]);
        msf.push_stream((0..=255).collect());
        msf.push_stream(Vec::new());
        msf.push_stream(vec![0x55; 1500]);
        msf
    }

    #[test]
    fn test_round_trip() {
        let msf = sample();
        let bytes = msf.to_bytes().unwrap();
        let parsed = Msf::parse(&bytes).unwrap();
        assert_eq!(parsed.page_size(), 512);
        assert_eq!(parsed.stream_count(), 4);
        for i in 0..4 {
            assert_eq!(parsed.stream(i), msf.stream(i));
        }
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let msf = sample();
        assert_eq!(msf.to_bytes().unwrap(), msf.to_bytes().unwrap());
    }

    #[test]
    fn test_replace_stream() {
        let mut msf = sample();
        msf.replace_stream(0, Vec::new()).unwrap();
        let bytes = msf.to_bytes().unwrap();
        let parsed = Msf::parse(&bytes).unwrap();
        assert_eq!(parsed.stream(0), Some(&[][..]));
        assert_eq!(parsed.stream(1), msf.stream(1));
        assert!(msf.replace_stream(9, Vec::new()).is_err());
    }

    #[test]
    fn test_nil_stream_reads_as_empty() {
        // A nil stream has size u32::MAX and no pages. Serialize a
        // container whose first stream is empty, then rewrite that
        // stream's directory size entry to the nil marker. The
        // directory page is listed in the page map page, which the
        // superblock points at.
        let mut msf = Msf::new(512).unwrap();
        msf.push_stream(Vec::new());
        msf.push_stream(vec![7; 10]);
        let mut bytes = msf.to_bytes().unwrap();
        let page_map_page = read_u32(&bytes, 52) as usize;
        let dir_page = read_u32(&bytes, page_map_page * 512) as usize;
        let size0_offset = dir_page * 512 + 4;
        bytes[size0_offset..size0_offset + 4]
            .copy_from_slice(&NIL_STREAM_SIZE.to_le_bytes());
        let parsed = Msf::parse(&bytes).unwrap();
        assert_eq!(parsed.stream(0), Some(&[][..]));
        assert_eq!(parsed.stream(1), Some(&[7u8; 10][..]));
    }

    #[test]
    fn test_free_page_map_positions_are_reserved() {
        let mut msf = Msf::new(512).unwrap();
        // Enough data to cross the second free-page-map interval at
        // pages 513 and 514.
        msf.push_stream(vec![0xCC; 512 * 600]);
        let bytes = msf.to_bytes().unwrap();
        assert_eq!(&bytes[513 * 512..515 * 512], &[0u8; 2 * 512][..]);
        let parsed = Msf::parse(&bytes).unwrap();
        assert_eq!(parsed.stream(0), msf.stream(0));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Msf::parse(b"not an msf file"),
            Err(MsfError::UnrecognizedFormat)
        ));
        let mut bytes = sample().to_bytes().unwrap();
        bytes[33] = 0xFF;
        assert!(matches!(
            Msf::parse(&bytes),
            Err(MsfError::InvalidPageSize(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_file() {
        let bytes = sample().to_bytes().unwrap();
        assert!(Msf::parse(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_invalid_page_size_on_new() {
        assert!(Msf::new(100).is_err());
        assert!(Msf::new(8192).is_err());
        assert!(Msf::new(0).is_err());
    }
}
