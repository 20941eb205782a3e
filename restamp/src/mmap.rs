// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;

/// A PE image mapped read-write from disk.
///
/// Patching never changes the file's size, so a shared writable mapping
/// is all that is needed: committed patches are stored into the mapped
/// pages, made durable by [`MappedImage::flush`]. The driver skips the
/// flush in dry-run mode; on the error paths nothing has been written
/// in the first place.
pub struct MappedImage {
    map: MmapMut,
}

impl MappedImage {
    /// Map the file at `path` read-write.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        // Safety: the tool assumes exclusive access to the image (see
        // the crate docs), so no other process truncates or remaps the
        // file while it is mapped.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    /// The mapped bytes.
    pub fn data(&self) -> &[u8] {
        &self.map
    }

    /// The mapped bytes, writable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Synchronously write modified pages back to the file.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}
