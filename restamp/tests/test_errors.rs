// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use restamp::{Error, MsfError, PeOffsetError};
use std::io;

// Don't check the exact messages, just validate that formatting works
// without panic or error.

#[test]
fn test_error() {
    format!("{}", Error::InvalidImage("overlapping patch"));
    format!("{}", Error::InvalidPdb("missing PDB header stream"));
    format!(
        "{}",
        Error::Io(io::Error::new(io::ErrorKind::Other, "mmap failed"))
    );
}

#[test]
fn test_msf_error() {
    format!("{}", MsfError::UnrecognizedFormat);
    format!("{}", MsfError::InvalidPageSize(0));
    format!("{}", MsfError::PageOutOfRange(123));
    format!("{}", MsfError::StreamNotFound(1));
    format!("{}", MsfError::DirectoryTooLarge(1 << 20));
    format!("{}", MsfError::StreamTooLong);
    format!("{}", MsfError::UnexpectedEof);
}

#[test]
fn test_pe_offset_error() {
    format!("{}", PeOffsetError);
}

#[test]
fn test_pe_offset_error_converts_to_invalid_image() {
    assert!(matches!(
        Error::from(PeOffsetError),
        Error::InvalidImage(_)
    ));
}
