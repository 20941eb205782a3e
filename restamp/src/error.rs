// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::pe::PeOffsetError;
use thiserror::Error;

/// Errors produced while re-stamping a PE image or its PDB.
#[derive(Debug, Error)]
pub enum Error {
    /// The PE structure is inconsistent or unsupported.
    #[error("invalid image: {0}")]
    InvalidImage(&'static str),

    /// The PDB is malformed, too old, or does not pair with the image.
    #[error("invalid PDB: {0}")]
    InvalidPdb(&'static str),

    /// An operating-system level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<PeOffsetError> for Error {
    fn from(_: PeOffsetError) -> Self {
        Error::InvalidImage("an offset within the PE is invalid")
    }
}
