// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::error::Error;
use crate::patch::PatchSet;
use digest::Update;

fn content_digest_impl(
    data: &[u8],
    patches: &PatchSet,
    digest: &mut dyn Update,
) -> Option<()> {
    let mut pos = 0;

    // Hash the regions between the patches. Since the patches are
    // sorted, this walks the file sequentially.
    for patch in patches.patches() {
        let bytes = data.get(pos..patch.offset)?;
        digest.update(bytes);
        pos = patch.offset.checked_add(patch.value.size())?;
    }

    // Hash everything after the last patch.
    digest.update(data.get(pos..)?);

    Some(())
}

/// Hash the stable content of the image: every byte outside the regions
/// claimed by `patches`.
///
/// The CodeView signature deposited by the patch set is itself inside a
/// skipped region, so the result is a pure function of the bytes that
/// survive patching: two builds producing the same stable bytes produce
/// the same signature. Any 128-bit incremental hash satisfies that;
/// the driver uses MD5 for compatibility with prior tooling.
///
/// `patches` must already be sorted.
pub fn content_digest(
    data: &[u8],
    patches: &PatchSet,
    digest: &mut dyn Update,
) -> Result<(), Error> {
    if !patches.is_sorted() {
        return Err(Error::InvalidImage("patch set not sorted"));
    }
    content_digest_impl(data, patches, digest)
        .ok_or(Error::InvalidImage("patch out of bounds"))
}
