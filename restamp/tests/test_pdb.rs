// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod common;

use common::*;
use restamp::{
    patch_image, Error, Msf, PdbHeader70, PDB_HEADER_STREAM,
    PDB_OLD_DIRECTORY_STREAM, PDB_VERSION_VC70, REPRO_TIMESTAMP,
};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    image: PathBuf,
    pdb: PathBuf,
}

impl Fixture {
    fn new(image: &[u8], pdb: &[u8]) -> Self {
        let dir = TempDir::new().unwrap();
        let image_path = dir.path().join("test.dll");
        let pdb_path = dir.path().join("test.pdb");
        fs::write(&image_path, image).unwrap();
        fs::write(&pdb_path, pdb).unwrap();
        Self {
            _dir: dir,
            image: image_path,
            pdb: pdb_path,
        }
    }

    fn tmp_pdb(&self) -> PathBuf {
        let mut path = self.pdb.as_os_str().to_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }
}

fn image_with_codeview() -> Vec<u8> {
    PeBuilder::new()
        .export()
        .debug_entry(DebugEntrySpec::codeview(0x9999_AAAA))
        .build()
}

fn parse_pdb_header(pdb_bytes: &[u8]) -> (Msf, PdbHeader70) {
    let msf = Msf::parse(pdb_bytes).unwrap();
    let header =
        PdbHeader70::parse(msf.stream(PDB_HEADER_STREAM).unwrap()).unwrap();
    (msf, header)
}

#[test]
fn test_pe_and_pdb_rewritten_in_lockstep() {
    let fixture =
        Fixture::new(&image_with_codeview(), &build_pdb(TEST_GUID, TEST_AGE));

    patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap();

    let image = fs::read(&fixture.image).unwrap();
    assert_eq!(u32_at(&image, COFF_TIMESTAMP_OFFSET), REPRO_TIMESTAMP);
    assert_eq!(u32_at(&image, CV_AGE_OFFSET), 1);
    let signature = &image[CV_GUID_OFFSET..CV_GUID_OFFSET + 16];

    let pdb_bytes = fs::read(&fixture.pdb).unwrap();
    let (msf, header) = parse_pdb_header(&pdb_bytes);

    // PDB binding: signature and age now match the patched image.
    assert_eq!(&header.guid[..], signature);
    assert_eq!(header.age, 1);
    assert_eq!(header.timestamp, REPRO_TIMESTAMP);
    assert_eq!(header.version, PDB_VERSION_VC70);

    // The old directory stream is emptied, other streams and the
    // named-stream bytes after the header survive untouched.
    assert_eq!(msf.stream(PDB_OLD_DIRECTORY_STREAM), Some(&[][..]));
    assert_eq!(msf.stream(2), Some(&[0xEE; 700][..]));
    let header_stream = msf.stream(PDB_HEADER_STREAM).unwrap();
    assert_eq!(&header_stream[28..], NAMED_STREAM_TAIL);

    // The temp file was renamed over the original.
    assert!(!fixture.tmp_pdb().exists());
}

#[test]
fn test_dry_run_modifies_nothing() {
    let image = image_with_codeview();
    let pdb = build_pdb(TEST_GUID, TEST_AGE);
    let fixture = Fixture::new(&image, &pdb);

    patch_image(&fixture.image, Some(&fixture.pdb), true).unwrap();

    assert_eq!(fs::read(&fixture.image).unwrap(), image);
    assert_eq!(fs::read(&fixture.pdb).unwrap(), pdb);
    assert!(!fixture.tmp_pdb().exists());
}

#[test]
fn test_mismatched_pdb_rejected() {
    let image = image_with_codeview();
    let mut wrong_guid = TEST_GUID;
    wrong_guid[0] ^= 0xFF;
    let pdb = build_pdb(wrong_guid, TEST_AGE);
    let fixture = Fixture::new(&image, &pdb);

    let err =
        patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidPdb(msg) if msg.contains("do not match")
    ));

    // Neither file was modified.
    assert_eq!(fs::read(&fixture.image).unwrap(), image);
    assert_eq!(fs::read(&fixture.pdb).unwrap(), pdb);
}

#[test]
fn test_mismatched_age_rejected() {
    let fixture = Fixture::new(
        &image_with_codeview(),
        &build_pdb(TEST_GUID, TEST_AGE + 1),
    );

    let err =
        patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidPdb(msg) if msg.contains("do not match")
    ));
}

#[test]
fn test_old_pdb_version_rejected() {
    let fixture = Fixture::new(
        &image_with_codeview(),
        &build_pdb_with_version(19990604, TEST_GUID, TEST_AGE),
    );

    let err =
        patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidPdb(msg) if msg.contains("implementation version")
    ));
}

#[test]
fn test_image_without_codeview_rejects_pdb() {
    let image = PeBuilder::new().export().build();
    let pdb = build_pdb(TEST_GUID, TEST_AGE);
    let fixture = Fixture::new(&image, &pdb);

    let err =
        patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap_err();
    assert!(matches!(err, Error::InvalidPdb(_)));
    assert_eq!(fs::read(&fixture.image).unwrap(), image);
}

#[test]
fn test_missing_pdb_file() {
    let image = image_with_codeview();
    let fixture = Fixture::new(&image, b"placeholder");
    fs::remove_file(&fixture.pdb).unwrap();

    let err =
        patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(fs::read(&fixture.image).unwrap(), image);
}

#[test]
fn test_garbage_pdb_rejected() {
    let fixture =
        Fixture::new(&image_with_codeview(), b"this is not a pdb file");

    let err =
        patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap_err();
    assert!(matches!(err, Error::InvalidPdb(_)));
}

#[test]
fn test_end_to_end_idempotence() {
    let fixture =
        Fixture::new(&image_with_codeview(), &build_pdb(TEST_GUID, TEST_AGE));

    patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap();
    let image_once = fs::read(&fixture.image).unwrap();
    let pdb_once = fs::read(&fixture.pdb).unwrap();

    // A second run sees the patched CodeView record and the rewritten
    // PDB header, which still match, and deposits identical bytes.
    patch_image(&fixture.image, Some(&fixture.pdb), false).unwrap();

    assert_eq!(fs::read(&fixture.image).unwrap(), image_once);
    assert_eq!(fs::read(&fixture.pdb).unwrap(), pdb_once);
}

#[test]
fn test_end_to_end_determinism() {
    let image = image_with_codeview();
    let pdb = build_pdb(TEST_GUID, TEST_AGE);

    let first = Fixture::new(&image, &pdb);
    let second = Fixture::new(&image, &pdb);

    patch_image(&first.image, Some(&first.pdb), false).unwrap();
    patch_image(&second.image, Some(&second.pdb), false).unwrap();

    assert_eq!(
        fs::read(&first.image).unwrap(),
        fs::read(&second.image).unwrap()
    );
    assert_eq!(
        fs::read(&first.pdb).unwrap(),
        fs::read(&second.pdb).unwrap()
    );
}
