// Copyright 2024 the restamp authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Make a PE image and its PDB byte-for-byte reproducible.
///
/// Rewrites the link-time timestamps and the PE-to-PDB GUID in place
/// with deterministic values derived from the image's own content.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// The PE image (EXE or DLL) to patch in place.
    image: PathBuf,

    /// The PDB paired with the image; rewritten so the two files stay
    /// linked.
    pdb: Option<PathBuf>,

    /// Plan and report the patches without modifying either file.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: &Cli) -> Result<()> {
    restamp::patch_image(&cli.image, cli.pdb.as_deref(), cli.dry_run)?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .target(env_logger::Target::Stderr)
        .init();

    run(&cli)
}
