use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpack one diff on top of `dest`. Entries already present are overwritten,
/// so applying diffs in order leaves the newest version of every path.
///
/// Plain and gzip-compressed tar streams are accepted. Whiteout entries
/// (`.wh.<name>`, `.wh..wh..opq`) are not interpreted: they land in the tree as
/// ordinary files and the paths they mark as deleted are kept.
pub fn apply_diff(reader: impl Read, dest: &Path) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let compressed = reader
        .fill_buf()
        .context("failed to read diff stream")?
        .starts_with(&GZIP_MAGIC);
    let stream: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    let mut archive = tar::Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .with_context(|| format!("failed to apply diff to {}", dest.display()))
}
