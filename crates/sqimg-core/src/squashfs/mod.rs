//! Turning diffs and directories into content-addressed squashfs blobs.

mod apply;

use std::ffi::OsStr;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqimg_domain::{ImageLayer, LayerChain};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, warn};

use crate::cache::LayerCache;
use crate::error::BuildError;
use crate::hash::digest_reader;
use crate::process::run_combined;
use crate::provider::DiffProvider;

pub use apply::apply_diff;

/// Packs a directory tree into a single filesystem image file.
pub trait FilesystemPackager: Send + Sync {
    /// Write an image of `source` to `dest`, replacing whatever is there.
    fn package(&self, source: &Path, dest: &Path) -> Result<()>;
}

/// The external `mksquashfs` tool.
#[derive(Clone, Debug)]
pub struct MkSquashfs {
    program: String,
}

impl MkSquashfs {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.program)
            .with_context(|| format!("packaging tool {} not found", self.program))
    }
}

impl FilesystemPackager for MkSquashfs {
    fn package(&self, source: &Path, dest: &Path) -> Result<()> {
        let program = self.resolve()?;
        let program = program.to_string_lossy();
        debug!(%program, source = %source.display(), dest = %dest.display(), "running packager");
        let result = run_combined(
            &program,
            [source.as_os_str(), dest.as_os_str(), OsStr::new("-noappend")],
        )?;
        if !result.status.success() {
            return Err(BuildError::PackagerFailed {
                program: self.program.clone(),
                status: result.status,
                output: result.output,
            }
            .into());
        }
        Ok(())
    }
}

/// Packages chains of diffs, or plain directories, into the blob storage of a
/// [`LayerCache`].
pub struct SquashfsPackager<'a> {
    cache: &'a LayerCache,
    packager: &'a dyn FilesystemPackager,
}

impl<'a> SquashfsPackager<'a> {
    pub fn new(cache: &'a LayerCache, packager: &'a dyn FilesystemPackager) -> Self {
        Self { cache, packager }
    }

    /// Apply every diff of `chain` in order to a fresh directory and package
    /// the result. The extraction directory is removed on every path.
    ///
    /// # Errors
    ///
    /// Diff fetch and apply failures abort before the packaging tool runs.
    pub fn package_chain(
        &self,
        provider: &dyn DiffProvider,
        chain: &LayerChain,
    ) -> Result<ImageLayer> {
        let scratch = self.cache.scratch_dir();
        let extract = TempDir::with_prefix_in("layer-", &scratch)
            .with_context(|| format!("failed to create extraction dir in {}", scratch.display()))?;
        let result = self.extract_and_package(provider, chain, extract.path());
        let path = extract.path().to_path_buf();
        if let Err(err) = extract.close() {
            warn!(path = %path.display(), %err, "failed to remove extraction dir");
        }
        result
    }

    fn extract_and_package(
        &self,
        provider: &dyn DiffProvider,
        chain: &LayerChain,
        dir: &Path,
    ) -> Result<ImageLayer> {
        for id in chain.ids() {
            debug!(%id, "applying diff");
            let reader = provider.diff(id)?;
            apply_diff(reader, dir).with_context(|| format!("failed to apply diff {id}"))?;
        }
        self.package_dir(dir)
    }

    /// Package `dir` as is and move the image into blob storage under its
    /// sha512.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::PackagerFailed`] when the tool exits non-zero, or
    /// an I/O error from hashing or storing the image.
    pub fn package_dir(&self, dir: &Path) -> Result<ImageLayer> {
        let scratch = self.cache.scratch_dir();
        let temp = NamedTempFile::with_prefix_in("squashfs-", &scratch)
            .with_context(|| format!("failed to create temp file in {}", scratch.display()))?;
        self.packager.package(dir, temp.path())?;

        let mut reader = BufReader::new(
            File::open(temp.path())
                .with_context(|| format!("failed to open {}", temp.path().display()))?,
        );
        let digest = digest_reader(&mut reader)
            .with_context(|| format!("failed to hash {}", temp.path().display()))?;
        drop(reader);

        let blob = self.cache.blob_path(&digest.sha512);
        match temp.persist_noclobber(&blob) {
            Ok(_) => {}
            Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(blob = %blob.display(), "identical blob already stored");
            }
            Err(err) => {
                return Err(err.error)
                    .with_context(|| format!("failed to store blob {}", blob.display()))
            }
        }
        debug!(sha512 = %digest.sha512, length = digest.length, "packaged layer");
        Ok(ImageLayer::squashfs(digest.length, digest.sha512))
    }
}
