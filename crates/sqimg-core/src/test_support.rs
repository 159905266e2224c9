use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use sqimg_domain::{DiffRecord, ImageConfig};
use walkdir::WalkDir;

use crate::error::BuildError;
use crate::provider::DiffProvider;
use crate::squashfs::FilesystemPackager;

/// An uncompressed tar holding `files` as regular files.
pub(crate) fn tar_bytes(files: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, contents.as_bytes())?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, body)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[derive(Default)]
pub(crate) struct MemoryProvider {
    images: HashMap<String, (ImageConfig, Vec<DiffRecord>)>,
    diffs: HashMap<String, Vec<u8>>,
}

impl MemoryProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_image(
        mut self,
        name: &str,
        config: ImageConfig,
        history: Vec<DiffRecord>,
    ) -> Self {
        self.images.insert(name.to_string(), (config, history));
        self
    }

    pub(crate) fn with_diff(mut self, id: &str, tar: Vec<u8>) -> Self {
        self.diffs.insert(id.to_string(), tar);
        self
    }

    fn image(&self, name: &str) -> Result<&(ImageConfig, Vec<DiffRecord>)> {
        self.images.get(name).ok_or_else(|| {
            BuildError::ImageNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }
}

impl DiffProvider for MemoryProvider {
    fn lookup_image(&self, name: &str) -> Result<ImageConfig> {
        Ok(self.image(name)?.0.clone())
    }

    fn history(&self, name: &str) -> Result<Vec<DiffRecord>> {
        Ok(self.image(name)?.1.clone())
    }

    fn diff(&self, id: &str) -> Result<Box<dyn Read + Send + '_>> {
        let bytes = self
            .diffs
            .get(id)
            .ok_or_else(|| BuildError::UnknownDiff { id: id.to_string() })?;
        Ok(Box::new(&bytes[..]))
    }
}

/// In-process stand-in for mksquashfs: the image is every relative path and
/// file body of the tree in sorted order, so equal trees give equal bytes.
#[derive(Default)]
pub(crate) struct CountingPackager {
    calls: AtomicUsize,
}

impl CountingPackager {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FilesystemPackager for CountingPackager {
    fn package(&self, source: &Path, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = fs::File::create(dest)?;
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .context("walked outside the source tree")?;
            writeln!(out, "{}", relative.display())?;
            if entry.file_type().is_file() {
                out.write_all(&fs::read(entry.path())?)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }
}
