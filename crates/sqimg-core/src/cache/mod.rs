//! On-disk layer cache shared by every build process on the host.
//!
//! ```text
//! <root>/layers/<grouping>/<chain>.json  metadata record (serialized ImageLayer)
//! <root>/blobs/<sha512>.squashfs          packaged layer, keyed by content
//! <root>/locks/<grouping>/<chain>.lock    present only while a build holds the lease
//! <root>/tmp/                             extraction directories and partial blobs
//! ```
//!
//! A chain is named by its newest diff, so the same name covers different
//! diffs under each grouping policy. Records and leases are therefore kept
//! per policy (`by-tag`, `each-diff`); blobs are shared since they are
//! addressed by content.
//!
//! A record's existence is the only validity signal. Records are not checked
//! against their blob when read.

mod lease;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqimg_domain::{Grouping, ImageLayer};
use tempfile::NamedTempFile;
use tracing::debug;

pub use lease::Lease;

const LAYERS_DIR: &str = "layers";
const BLOBS_DIR: &str = "blobs";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";

#[derive(Clone, Debug)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    /// Open (creating if needed) the cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error when the cache directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let cache = Self { root: root.into() };
        let mut dirs = vec![cache.root.join(BLOBS_DIR), cache.root.join(TMP_DIR)];
        for grouping in [Grouping::ByTag, Grouping::EachDiff] {
            dirs.push(cache.records_dir(grouping));
            dirs.push(cache.leases_dir(grouping));
        }
        for path in dirs {
            fs::create_dir_all(&path)
                .with_context(|| format!("failed to create cache directory {}", path.display()))?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records_dir(&self, grouping: Grouping) -> PathBuf {
        self.root.join(LAYERS_DIR).join(grouping.as_str())
    }

    fn leases_dir(&self, grouping: Grouping) -> PathBuf {
        self.root.join(LOCKS_DIR).join(grouping.as_str())
    }

    pub fn record_path(&self, grouping: Grouping, chain_id: &str) -> PathBuf {
        self.records_dir(grouping)
            .join(format!("{}.json", key_filename(chain_id)))
    }

    pub fn lease_path(&self, grouping: Grouping, chain_id: &str) -> PathBuf {
        self.leases_dir(grouping)
            .join(format!("{}.lock", key_filename(chain_id)))
    }

    pub fn blob_path(&self, sha512: &str) -> PathBuf {
        self.root.join(BLOBS_DIR).join(format!("{sha512}.squashfs"))
    }

    /// Directory for scratch files that may later be renamed into the cache.
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(TMP_DIR)
    }

    /// Read the record for `chain_id` under `grouping` without taking its
    /// lease.
    ///
    /// # Errors
    ///
    /// Returns an error when a record exists but cannot be read or decoded.
    pub fn lookup(&self, grouping: Grouping, chain_id: &str) -> Result<Option<ImageLayer>> {
        let path = self.record_path(grouping, chain_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to open layer record {}", path.display()))
            }
        };
        let layer = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to decode layer record {}", path.display()))?;
        Ok(Some(layer))
    }

    /// Return the cached layer for `chain_id`, running `build` only when no
    /// record exists. The whole check, build and persist sequence runs under
    /// the chain's lease, so at most one build per chain is in flight across
    /// all processes sharing this cache.
    ///
    /// # Errors
    ///
    /// Propagates lease, record and `build` failures. A failed build leaves no
    /// record behind.
    pub fn get_or_build<F>(
        &self,
        grouping: Grouping,
        chain_id: &str,
        build: F,
    ) -> Result<ImageLayer>
    where
        F: FnOnce() -> Result<ImageLayer>,
    {
        let grouping_name = grouping.as_str();
        let _lease = Lease::acquire(&self.lease_path(grouping, chain_id))?;
        if let Some(layer) = self.lookup(grouping, chain_id)? {
            debug!(%chain_id, grouping = grouping_name, "layer cache hit");
            return Ok(layer);
        }
        debug!(%chain_id, grouping = grouping_name, "layer cache miss");
        let layer = build()?;
        self.persist(grouping, chain_id, &layer)?;
        Ok(layer)
    }

    fn persist(&self, grouping: Grouping, chain_id: &str, layer: &ImageLayer) -> Result<()> {
        let path = self.record_path(grouping, chain_id);
        let dir = self.records_dir(grouping);
        let temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("failed to create record in {}", dir.display()))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, layer)
                .with_context(|| format!("failed to encode layer record {}", path.display()))?;
            writer
                .flush()
                .with_context(|| format!("failed to write layer record {}", path.display()))?;
        }
        temp.persist(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to persist layer record {}", path.display()))?;
        Ok(())
    }
}

/// Cache keys are digests like `sha256:<hex>`, stored as `sha256_<hex>`.
/// Keys that already contain `_`, or that would not be a safe file name, are
/// hashed, so two distinct keys never share a file.
fn key_filename(key: &str) -> String {
    let safe = !key.is_empty()
        && !key.starts_with('.')
        && key.bytes().all(|b| {
            matches!(
                b,
                b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b':'
            )
        });
    if safe {
        key.replace(':', "_")
    } else {
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}
