use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqimg_domain::{DiffRecord, ImageConfig};
use tempfile::TempDir;
use tracing::debug;

use super::DiffProvider;
use crate::error::BuildError;

const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    config: Option<ContainerConfig>,
    #[serde(default)]
    rootfs: Option<RootFs>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfig {
    #[serde(rename = "Env", default)]
    env: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    working_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

#[derive(Debug)]
struct ArchivedImage {
    digest: String,
    repo_tags: Vec<String>,
    config: ImageConfig,
    chain_ids: Vec<String>,
}

/// Diff provider over the output of `docker save`.
///
/// Diff ids are OCI chain ids, so an id names a layer together with every
/// layer below it. A diff is tagged with the repo tags of each image in the
/// archive whose top layer it is.
#[derive(Debug)]
pub struct DockerArchive {
    root: PathBuf,
    images: Vec<ArchivedImage>,
    layers: HashMap<String, PathBuf>,
    tags: HashMap<String, BTreeSet<String>>,
    _unpacked: Option<TempDir>,
}

impl DockerArchive {
    /// Open a `docker save` tarball (unpacked into a temporary directory owned
    /// by the provider) or an already unpacked archive directory.
    pub fn open(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("failed to read image archive {}", path.display()))?;
        if metadata.is_dir() {
            return Self::from_dir(path.to_path_buf(), None);
        }
        let unpacked = tempfile::Builder::new()
            .prefix("docker-archive-")
            .tempdir()
            .context("failed to create archive scratch directory")?;
        let file = File::open(path)
            .with_context(|| format!("failed to open image archive {}", path.display()))?;
        tar::Archive::new(file)
            .unpack(unpacked.path())
            .with_context(|| format!("failed to unpack image archive {}", path.display()))?;
        debug!(archive = %path.display(), dir = %unpacked.path().display(), "unpacked image archive");
        Self::from_dir(unpacked.path().to_path_buf(), Some(unpacked))
    }

    fn from_dir(root: PathBuf, unpacked: Option<TempDir>) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILENAME);
        let contents = fs::read(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let entries: Vec<ManifestEntry> = serde_json::from_slice(&contents)
            .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

        let mut images = Vec::with_capacity(entries.len());
        let mut layers = HashMap::new();
        let mut tags: HashMap<String, BTreeSet<String>> = HashMap::new();
        for entry in entries {
            let config_path = root.join(&entry.config);
            let config_bytes = fs::read(&config_path)
                .with_context(|| format!("failed to read image config {}", config_path.display()))?;
            let parsed: ConfigFile = serde_json::from_slice(&config_bytes).with_context(|| {
                format!("failed to parse image config {}", config_path.display())
            })?;
            let diff_ids = parsed.rootfs.map(|rootfs| rootfs.diff_ids).unwrap_or_default();

            let mut chain_ids: Vec<String> = Vec::with_capacity(entry.layers.len());
            for (index, layer) in entry.layers.iter().enumerate() {
                let layer_path = root.join(layer);
                let diff_id = match diff_ids.get(index) {
                    Some(diff_id) => diff_id.clone(),
                    None => sha256_file(&layer_path)?,
                };
                let chain_id = match chain_ids.last() {
                    Some(parent) => chain_id(parent, &diff_id),
                    None => diff_id,
                };
                layers.insert(chain_id.clone(), layer_path);
                chain_ids.push(chain_id);
            }

            let repo_tags = entry.repo_tags.unwrap_or_default();
            if let Some(top) = chain_ids.last() {
                tags.entry(top.clone())
                    .or_default()
                    .extend(repo_tags.iter().cloned());
            }
            let config = parsed.config.unwrap_or_default();
            images.push(ArchivedImage {
                digest: format!("sha256:{}", hex::encode(Sha256::digest(&config_bytes))),
                repo_tags,
                config: ImageConfig {
                    entrypoint: config.entrypoint.unwrap_or_default(),
                    cmd: config.cmd.unwrap_or_default(),
                    env: config.env.unwrap_or_default(),
                    working_dir: config.working_dir.unwrap_or_default(),
                },
                chain_ids,
            });
        }

        Ok(Self {
            root,
            images,
            layers,
            tags,
            _unpacked: unpacked,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Digest of the image configuration, the image's identity.
    pub fn image_digest(&self, name: &str) -> Result<String> {
        Ok(self.find(name)?.digest.clone())
    }

    fn find(&self, name: &str) -> Result<&ArchivedImage> {
        let tagged = if has_tag(name) {
            None
        } else {
            Some(format!("{name}:latest"))
        };
        self.images
            .iter()
            .find(|image| {
                image.repo_tags.iter().any(|tag| {
                    tag == name || tagged.as_deref().is_some_and(|tagged| tag == tagged)
                }) || image.digest == name
                    || image.digest.strip_prefix("sha256:") == Some(name)
            })
            .ok_or_else(|| {
                BuildError::ImageNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }
}

impl DiffProvider for DockerArchive {
    fn lookup_image(&self, name: &str) -> Result<ImageConfig> {
        Ok(self.find(name)?.config.clone())
    }

    fn history(&self, name: &str) -> Result<Vec<DiffRecord>> {
        let image = self.find(name)?;
        Ok(image
            .chain_ids
            .iter()
            .map(|id| DiffRecord {
                id: id.clone(),
                tags: self.tags.get(id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    fn diff(&self, id: &str) -> Result<Box<dyn Read + Send + '_>> {
        let path = self.layers.get(id).ok_or_else(|| BuildError::UnknownDiff {
            id: id.to_string(),
        })?;
        let file =
            File::open(path).with_context(|| format!("failed to open layer {}", path.display()))?;
        Ok(Box::new(file))
    }
}

fn has_tag(name: &str) -> bool {
    let last = name.rsplit('/').next().unwrap_or(name);
    last.contains(':') || name.contains('@')
}

fn chain_id(parent: &str, diff_id: &str) -> String {
    format!(
        "sha256:{}",
        hex::encode(Sha256::digest(format!("{parent} {diff_id}").as_bytes()))
    )
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open layer {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read layer {}", path.display()))?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
