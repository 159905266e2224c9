//! End-to-end pipelines: build or package, upload, register.
//!
//! Nothing is registered unless every layer and the manifest were uploaded
//! first, so a failure at any step leaves no artifact behind.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use sqimg_domain::{
    Artifact, ArtifactType, Grouping, ImageEntrypoint, ImageLayer, ImageManifest,
    ImageManifestType, ImagePlatform, ImageRootfs, DEFAULT_ENTRYPOINT,
};
use tracing::info;
use url::Url;

use crate::builder::Builder;
use crate::cache::LayerCache;
use crate::error::BuildError;
use crate::provider::DockerArchive;
use crate::registry::ArtifactRegistry;
use crate::squashfs::{FilesystemPackager, SquashfsPackager};
use crate::upload::{BlobStore, ContentKind, Uploader};

pub const LAYERS_NAMESPACE: &str = "layers";
pub const IMAGES_NAMESPACE: &str = "images";
pub const IMPORT_PREFIX: &str = "docker";
pub const SLUG_PREFIX: &str = "slugs";

const SLUG_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// The collaborators every pipeline needs.
pub struct Services<'a> {
    pub cache: &'a LayerCache,
    pub packager: &'a dyn FilesystemPackager,
    pub blobstore: &'a dyn BlobStore,
    pub blobstore_url: &'a Url,
    pub registry: &'a dyn ArtifactRegistry,
}

impl<'a> Services<'a> {
    fn uploader(&self, prefix: &str) -> Uploader<'a> {
        Uploader::new(self.blobstore, self.blobstore_url.clone(), prefix)
    }
}

/// Upload every layer of `manifest` that has no URL yet from the cache's blob
/// storage, then the manifest itself. Returns the manifest URL.
///
/// # Errors
///
/// Fails on the first rejected upload, before the manifest is sent.
pub fn publish_manifest(
    uploader: &Uploader<'_>,
    cache: &LayerCache,
    manifest: &mut ImageManifest,
) -> Result<Url> {
    for layer in manifest.layers_mut() {
        if layer.url.is_some() {
            continue;
        }
        let sha512 = layer
            .sha512()
            .ok_or_else(|| anyhow!("layer has no sha512 hash"))?
            .to_string();
        let url = uploader.upload_file(
            LAYERS_NAMESPACE,
            &cache.blob_path(&sha512),
            &sha512,
            ContentKind::Squashfs,
        )?;
        layer.url = Some(url.to_string());
    }
    let bytes = manifest.to_bytes()?;
    uploader.upload_bytes(IMAGES_NAMESPACE, &bytes, ContentKind::Manifest)
}

/// Build image `name` from a `docker save` archive with one layer per diff,
/// publish it under the import prefix and register it.
///
/// # Errors
///
/// Returns the first build, upload or registry failure.
pub fn import_image(
    services: &Services<'_>,
    archive: &DockerArchive,
    name: &str,
) -> Result<Artifact> {
    let digest = archive.image_digest(name)?;
    let mut manifest = Builder::new(services.cache, archive, services.packager)
        .build(name, Grouping::EachDiff)?;
    let uri = publish_manifest(&services.uploader(IMPORT_PREFIX), services.cache, &mut manifest)?;

    let artifact = Artifact {
        id: String::new(),
        kind: ArtifactType::Image,
        uri: uri.to_string(),
        meta: BTreeMap::from([
            ("blobstore".to_string(), "true".to_string()),
            ("import.repository".to_string(), repository(name).to_string()),
            ("import.digest".to_string(), digest),
        ]),
        manifest,
    };
    services.registry.create_artifact(&artifact)
}

#[derive(Debug)]
pub struct SlugOutcome {
    pub artifact: Artifact,
    pub slug: ImageLayer,
}

/// Package `dir` as a slug layer on top of the runner artifact's layers and
/// register the result.
///
/// # Errors
///
/// Returns packaging, upload and registry failures, and
/// [`BuildError::MissingRootfs`] when the runner has no layers to extend.
pub fn publish_slug(
    services: &Services<'_>,
    dir: &Path,
    runner_artifact: &str,
    artifact_id: Option<&str>,
) -> Result<SlugOutcome> {
    let runner = services.registry.get_artifact(runner_artifact)?;
    let mut layers = runner
        .manifest
        .rootfs
        .first()
        .map(|rootfs| rootfs.layers.clone())
        .ok_or_else(|| BuildError::MissingRootfs {
            artifact: runner_artifact.to_string(),
        })?;

    let slug = SquashfsPackager::new(services.cache, services.packager).package_dir(dir)?;
    info!(
        sha512 = slug.sha512().unwrap_or_default(),
        length = slug.length,
        "packaged slug"
    );
    layers.push(slug);

    let mut manifest = slug_manifest(layers);
    let uri = publish_manifest(&services.uploader(SLUG_PREFIX), services.cache, &mut manifest)?;
    let slug = manifest.layers().last().cloned().unwrap_or_default();

    let artifact = Artifact {
        id: artifact_id.unwrap_or_default().to_string(),
        kind: ArtifactType::Image,
        uri: uri.to_string(),
        meta: BTreeMap::from([("blobstore".to_string(), "true".to_string())]),
        manifest,
    };
    let artifact = services.registry.create_artifact(&artifact)?;
    Ok(SlugOutcome { artifact, slug })
}

/// Manifest that runs a slug with the runner's init in `/app`.
pub fn slug_manifest(layers: Vec<ImageLayer>) -> ImageManifest {
    let entrypoint = ImageEntrypoint {
        working_dir: "/app".to_string(),
        env: BTreeMap::from([
            ("PATH".to_string(), SLUG_PATH.to_string()),
            ("TERM".to_string(), "xterm".to_string()),
            ("HOME".to_string(), "/app".to_string()),
        ]),
        args: vec!["/runner/init".to_string(), "bash".to_string()],
    };
    ImageManifest {
        kind: ImageManifestType::V1,
        entrypoints: BTreeMap::from([(DEFAULT_ENTRYPOINT.to_string(), entrypoint)]),
        rootfs: vec![ImageRootfs {
            platform: ImagePlatform::default(),
            layers,
        }],
    }
}

/// Image name without its tag: `redis:7` and `redis` both give `redis`, while
/// a registry port (`host:5000/app`) is kept.
fn repository(name: &str) -> &str {
    match name.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => name,
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    fn format_scaled(value: u64, unit: u64, suffix: &str) -> String {
        let whole = value / unit;
        let remainder = value % unit;
        let tenths = (remainder * 10) / unit;
        format!("{whole}.{tenths} {suffix}")
    }

    if bytes >= GB {
        format_scaled(bytes, GB, "GB")
    } else if bytes >= MB {
        format_scaled(bytes, MB, "MB")
    } else if bytes >= KB {
        format_scaled(bytes, KB, "KB")
    } else {
        format!("{bytes} B")
    }
}
