use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::env::parse_env;
use crate::image::ImageConfig;

/// Name of the entrypoint built from the source image configuration.
pub const DEFAULT_ENTRYPOINT: &str = "_default";

/// Hash algorithm key used in [`ImageLayer::hashes`].
pub const HASH_ALGORITHM: &str = "sha512";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageManifestType {
    #[default]
    #[serde(rename = "application/vnd.sqimg.image.manifest.v1+json")]
    V1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageLayerType {
    #[default]
    Squashfs,
}

/// A packaged filesystem layer.
///
/// The content address is the hash of the packaged blob, which in general
/// differs from the chain id the layer was cached under.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayer {
    #[serde(rename = "type")]
    pub kind: ImageLayerType,
    pub length: u64,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ImageLayer {
    pub fn squashfs(length: u64, sha512: impl Into<String>) -> Self {
        Self {
            kind: ImageLayerType::Squashfs,
            length,
            hashes: BTreeMap::from([(HASH_ALGORITHM.to_string(), sha512.into())]),
            url: None,
        }
    }

    /// The sha512 content address, when recorded.
    pub fn sha512(&self) -> Option<&str> {
        self.hashes.get(HASH_ALGORITHM).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntrypoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePlatform {
    pub architecture: String,
    pub os: String,
}

impl Default for ImagePlatform {
    fn default() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRootfs {
    pub platform: ImagePlatform,
    /// Bottom layer first.
    #[serde(default)]
    pub layers: Vec<ImageLayer>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "type")]
    pub kind: ImageManifestType,
    #[serde(default)]
    pub entrypoints: BTreeMap<String, ImageEntrypoint>,
    #[serde(default)]
    pub rootfs: Vec<ImageRootfs>,
}

impl ImageManifest {
    /// Canonical serialized form; the manifest's content address is computed
    /// over exactly these bytes.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Layers of the first rootfs entry.
    pub fn layers(&self) -> &[ImageLayer] {
        self.rootfs
            .first()
            .map(|rootfs| rootfs.layers.as_slice())
            .unwrap_or_default()
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut ImageLayer> {
        self.rootfs
            .iter_mut()
            .flat_map(|rootfs| rootfs.layers.iter_mut())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    #[default]
    Image,
}

/// A registered record pointing at a published manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ArtifactType,
    pub uri: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    pub manifest: ImageManifest,
}

/// Build the manifest for a resolved, ordered layer list.
///
/// The `_default` entrypoint runs the source entrypoint followed by the source
/// command, in the source working directory, with the parsed environment.
pub fn assemble_manifest(config: &ImageConfig, layers: Vec<ImageLayer>) -> ImageManifest {
    let args = config
        .entrypoint
        .iter()
        .chain(config.cmd.iter())
        .cloned()
        .collect();
    let entrypoint = ImageEntrypoint {
        working_dir: config.working_dir.clone(),
        env: parse_env(&config.env),
        args,
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
