use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use url::Url;

pub const DEFAULT_LAYER_CACHE: &str = "/var/lib/sqimg/layer-cache";
pub const DEFAULT_MKSQUASHFS: &str = "mksquashfs";
pub const DEFAULT_BLOBSTORE_URL: &str = "http://blobstore.discoverd";
pub const DEFAULT_CONTROLLER_URL: &str = "http://controller.discoverd";
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) cache: CacheConfig,
    pub(crate) packager: PackagerConfig,
    pub(crate) blobstore: BlobStoreConfig,
    pub(crate) registry: RegistryConfig,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error when a URL or retry count cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let connect_attempts = match snapshot.var("SQIMG_UPLOAD_CONNECT_RETRIES") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    anyhow!("SQIMG_UPLOAD_CONNECT_RETRIES must be a positive integer, got {raw:?}")
                })?,
            None => DEFAULT_CONNECT_ATTEMPTS,
        };
        Ok(Self {
            cache: CacheConfig {
                root: PathBuf::from(
                    snapshot
                        .var("SQIMG_LAYER_CACHE")
                        .unwrap_or(DEFAULT_LAYER_CACHE),
                ),
            },
            packager: PackagerConfig {
                program: snapshot
                    .var("SQIMG_MKSQUASHFS")
                    .unwrap_or(DEFAULT_MKSQUASHFS)
                    .to_string(),
            },
            blobstore: BlobStoreConfig {
                base_url: parse_url(
                    "SQIMG_BLOBSTORE_URL",
                    snapshot
                        .var("SQIMG_BLOBSTORE_URL")
                        .unwrap_or(DEFAULT_BLOBSTORE_URL),
                )?,
                connect_attempts,
            },
            registry: RegistryConfig {
                base_url: parse_url(
                    "SQIMG_CONTROLLER_URL",
                    snapshot
                        .var("SQIMG_CONTROLLER_URL")
                        .unwrap_or(DEFAULT_CONTROLLER_URL),
                )?,
                key: snapshot.var("SQIMG_CONTROLLER_KEY").map(ToOwned::to_owned),
            },
        })
    }

    #[must_use]
    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    #[must_use]
    pub fn packager(&self) -> &PackagerConfig {
        &self.packager
    }

    #[must_use]
    pub fn blobstore(&self) -> &BlobStoreConfig {
        &self.blobstore
    }

    #[must_use]
    pub fn registry(&self) -> &RegistryConfig {
        &self.registry
    }

    /// Replace the layer cache root, e.g. from a command-line flag.
    #[must_use]
    pub fn with_cache_root(mut self, root: PathBuf) -> Self {
        self.cache.root = root;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PackagerConfig {
    pub program: String,
}

#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    pub base_url: Url,
    pub connect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: Url,
    pub key: Option<String>,
}

fn parse_url(key: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).with_context(|| format!("{key} is not a valid URL: {raw:?}"))
}
