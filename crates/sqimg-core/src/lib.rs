#![deny(clippy::all, warnings)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod process;
pub mod provider;
pub mod publish;
pub mod registry;
pub mod squashfs;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use builder::Builder;
pub use cache::{LayerCache, Lease};
pub use config::{Config, EnvSnapshot};
pub use error::BuildError;
pub use hash::{content_address, digest_reader, ContentDigest, HashingWriter};
pub use provider::{DiffProvider, DockerArchive};
pub use publish::{
    format_bytes, import_image, publish_manifest, publish_slug, slug_manifest, Services,
    SlugOutcome,
};
pub use registry::{ArtifactRegistry, ControllerClient};
pub use squashfs::{apply_diff, FilesystemPackager, MkSquashfs, SquashfsPackager};
pub use upload::{BlobStore, ContentKind, HttpBlobStore, Payload, Uploader};

pub use sqimg_domain as domain;
