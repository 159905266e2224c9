#![deny(clippy::all, warnings)]
#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

//! Data model and pure policies for squashfs image building.
//!
//! Nothing in this crate performs I/O: chain resolution, environment parsing
//! and manifest assembly are deterministic functions of their inputs.

pub mod env;
pub mod history;
pub mod image;
pub mod manifest;

pub use env::parse_env;
pub use history::{resolve_chains, DiffRecord, Grouping, LayerChain};
pub use image::ImageConfig;
pub use manifest::{
    assemble_manifest, Artifact, ArtifactType, ImageEntrypoint, ImageLayer, ImageLayerType,
    ImageManifest, ImageManifestType, ImagePlatform, ImageRootfs, DEFAULT_ENTRYPOINT,
    HASH_ALGORITHM,
};
