//! Sources of image history and diff content.

use std::io::Read;

use anyhow::Result;
use sqimg_domain::{DiffRecord, ImageConfig};

mod docker_archive;

pub use docker_archive::DockerArchive;

/// Supplies image configuration, layer history and per-layer diff streams.
///
/// Calls block until the underlying I/O completes; there is no timeout.
pub trait DiffProvider: Send + Sync {
    fn lookup_image(&self, name: &str) -> Result<ImageConfig>;

    /// Layer history of `name`, oldest diff first.
    fn history(&self, name: &str) -> Result<Vec<DiffRecord>>;

    /// A tar stream holding the changes of diff `id` relative to its parent.
    fn diff(&self, id: &str) -> Result<Box<dyn Read + Send + '_>>;
}
