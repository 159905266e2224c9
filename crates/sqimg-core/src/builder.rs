use anyhow::Result;
use sqimg_domain::{
    assemble_manifest, resolve_chains, Grouping, ImageLayer, ImageManifest, LayerChain,
};
use tracing::{debug, info};

use crate::cache::LayerCache;
use crate::provider::DiffProvider;
use crate::squashfs::{FilesystemPackager, SquashfsPackager};

/// Builds image manifests from a diff provider, one cached squashfs layer per
/// resolved chain.
pub struct Builder<'a> {
    cache: &'a LayerCache,
    provider: &'a dyn DiffProvider,
    packager: &'a dyn FilesystemPackager,
}

impl<'a> Builder<'a> {
    pub fn new(
        cache: &'a LayerCache,
        provider: &'a dyn DiffProvider,
        packager: &'a dyn FilesystemPackager,
    ) -> Self {
        Self {
            cache,
            provider,
            packager,
        }
    }

    /// Build the manifest of image `name`. Layers appear in chain order,
    /// bottom layer first, and carry no URL yet.
    ///
    /// # Errors
    ///
    /// Provider, cache and packaging failures are returned unchanged.
    pub fn build(&self, name: &str, grouping: Grouping) -> Result<ImageManifest> {
        let config = self.provider.lookup_image(name)?;
        let history = self.provider.history(name)?;
        let chains = resolve_chains(&history, grouping);
        info!(image = name, diffs = history.len(), layers = chains.len(), "building image");

        let layers = chains
            .iter()
            .map(|chain| self.create_layer(chain, grouping))
            .collect::<Result<Vec<_>>>()?;
        Ok(assemble_manifest(&config, layers))
    }

    /// The layer for one chain, from the cache when it was built before under
    /// the same grouping.
    ///
    /// # Errors
    ///
    /// Returns lease, record and packaging failures.
    pub fn create_layer(&self, chain: &LayerChain, grouping: Grouping) -> Result<ImageLayer> {
        let chain_id = chain.chain_id();
        debug!(%chain_id, diffs = chain.len(), "creating layer");
        self.cache.get_or_build(grouping, chain_id, || {
            SquashfsPackager::new(self.cache, self.packager).package_chain(self.provider, chain)
        })
    }
}
