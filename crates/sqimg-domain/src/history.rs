use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One entry in an image's layer history, as supplied by a diff provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub id: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl DiffRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }
}

/// Diff ids whose cumulative content becomes one output layer, oldest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerChain {
    ids: Vec<String>,
}

impl LayerChain {
    /// Returns `None` for an empty id list; every chain holds at least one diff.
    pub fn new(ids: Vec<String>) -> Option<Self> {
        if ids.is_empty() {
            None
        } else {
            Some(Self { ids })
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// The memoization key for this chain: its most recent diff id.
    ///
    /// This is an input identity. It is unrelated to the content address of
    /// the layer the chain produces.
    pub fn chain_id(&self) -> &str {
        // `new` rejects empty chains
        self.ids.last().map_or("", String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// How diffs are grouped into output layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Grouping {
    /// Every diff closes its own chain.
    EachDiff,
    /// A chain closes at each tagged diff.
    #[default]
    ByTag,
}

impl Grouping {
    /// Stable name of the policy, used to keep its cache records apart.
    pub fn as_str(self) -> &'static str {
        match self {
            Grouping::EachDiff => "each-diff",
            Grouping::ByTag => "by-tag",
        }
    }
}

impl From<bool> for Grouping {
    fn from(group_by_tag: bool) -> Self {
        if group_by_tag {
            Grouping::ByTag
        } else {
            Grouping::EachDiff
        }
    }
}

/// Group an oldest-first history into layer chains.
///
/// The pending chain closes on every diff under [`Grouping::EachDiff`] and on
/// tagged diffs under [`Grouping::ByTag`]. Whatever is still pending after the
/// newest diff becomes a final chain, so no diff is left ungrouped. An empty
/// history yields no chains.
pub fn resolve_chains(history: &[DiffRecord], grouping: Grouping) -> Vec<LayerChain> {
    let mut chains = Vec::new();
    let mut pending = Vec::new();
    for record in history {
        pending.push(record.id.clone());
        let close = match grouping {
            Grouping::EachDiff => true,
            Grouping::ByTag => record.is_tagged(),
        };
        if close {
            chains.extend(LayerChain::new(std::mem::take(&mut pending)));
        }
    }
    chains.extend(LayerChain::new(pending));
    chains
}
