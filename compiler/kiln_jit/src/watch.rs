//! Watch lists: which patch sites depend on which runtime facts.
//!
//! Compiled code assumes some facts without checking them, such as "this
//! namespace has no binding for `len`". Each assumption is a patch site
//! that currently does nothing. When the runtime reports that a watched
//! fact changed, every site registered under that key is rewritten into a
//! jump to its deopt stub, so the next execution falls back to the
//! interpreter.
//!
//! Invalidation is one-shot: a key's sites are removed when they fire.

use std::collections::BTreeMap;

use kiln_codegen::{CodegenError, PatchSite, SharedCodeBuffer};
use kiln_rt::WatchKey;
use rustc_hash::FxHashSet;

use crate::artifact::CompiledArtifact;

/// A patch site in a specific artifact.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PatchRef {
    /// Id of the artifact's entry.
    pub artifact: u64,
    /// Absolute offset of the artifact's code.
    pub base: usize,
    pub site: PatchSite,
}

impl PatchRef {
    pub fn offset(&self) -> usize {
        self.base + self.site.offset
    }
}

#[derive(Debug, Default)]
pub struct WatchList {
    sites: BTreeMap<WatchKey, Vec<PatchRef>>,
    registered: FxHashSet<u64>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every patch site of `artifact`. Returns the keys that were
    /// not watched before. Registering an artifact twice does nothing.
    pub fn register(&mut self, artifact: &CompiledArtifact) -> Vec<WatchKey> {
        let id = artifact.entry().0;
        if !self.registered.insert(id) {
            return Vec::new();
        }
        let mut fresh = Vec::new();
        for &site in artifact.patch_sites() {
            let patch = PatchRef {
                artifact: id,
                base: artifact.base,
                site,
            };
            let sites = self.sites.entry(site.key).or_default();
            if sites.is_empty() {
                fresh.push(site.key);
            }
            if !sites.contains(&patch) {
                sites.push(patch);
            }
        }
        fresh
    }

    /// Remove and return the sites watching `key`.
    pub fn take(&mut self, key: WatchKey) -> Vec<PatchRef> {
        self.sites.remove(&key).unwrap_or_default()
    }

    pub fn sites(&self, key: WatchKey) -> &[PatchRef] {
        self.sites.get(&key).map_or(&[], Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = WatchKey> + '_ {
        self.sites.keys().copied()
    }

    /// Number of watched keys.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// Rewrite each site into a jump to its deopt stub.
pub fn invalidate(buffer: &SharedCodeBuffer, sites: &[PatchRef]) -> Result<(), CodegenError> {
    let mut buffer = buffer.lock();
    for patch in sites {
        buffer.patch(patch.offset(), patch.site.jump())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
