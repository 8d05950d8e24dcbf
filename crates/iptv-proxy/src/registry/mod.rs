//! Provider registry and channel catalog.
//!
//! Lookups are read-mostly and taken from an immutable snapshot. A reload
//! builds a complete new snapshot first and swaps the whole thing in one
//! store, so in-flight requests keep a consistent view and never observe a
//! partially-updated mapping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::config::Config;
use crate::errors::ConfigError;
use crate::models::{Channel, Provider};

/// Immutable view of all providers and channels.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    providers: HashMap<String, Arc<Provider>>,
    channels: HashMap<String, Arc<Channel>>,
}

impl CatalogSnapshot {
    /// Build a snapshot from validated configuration. Re-checks the channel
    /// invariants so a reload from a bad file can never be half-applied.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let providers: HashMap<String, Arc<Provider>> = config
            .providers
            .iter()
            .map(|p| (p.id.clone(), Arc::new(p.clone())))
            .collect();

        let channels: HashMap<String, Arc<Channel>> = config
            .channels
            .iter()
            .map(|c| (c.id.clone(), Arc::new(c.clone())))
            .collect();

        Ok(Self {
            providers,
            channels,
        })
    }

    pub fn provider(&self, id: &str) -> Option<Arc<Provider>> {
        self.providers.get(id).cloned()
    }

    pub fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.get(id).cloned()
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.values()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

/// Holder of the current snapshot, shared by all requests.
#[derive(Debug, Default)]
pub struct CatalogService {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogService {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Cheap clone of the current snapshot. Callers keep the returned `Arc`
    /// for the duration of a request to stay on one consistent view.
    pub fn load(&self) -> Arc<CatalogSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Atomically replace the catalog.
    pub fn swap(&self, snapshot: CatalogSnapshot) {
        info!(
            providers = snapshot.provider_count(),
            channels = snapshot.channel_count(),
            "catalog snapshot swapped"
        );
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }
}
