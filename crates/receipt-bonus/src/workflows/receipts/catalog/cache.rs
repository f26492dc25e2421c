use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::CatalogSnapshot;
use crate::workflows::receipts::domain::CatalogEntry;

/// Externally managed reference data feeding the local snapshot.
pub trait CatalogSource: Send + Sync {
    fn load(&self) -> Result<Vec<CatalogEntry>, CatalogError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog source unavailable: {0}")]
    Unavailable(String),
    #[error("catalog lock poisoned")]
    Poisoned,
}

/// Fixed in-process catalog, used for seeding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogSource {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalogSource {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }
}

impl CatalogSource for StaticCatalogSource {
    fn load(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.entries.clone())
    }
}

/// Periodically refreshed snapshot; readers clone an `Arc` and never block a refresh for long.
pub struct CatalogCache {
    source: Arc<dyn CatalogSource>,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogCache {
    pub fn new(source: Arc<dyn CatalogSource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(CatalogSnapshot::default())),
        }
    }

    /// Build the cache and load the first snapshot eagerly.
    pub fn primed(source: Arc<dyn CatalogSource>) -> Result<Self, CatalogError> {
        let cache = Self::new(source);
        cache.refresh()?;
        Ok(cache)
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Reload from the source. On failure the previous snapshot stays in service.
    pub fn refresh(&self) -> Result<usize, CatalogError> {
        let entries = match self.source.load() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "catalog refresh failed, keeping previous snapshot");
                return Err(err);
            }
        };
        let snapshot = Arc::new(CatalogSnapshot::new(&entries));
        let active = snapshot.active_entries();

        let mut guard = self.current.write().map_err(|_| CatalogError::Poisoned)?;
        *guard = snapshot;
        info!(active_entries = active, "catalog snapshot refreshed");
        Ok(active)
    }
}
