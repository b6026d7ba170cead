//! Cache of resolved workflow definitions.
//!
//! Starting and resuming executions resolve definitions by name; the cache
//! keeps hot definitions out of SQLite. Entries expire on their own and are
//! invalidated whenever a definition is saved or toggled.

use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::types::WorkflowDefinition;

/// Default cache capacity (number of definitions).
const DEFAULT_CACHE_CAPACITY: u64 = 100;

/// Default time-to-live for cached definitions (5 minutes).
const DEFAULT_TTL_SECS: u64 = 300;

/// Definition cache keyed by workflow name.
#[derive(Clone)]
pub struct DefinitionCache {
    cache: Cache<String, Arc<WorkflowDefinition>>,
}

impl DefinitionCache {
    /// Create a cache with default settings.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_CACHE_CAPACITY, Duration::from_secs(DEFAULT_TTL_SECS))
    }

    /// Create a cache with custom capacity and TTL.
    pub fn with_config(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.cache.get(name).await
    }

    pub async fn insert(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        self.cache
            .insert(definition.name.clone(), definition.clone())
            .await;
        definition
    }

    pub async fn invalidate(&self, name: &str) {
        self.cache.invalidate(name).await;
    }

    /// Clear the entire cache.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// Number of cached definitions.
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl Default for DefinitionCache {
    fn default() -> Self {
        Self::new()
    }
}
