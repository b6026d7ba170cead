//! In-process execution context store.
//!
//! In memory persistence mode the accumulating context of each execution
//! lives here instead of in SQLite. Entries are timestamped on every write
//! and reclaimed by the orchestrator's cleanup task once they are older than
//! the configured TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use super::validator::check_context_size;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct ContextEntry {
    context: Map<String, Value>,
    updated_at: Instant,
}

/// Shared map of execution id to context.
#[derive(Clone, Default)]
pub struct ContextStore {
    entries: Arc<Mutex<HashMap<String, ContextEntry>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ContextEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store (or replace) the context of an execution.
    pub fn put(&self, execution_id: &str, context: Map<String, Value>) {
        self.lock().insert(
            execution_id.to_string(),
            ContextEntry {
                context,
                updated_at: Instant::now(),
            },
        );
    }

    /// Get a copy of an execution's context.
    pub fn get(&self, execution_id: &str) -> Option<Map<String, Value>> {
        self.lock().get(execution_id).map(|e| e.context.clone())
    }

    /// Merge keys into an execution's context and return the merged map.
    ///
    /// Read-modify-write happens under one lock. The stored context is left
    /// untouched when the merged map serializes to more than `limit` bytes.
    pub fn merge(
        &self,
        execution_id: &str,
        update: Map<String, Value>,
        limit: usize,
    ) -> Result<Map<String, Value>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(execution_id).ok_or_else(|| {
            Error::InvalidState(format!("Context for execution {} has expired", execution_id))
        })?;
        let mut merged = entry.context.clone();
        merged.extend(update);
        check_context_size(&merged, limit)?;
        entry.context = merged.clone();
        entry.updated_at = Instant::now();
        Ok(merged)
    }

    /// Drop entries not written for longer than `ttl`. Returns how many were dropped.
    pub fn evict_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.updated_at) <= ttl);
        before - entries.len()
    }
}
