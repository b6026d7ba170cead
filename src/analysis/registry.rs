//! Analysis registry - resolves units by name at invocation time.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::AnalysisUnit;
use crate::error::{Error, Result};

/// Registry of available analysis units.
#[derive(Clone, Default)]
pub struct AnalysisRegistry {
    units: HashMap<String, Arc<dyn AnalysisUnit>>,
}

impl AnalysisRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its own name.
    pub fn register(&mut self, unit: Arc<dyn AnalysisUnit>) {
        self.units.insert(unit.name().to_string(), unit);
    }

    /// Get a unit by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisUnit>> {
        self.units.get(name).cloned()
    }

    /// Get a unit by name, failing with `NotFound`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AnalysisUnit>> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown analysis unit: {}", name)))
    }

    /// Check if a unit is registered.
    pub fn has(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// List registered unit names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.units.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}
