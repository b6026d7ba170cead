//! Workflow definition types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One step of a workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// - name: budget-check
///   service: analyzer
///   retry_count: 2
///   config:
///     unit: budget_pacing
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the definition
    #[serde(default)]
    pub name: String,

    /// Registered step executor that runs this step
    #[serde(default, alias = "service")]
    pub target_service: String,

    /// Extra attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,

    /// Executor-specific configuration
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl StepSpec {
    pub fn new(name: &str, target_service: &str) -> Self {
        Self {
            name: name.to_string(),
            target_service: target_service.to_string(),
            retry_count: 0,
            config: Value::Null,
        }
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Definition as submitted by a caller, before it is stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub steps: Option<Vec<StepSpec>>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DefinitionSpec {
    pub fn new(name: &str, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            steps: Some(steps),
            enabled: true,
        }
    }
}

/// A named, versioned sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: u32,
    pub steps: Vec<StepSpec>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Build a fresh version-1 definition from a submitted spec.
    pub fn from_spec(spec: DefinitionSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            version: 1,
            steps: spec.steps.unwrap_or_default(),
            enabled: spec.enabled,
            created_at: now,
            updated_at: now,
        }
    }
}
