//! Analysis unit trait and result types.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result of running one analysis unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    /// Ordered recommendations produced by the unit
    #[serde(default)]
    pub recommendations: Vec<Value>,
    /// Structured metric summary
    #[serde(default)]
    pub metrics: Map<String, Value>,
    /// Opaque raw data for downstream consumers
    #[serde(default)]
    pub raw_data: Map<String, Value>,
}

impl UnitResult {
    /// Create a result from recommendations only.
    pub fn with_recommendations(recommendations: Vec<Value>) -> Self {
        Self {
            recommendations,
            ..Self::default()
        }
    }

    /// Add a metric entry.
    pub fn metric(mut self, key: &str, value: Value) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Add a raw data entry.
    pub fn raw(mut self, key: &str, value: Value) -> Self {
        self.raw_data.insert(key.to_string(), value);
        self
    }

    /// A result is empty when none of its sections carry data.
    pub fn is_empty(&self) -> bool {
        self.recommendations.is_empty() && self.metrics.is_empty() && self.raw_data.is_empty()
    }
}

/// Error raised by an analysis unit.
///
/// The variant decides whether the executor retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl UnitError {
    /// Transient failures are worth another attempt; explicit denials are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UnitError::RateLimited(_) | UnitError::Api(_))
    }

    /// Short error class name, written into error artifacts.
    pub fn kind(&self) -> &'static str {
        match self {
            UnitError::RateLimited(_) => "rate_limited",
            UnitError::Api(_) => "api_error",
            UnitError::Validation(_) => "validation_error",
            UnitError::PermissionDenied(_) => "permission_denied",
            UnitError::QuotaExceeded(_) => "quota_exceeded",
        }
    }
}

/// Subject and date range an analysis is scoped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub subject_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub options: Value,
}

impl AnalysisRequest {
    pub fn new(subject_id: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            start,
            end,
            options: Value::Object(Map::new()),
        }
    }

    /// Attach unit-specific options.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// Trait that every analysis unit implements.
#[async_trait]
pub trait AnalysisUnit: Send + Sync {
    /// Unique unit name (e.g. "budget_pacing").
    fn name(&self) -> &str;

    /// Run the analysis for one subject and date range.
    async fn execute(
        &self,
        subject_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        options: &Value,
    ) -> Result<UnitResult, UnitError>;

    /// Human-readable description of the unit.
    fn description(&self) -> &str {
        "An analysis unit"
    }
}
