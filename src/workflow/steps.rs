//! Step executors and their registry.
//!
//! A workflow step names a `target_service`; the orchestrator resolves it
//! through a [`StepRegistry`] at invocation time and hands the executor the
//! current context. Whatever map the executor returns is merged into the
//! context for later steps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::analysis::{AnalysisRegistry, AnalysisRequest};
use crate::engine::analyzer::output_file_name;
use crate::engine::AnalyzerExecutor;
use crate::error::{Error, Result};

/// What a step executor sees when invoked.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: String,
    pub workflow_name: String,
    pub customer_id: String,
    pub step_name: String,
    pub position: u32,
    /// 1-based attempt number of this step
    pub attempt: u32,
    /// Step-specific configuration from the definition
    pub config: Value,
    /// Accumulated execution context
    pub context: Map<String, Value>,
}

/// Trait that all step services implement.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Service name matched against a step's `target_service`.
    fn service(&self) -> &str;

    /// Run the step and return the keys to merge into the context.
    async fn execute(&self, ctx: &StepContext) -> Result<Map<String, Value>>;

    fn description(&self) -> &str {
        "A workflow step"
    }
}

/// Registry of step services.
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any with the same name.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors
            .insert(executor.service().to_string(), executor);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(service).cloned()
    }

    pub fn resolve(&self, service: &str) -> Result<Arc<dyn StepExecutor>> {
        self.get(service)
            .ok_or_else(|| Error::NotFound(format!("Unknown step service: {}", service)))
    }

    pub fn has(&self, service: &str) -> bool {
        self.executors.contains_key(service)
    }

    /// Registered service names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Configuration of an `analyzer` step.
#[derive(Debug, Clone, Deserialize)]
struct AnalyzerStepConfig {
    unit: String,
    #[serde(default)]
    start_date: Option<NaiveDate>,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    options: Option<Value>,
}

/// Built-in `analyzer` service running an analysis unit for the execution's customer.
///
/// Merges `{"<unit>_result": ExecutionOutcome}` into the context and fails
/// the step when the outcome is unsuccessful. Degraded (fallback) outcomes
/// count as success.
pub struct AnalyzerStep {
    executor: AnalyzerExecutor,
    units: AnalysisRegistry,
    output_dir: PathBuf,
}

impl AnalyzerStep {
    pub const SERVICE: &'static str = "analyzer";

    pub fn new(executor: AnalyzerExecutor, units: AnalysisRegistry, output_dir: PathBuf) -> Self {
        Self {
            executor,
            units,
            output_dir,
        }
    }
}

fn context_date(context: &Map<String, Value>, key: &str) -> Result<Option<NaiveDate>> {
    match context.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s
            .parse::<NaiveDate>()
            .map(Some)
            .map_err(|e| Error::Validation(format!("Invalid {} '{}': {}", key, s, e))),
        Some(other) => Err(Error::Validation(format!(
            "Invalid {}: expected a YYYY-MM-DD string, got {}",
            key, other
        ))),
    }
}

/// The 30 days ending yesterday.
fn default_range() -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    let end = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    let start = end.checked_sub_days(Days::new(29)).unwrap_or(end);
    (start, end)
}

#[async_trait]
impl StepExecutor for AnalyzerStep {
    fn service(&self) -> &str {
        Self::SERVICE
    }

    fn description(&self) -> &str {
        "Run an analysis unit for the execution's customer"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Map<String, Value>> {
        let config: AnalyzerStepConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| Error::Validation(format!("Invalid analyzer step config: {}", e)))?;
        let unit = self.units.resolve(&config.unit)?;

        let (default_start, default_end) = default_range();
        let start = match config.start_date {
            Some(date) => date,
            None => context_date(&ctx.context, "start_date")?.unwrap_or(default_start),
        };
        let end = match config.end_date {
            Some(date) => date,
            None => context_date(&ctx.context, "end_date")?.unwrap_or(default_end),
        };
        if start > end {
            return Err(Error::Validation(format!(
                "start_date {} is after end_date {}",
                start, end
            )));
        }

        let executor_config = self.executor.config();
        let attempt_timeout = config
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(executor_config.default_timeout);
        let max_retries = config
            .max_retries
            .unwrap_or(executor_config.default_max_retries);

        let mut request = AnalysisRequest::new(&ctx.customer_id, start, end);
        if let Some(options) = config.options {
            request = request.with_options(options);
        }
        let output_path = self
            .output_dir
            .join(&ctx.execution_id)
            .join(output_file_name(&config.unit, &ctx.customer_id));

        debug!(
            execution_id = %ctx.execution_id,
            step = %ctx.step_name,
            unit = %config.unit,
            "Running analyzer step"
        );
        let outcome = self
            .executor
            .execute_analyzer(unit, &request, &output_path, attempt_timeout, max_retries)
            .await;

        if !outcome.success {
            return Err(Error::Execution(format!(
                "Analyzer '{}' failed: {}",
                config.unit,
                outcome.error.as_deref().unwrap_or("unknown error")
            )));
        }

        let mut update = Map::new();
        update.insert(
            format!("{}_result", config.unit),
            serde_json::to_value(&outcome)?,
        );
        Ok(update)
    }
}
