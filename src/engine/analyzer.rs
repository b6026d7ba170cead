//! Resilient execution of analysis units.
//!
//! `AnalyzerExecutor::execute_analyzer` wraps one unit run with a per-attempt
//! timeout, capped exponential backoff between retryable failures, optional
//! quota reservation, write-then-validate output handling and a degraded
//! fallback path. It never returns an error: every failure is reported in the
//! returned [`ExecutionOutcome`] and leaves an `_ERROR` artifact behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use super::fallback::{synthesize_partial_result, FallbackDataSource};
use super::output::{
    write_error_artifact, write_output, ErrorDocument, ExecutionMetadata, OutputDocument,
    ResultSource, MIN_OUTPUT_BYTES,
};
use super::quota::QuotaManager;
use crate::analysis::{AnalysisRequest, AnalysisUnit, UnitError, UnitResult};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;

/// Message reported for structurally valid but empty unit results.
pub const EMPTY_RESULT_MESSAGE: &str = "Analyzer returned empty or invalid result";

/// Runtime configuration of the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub fallback_enabled: bool,
    pub min_output_bytes: u64,
    pub concurrency_limit: usize,
    /// Delay before the second attempt; doubles per attempt
    pub retry_base_delay: Duration,
    /// Upper bound of the retry delay
    pub retry_max_delay: Duration,
    /// Quota units reserved per attempt when a quota manager is attached
    pub quota_cost: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            default_max_retries: 3,
            fallback_enabled: true,
            min_output_bytes: MIN_OUTPUT_BYTES,
            concurrency_limit: 4,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            quota_cost: 1,
        }
    }
}

/// Reported result of one unit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub unit_name: String,
    pub subject_id: String,
    pub success: bool,
    pub output_location: Option<PathBuf>,
    pub error: Option<String>,
    pub error_location: Option<PathBuf>,
    pub execution_time_ms: u64,
    pub attempt_count: u32,
    /// Served from the fallback cache or synthesized as a partial result
    pub degraded: bool,
    pub partial: bool,
}

impl ExecutionOutcome {
    fn failed(unit_name: &str, subject_id: &str, message: String) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            subject_id: subject_id.to_string(),
            success: false,
            output_location: None,
            error: Some(message),
            error_location: None,
            execution_time_ms: 0,
            attempt_count: 0,
            degraded: false,
            partial: false,
        }
    }

    /// Outcome label used for metrics and logs.
    pub fn status_label(&self) -> &'static str {
        match (self.success, self.degraded, self.partial) {
            (_, _, true) => "partial",
            (true, true, _) => "degraded",
            (true, false, _) => "success",
            (false, _, _) => "failed",
        }
    }
}

/// Why the live attempts ended without a validated result.
#[derive(Debug)]
enum Failure {
    Unit(UnitError),
    TimedOut(Duration),
    Empty,
    Output(String),
    QuotaExhausted,
    Interrupted { progress: f64 },
}

impl Failure {
    fn kind(&self) -> &'static str {
        match self {
            Failure::Unit(e) => e.kind(),
            Failure::TimedOut(_) => "timeout",
            Failure::Empty => "empty_result",
            Failure::Output(_) => "output_error",
            Failure::QuotaExhausted => "quota_exhausted",
            Failure::Interrupted { .. } => "interrupted",
        }
    }

    fn message(&self) -> String {
        match self {
            Failure::Unit(e) => e.to_string(),
            Failure::TimedOut(limit) => {
                format!("Analyzer timed out after {:.1}s", limit.as_secs_f64())
            }
            Failure::Empty => EMPTY_RESULT_MESSAGE.to_string(),
            Failure::Output(msg) => format!("Output validation failed: {}", msg),
            Failure::QuotaExhausted => "API quota exhausted".to_string(),
            Failure::Interrupted { .. } => "Analyzer interrupted by shutdown".to_string(),
        }
    }
}

/// Per-run bookkeeping shared by the success and recovery paths.
struct Run<'a> {
    unit_name: &'a str,
    request: &'a AnalysisRequest,
    output_path: &'a Path,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Run<'_> {
    fn metadata(&self, success: bool, attempts: u32, source: ResultSource) -> ExecutionMetadata {
        ExecutionMetadata {
            success,
            started_at: self.started_at,
            completed_at: Utc::now(),
            attempt_count: attempts,
            degraded: source != ResultSource::Live,
            source,
        }
    }

    fn outcome(&self, success: bool, attempts: u32) -> ExecutionOutcome {
        ExecutionOutcome {
            unit_name: self.unit_name.to_string(),
            subject_id: self.request.subject_id.clone(),
            success,
            output_location: None,
            error: None,
            error_location: None,
            execution_time_ms: self.started.elapsed().as_millis() as u64,
            attempt_count: attempts,
            degraded: false,
            partial: false,
        }
    }
}

/// Runs analysis units with timeout, retry, quota and fallback semantics.
#[derive(Clone)]
pub struct AnalyzerExecutor {
    config: ExecutorConfig,
    fallback: Option<FallbackDataSource>,
    quota: Option<Arc<QuotaManager>>,
    shutdown: Option<ShutdownCoordinator>,
}

impl AnalyzerExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            fallback: None,
            quota: None,
            shutdown: None,
        }
    }

    /// Serve cached results when live runs fail, and refresh the cache on success.
    pub fn with_fallback(mut self, fallback: FallbackDataSource) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Reserve quota before every attempt.
    pub fn with_quota(mut self, quota: Arc<QuotaManager>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Abort in-flight attempts when shutdown is requested.
    pub fn with_shutdown(mut self, shutdown: ShutdownCoordinator) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn fallback_source(&self) -> Option<&FallbackDataSource> {
        if self.config.fallback_enabled {
            self.fallback.as_ref()
        } else {
            None
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.config
            .retry_base_delay
            .saturating_mul(1u32 << shift)
            .min(self.config.retry_max_delay)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    async fn wait_for_shutdown(&self) {
        match &self.shutdown {
            Some(shutdown) => shutdown.wait_for_shutdown().await,
            None => std::future::pending().await,
        }
    }

    /// Run one unit and write its result to `output_path`.
    ///
    /// `max_retries` is the total number of attempts (at least one is made);
    /// each attempt gets its own `attempt_timeout` budget.
    #[instrument(
        name = "analyzer.execute",
        skip(self, unit, request, output_path),
        fields(unit = %unit.name(), subject_id = %request.subject_id)
    )]
    pub async fn execute_analyzer(
        &self,
        unit: Arc<dyn AnalysisUnit>,
        request: &AnalysisRequest,
        output_path: &Path,
        attempt_timeout: Duration,
        max_retries: u32,
    ) -> ExecutionOutcome {
        let unit_name = unit.name().to_string();
        let run = Run {
            unit_name: &unit_name,
            request,
            output_path,
            started_at: Utc::now(),
            started: Instant::now(),
        };
        let max_attempts = max_retries.max(1);
        let mut attempt = 0u32;

        let failure = loop {
            if self.shutdown_requested() {
                break Failure::Interrupted { progress: 0.0 };
            }
            attempt += 1;

            if let Some(quota) = &self.quota {
                if !quota.try_reserve_quota(self.config.quota_cost) {
                    break Failure::QuotaExhausted;
                }
            }

            debug!(attempt, max_attempts, "Starting analyzer attempt");
            let attempt_started = Instant::now();
            let call = timeout(
                attempt_timeout,
                unit.execute(&request.subject_id, request.start, request.end, &request.options),
            );
            let result = tokio::select! {
                result = call => result,
                _ = self.wait_for_shutdown() => {
                    let progress = attempt_started.elapsed().as_secs_f64()
                        / attempt_timeout.as_secs_f64().max(f64::EPSILON);
                    break Failure::Interrupted { progress: progress.min(0.99) };
                }
            };

            let failure = match result {
                Ok(Ok(result)) if result.is_empty() => break Failure::Empty,
                Ok(Ok(result)) => {
                    let document = OutputDocument::new(
                        &unit_name,
                        request,
                        &result,
                        run.metadata(true, attempt, ResultSource::Live),
                    );
                    match write_output(output_path, &document, self.config.min_output_bytes).await
                    {
                        Ok(()) => return self.finish_live(&run, &result, attempt).await,
                        Err(e) => Failure::Output(e.to_string()),
                    }
                }
                Ok(Err(e)) if !e.is_retryable() => break Failure::Unit(e),
                Ok(Err(e)) => Failure::Unit(e),
                Err(_) => Failure::TimedOut(attempt_timeout),
            };

            if attempt >= max_attempts {
                break failure;
            }

            let delay = self.retry_delay(attempt);
            warn!(
                attempt,
                max_attempts,
                "Analyzer attempt failed: {}. Retrying in {}ms",
                failure.message(),
                delay.as_millis()
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.wait_for_shutdown() => {}
            }
        };

        self.recover(&run, failure, attempt, max_attempts).await
    }

    async fn finish_live(&self, run: &Run<'_>, result: &UnitResult, attempts: u32) -> ExecutionOutcome {
        if let Some(fallback) = self.fallback_source() {
            if let Err(e) = fallback
                .cache_successful_result(run.unit_name, &run.request.subject_id, result)
                .await
            {
                warn!("Failed to refresh fallback cache: {}", e);
            }
        }

        let mut outcome = run.outcome(true, attempts);
        outcome.output_location = Some(run.output_path.to_path_buf());
        info!(attempts, "Analyzer completed");
        self.record(&outcome);
        outcome
    }

    /// Fallback, partial or error artifact once live attempts are over.
    async fn recover(
        &self,
        run: &Run<'_>,
        failure: Failure,
        attempts: u32,
        max_attempts: u32,
    ) -> ExecutionOutcome {
        let mut message = failure.message();
        if matches!(failure, Failure::Unit(ref e) if e.is_retryable())
            || matches!(failure, Failure::TimedOut(_) | Failure::Output(_))
        {
            if attempts >= max_attempts {
                message = format!("Failed after {} attempts: {}", attempts, message);
            }
        }
        warn!(attempts, kind = failure.kind(), "Analyzer failed: {}", message);

        if let Some(fallback) = self.fallback_source() {
            match fallback
                .get_fallback_result(
                    run.unit_name,
                    &run.request.subject_id,
                    run.request.start,
                    run.request.end,
                )
                .await
            {
                Ok(Some(cached)) => {
                    let document = OutputDocument::new(
                        run.unit_name,
                        run.request,
                        &cached,
                        run.metadata(true, attempts, ResultSource::Fallback),
                    );
                    match write_output(run.output_path, &document, self.config.min_output_bytes)
                        .await
                    {
                        Ok(()) => {
                            let mut outcome = run.outcome(true, attempts);
                            outcome.output_location = Some(run.output_path.to_path_buf());
                            outcome.error = Some(message);
                            outcome.degraded = true;
                            info!(attempts, "Served cached fallback result");
                            self.record(&outcome);
                            return outcome;
                        }
                        Err(e) => {
                            message = format!("{}; fallback output failed: {}", message, e);
                        }
                    }
                }
                Ok(None) => debug!("No fallback result available"),
                Err(e) => warn!("Fallback lookup failed: {}", e),
            }
        }

        let mut outcome = run.outcome(false, attempts);

        if let Failure::Interrupted { progress } = failure {
            let partial = synthesize_partial_result(
                run.unit_name,
                &run.request.subject_id,
                progress,
                "interrupted by shutdown",
            );
            let document = OutputDocument::new(
                run.unit_name,
                run.request,
                &partial,
                run.metadata(false, attempts, ResultSource::Partial),
            );
            match write_output(run.output_path, &document, self.config.min_output_bytes).await {
                Ok(()) => {
                    outcome.output_location = Some(run.output_path.to_path_buf());
                    outcome.degraded = true;
                    outcome.partial = true;
                }
                Err(e) => warn!("Failed to write partial result: {}", e),
            }
        }

        let document = ErrorDocument {
            error: message.clone(),
            error_type: failure.kind().to_string(),
            timestamp: Utc::now(),
            attempts,
            unit_name: run.unit_name.to_string(),
            subject_id: run.request.subject_id.clone(),
        };
        match write_error_artifact(run.output_path, &document).await {
            Ok(location) => outcome.error_location = Some(location),
            Err(e) => error!("Failed to write error artifact: {}", e),
        }

        outcome.error = Some(message);
        outcome.execution_time_ms = run.started.elapsed().as_millis() as u64;
        self.record(&outcome);
        outcome
    }

    fn record(&self, outcome: &ExecutionOutcome) {
        metrics::record_analyzer_execution(&outcome.unit_name, outcome.status_label());
        metrics::record_analyzer_duration(
            Duration::from_millis(outcome.execution_time_ms),
            &outcome.unit_name,
        );
        metrics::record_analyzer_attempts(&outcome.unit_name, outcome.attempt_count);
    }

    /// Run many units for one subject, at most `concurrency_limit` at a time.
    ///
    /// Each unit writes `<output_dir>/<unit>_<subject>.json` using the
    /// configured default timeout and retry count. Outcomes are returned in
    /// the order of `units`; a panicking unit becomes a failed outcome
    /// without affecting the others. A unit whose file name collides with an
    /// earlier unit's is not run.
    #[instrument(
        name = "analyzer.execute_many",
        skip(self, units, request, output_dir),
        fields(units = units.len(), subject_id = %request.subject_id)
    )]
    pub async fn execute_multiple_analyzers(
        &self,
        units: Vec<Arc<dyn AnalysisUnit>>,
        request: &AnalysisRequest,
        output_dir: &Path,
        concurrency_limit: usize,
    ) -> Vec<ExecutionOutcome> {
        let semaphore = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let mut join_set: JoinSet<(usize, ExecutionOutcome)> = JoinSet::new();
        let names: Vec<String> = units.iter().map(|u| u.name().to_string()).collect();
        let mut outcomes: Vec<Option<ExecutionOutcome>> = vec![None; names.len()];
        let mut claimed = HashSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let file_name = output_file_name(unit.name(), &request.subject_id);
            if !claimed.insert(file_name.clone()) {
                warn!(unit = %unit.name(), file = %file_name, "Output file already claimed in batch");
                outcomes[index] = Some(ExecutionOutcome::failed(
                    unit.name(),
                    &request.subject_id,
                    format!("Output file {} is already used by another unit in this batch", file_name),
                ));
                continue;
            }

            let executor = self.clone();
            let semaphore = semaphore.clone();
            let request = request.clone();
            let output_path = output_dir.join(file_name);
            let unit_name = unit.name().to_string();

            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            ExecutionOutcome::failed(
                                &unit_name,
                                &request.subject_id,
                                "Executor is shutting down".to_string(),
                            ),
                        )
                    }
                };

                let subject_id = request.subject_id.clone();
                let attempt_timeout = executor.config.default_timeout;
                let max_retries = executor.config.default_max_retries;
                let handle = tokio::spawn(async move {
                    executor
                        .execute_analyzer(unit, &request, &output_path, attempt_timeout, max_retries)
                        .await
                });

                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(unit = %unit_name, "Analyzer task panicked: {}", e);
                        ExecutionOutcome::failed(
                            &unit_name,
                            &subject_id,
                            format!("Analyzer task failed: {}", e),
                        )
                    }
                };
                (index, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!("Analyzer batch task failed: {}", e),
            }
        }

        outcomes
            .into_iter()
            .zip(names)
            .map(|(outcome, name)| {
                outcome.unwrap_or_else(|| {
                    ExecutionOutcome::failed(
                        &name,
                        &request.subject_id,
                        "Analyzer task did not complete".to_string(),
                    )
                })
            })
            .collect()
    }
}

/// File name of a unit's output inside a batch output directory.
pub fn output_file_name(unit_name: &str, subject_id: &str) -> String {
    let safe = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}_{}.json", safe(unit_name), safe(subject_id))
}
