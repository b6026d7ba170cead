//! End-to-end analyzer runs against a file-backed database.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use adflow::analysis::{AnalysisRequest, AnalysisUnit, UnitError, UnitResult};
use adflow::engine::{
    error_artifact_path, validate_output, AnalyzerExecutor, ExecutorConfig, FallbackDataSource,
    QuotaConfig, QuotaManager, EMPTY_RESULT_MESSAGE, MIN_OUTPUT_BYTES,
};
use adflow::storage::SqliteStorage;

/// Fails with a transient error until `healthy_after` calls have been made.
struct FlakyUnit {
    name: &'static str,
    calls: AtomicUsize,
    healthy_after: usize,
}

impl FlakyUnit {
    fn new(name: &'static str, healthy_after: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
            healthy_after,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisUnit for FlakyUnit {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        subject_id: &str,
        _start: NaiveDate,
        _end: NaiveDate,
        _options: &Value,
    ) -> Result<UnitResult, UnitError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.healthy_after {
            return Err(UnitError::Api(format!("backend unavailable ({})", call + 1)));
        }
        Ok(UnitResult::with_recommendations(vec![json!({
            "type": "budget_increase",
            "subject": subject_id,
            "title": "Campaign is limited by budget",
        })])
        .metric("spend", json!(1234.5))
        .metric("budget_utilization", json!(0.98)))
    }
}

struct EmptyUnit;

#[async_trait]
impl AnalysisUnit for EmptyUnit {
    fn name(&self) -> &str {
        "search_terms"
    }

    async fn execute(
        &self,
        _subject_id: &str,
        _start: NaiveDate,
        _end: NaiveDate,
        _options: &Value,
    ) -> Result<UnitResult, UnitError> {
        Ok(UnitResult::default())
    }
}

fn request() -> AnalysisRequest {
    AnalysisRequest::new(
        "123-456-7890",
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
    )
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        ..ExecutorConfig::default()
    }
}

fn executor(storage: &SqliteStorage) -> AnalyzerExecutor {
    AnalyzerExecutor::new(fast_config()).with_fallback(FallbackDataSource::new(storage.clone()))
}

async fn read_json(path: &Path) -> Value {
    let bytes = tokio::fs::read(path).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn transient_failures_then_success_writes_validated_output() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(&dir.path().join("adflow.db")).unwrap();
    let unit = FlakyUnit::new("budget_pacing", 2);
    let output = dir.path().join("out").join("budget_pacing.json");

    let outcome = executor(&storage)
        .execute_analyzer(unit.clone(), &request(), &output, Duration::from_secs(5), 3)
        .await;

    assert!(outcome.success);
    assert_eq!(outcome.attempt_count, 3);
    assert_eq!(unit.calls(), 3);
    assert_eq!(outcome.output_location.as_deref(), Some(output.as_path()));
    assert!(std::fs::metadata(&output).unwrap().len() > MIN_OUTPUT_BYTES);

    // validation has no side effects
    assert!(validate_output(&output, MIN_OUTPUT_BYTES).await.is_ok());
    assert!(validate_output(&output, MIN_OUTPUT_BYTES).await.is_ok());

    let document = read_json(&output).await;
    assert_eq!(document["execution_metadata"]["success"], true);
    assert_eq!(document["execution_metadata"]["attempt_count"], 3);
    assert_eq!(document["analysis_metadata"]["subject_id"], "123-456-7890");
    assert_eq!(document["metrics"]["spend"], 1234.5);
}

#[tokio::test]
async fn empty_result_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(&dir.path().join("adflow.db")).unwrap();
    let output = dir.path().join("search_terms.json");

    let outcome = executor(&storage)
        .execute_analyzer(Arc::new(EmptyUnit), &request(), &output, Duration::from_secs(5), 3)
        .await;

    assert!(!outcome.success);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("empty or invalid result"));
    assert!(outcome.error.as_deref().unwrap().contains(EMPTY_RESULT_MESSAGE));
    assert!(!output.exists());
    assert!(error_artifact_path(&output).exists());
}

#[tokio::test]
async fn fallback_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("adflow.db");

    // a healthy run populates the cache
    {
        let storage = SqliteStorage::open(&db_path).unwrap();
        let outcome = executor(&storage)
            .execute_analyzer(
                FlakyUnit::new("budget_pacing", 0),
                &request(),
                &dir.path().join("first.json"),
                Duration::from_secs(5),
                3,
            )
            .await;
        assert!(outcome.success);
        assert!(!outcome.degraded);
    }

    // the live backend is down after reopening the database
    let storage = SqliteStorage::open(&db_path).unwrap();
    let broken = FlakyUnit::new("budget_pacing", usize::MAX);
    let output = dir.path().join("second.json");
    let outcome = executor(&storage)
        .execute_analyzer(broken.clone(), &request(), &output, Duration::from_secs(5), 2)
        .await;

    assert!(outcome.success);
    assert!(outcome.degraded);
    assert_eq!(broken.calls(), 2);

    let document = read_json(&output).await;
    assert_eq!(document["execution_metadata"]["degraded"], true);
    assert_eq!(document["execution_metadata"]["source"], "fallback");
    assert_eq!(
        document["recommendations"][0]["type"],
        "fallback_disclaimer"
    );
    assert!(document["raw_data"]["fallback_notice"].is_object());
}

#[tokio::test]
async fn persisted_quota_refuses_work_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(&dir.path().join("adflow.db")).unwrap();
    let state = dir.path().join("quota.json");
    let config = QuotaConfig {
        daily_limit: 1,
        per_minute_limit: 100,
    };

    let first = Arc::new(QuotaManager::with_state_file(config.clone(), &state).unwrap());
    let outcome = executor(&storage)
        .with_quota(first)
        .execute_analyzer(
            FlakyUnit::new("budget_pacing", 0),
            &request(),
            &dir.path().join("a.json"),
            Duration::from_secs(5),
            1,
        )
        .await;
    assert!(outcome.success);

    // a new process sees the spent budget
    let second = Arc::new(QuotaManager::with_state_file(config, &state).unwrap());
    assert_eq!(second.get_quota_status().daily_remaining, 0);

    let unit = FlakyUnit::new("keyword_waste", 0);
    let outcome = executor(&storage)
        .with_quota(second)
        .execute_analyzer(
            unit.clone(),
            &request(),
            &dir.path().join("b.json"),
            Duration::from_secs(5),
            3,
        )
        .await;
    assert!(!outcome.success);
    assert_eq!(unit.calls(), 0);
    assert!(outcome.error.unwrap().contains("quota"));
}

#[tokio::test]
async fn batch_outcomes_follow_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SqliteStorage::open(&dir.path().join("adflow.db")).unwrap();
    let units: Vec<Arc<dyn AnalysisUnit>> = vec![
        FlakyUnit::new("budget_pacing", 0),
        Arc::new(EmptyUnit),
        FlakyUnit::new("keyword_waste", 1),
    ];

    let outcomes = executor(&storage)
        .execute_multiple_analyzers(units, &request(), dir.path(), 2)
        .await;

    let names: Vec<_> = outcomes.iter().map(|o| o.unit_name.as_str()).collect();
    assert_eq!(names, ["budget_pacing", "search_terms", "keyword_waste"]);
    assert!(outcomes[0].success);
    assert!(!outcomes[1].success);
    assert!(outcomes[2].success);
    assert_eq!(outcomes[2].attempt_count, 2);
}
