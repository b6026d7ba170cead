//! Last-known-good results for degraded mode.
//!
//! Every successful unit run can be snapshotted per (unit, subject). When a
//! later live run fails, the executor serves the snapshot instead, marked so
//! nobody mistakes it for fresh data.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::analysis::UnitResult;
use crate::error::Result;
use crate::storage::{FallbackSnapshot, SqliteStorage};

/// Key of the marker added to `raw_data` of served fallback results.
pub const FALLBACK_NOTICE_KEY: &str = "fallback_notice";

/// Key of the marker added to `raw_data` of synthesized partial results.
pub const PARTIAL_RESULT_KEY: &str = "partial_result";

/// Snapshot store serving stale results when live execution fails.
#[derive(Clone)]
pub struct FallbackDataSource {
    storage: SqliteStorage,
    max_age: Option<Duration>,
}

impl FallbackDataSource {
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            max_age: None,
        }
    }

    /// Treat snapshots older than `max_age` as misses.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Persist a timestamped snapshot, replacing any previous one.
    ///
    /// Fallback and partial results are not cached, so stale data never
    /// gets a fresh timestamp.
    pub async fn cache_successful_result(
        &self,
        unit_name: &str,
        subject_id: &str,
        result: &UnitResult,
    ) -> Result<()> {
        if is_degraded(result) {
            debug!(unit = unit_name, subject_id, "Skipping cache of degraded result");
            return Ok(());
        }
        let snapshot = FallbackSnapshot {
            unit_name: unit_name.to_string(),
            subject_id: subject_id.to_string(),
            result: serde_json::to_value(result)?,
            cached_at: Utc::now(),
        };
        self.storage.save_fallback_snapshot(&snapshot).await?;
        debug!(unit = unit_name, subject_id, "Cached fallback snapshot");
        Ok(())
    }

    /// Latest snapshot for (unit, subject), marked as stale.
    ///
    /// A disclaimer recommendation is prepended and a `fallback_notice`
    /// marker is added to `raw_data`. Returns `None` when no usable snapshot
    /// exists.
    pub async fn get_fallback_result(
        &self,
        unit_name: &str,
        subject_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<UnitResult>> {
        let Some(snapshot) = self
            .storage
            .get_fallback_snapshot(unit_name, subject_id)
            .await?
        else {
            return Ok(None);
        };

        let age = Utc::now() - snapshot.cached_at;
        if let Some(max_age) = self.max_age {
            if age > max_age {
                debug!(
                    unit = unit_name,
                    subject_id,
                    age_hours = age.num_hours(),
                    "Fallback snapshot too old"
                );
                return Ok(None);
            }
        }

        let mut result: UnitResult = match serde_json::from_value(snapshot.result) {
            Ok(result) => result,
            Err(e) => {
                warn!(unit = unit_name, subject_id, "Unreadable fallback snapshot: {}", e);
                return Ok(None);
            }
        };

        mark_as_fallback(&mut result, snapshot.cached_at, age, start, end);
        Ok(Some(result))
    }
}

fn mark_as_fallback(
    result: &mut UnitResult,
    cached_at: DateTime<Utc>,
    age: Duration,
    start: NaiveDate,
    end: NaiveDate,
) {
    let age_hours = age.num_minutes() as f64 / 60.0;
    let message = format!(
        "Live analysis failed. These results were cached at {} ({:.1} hours ago) and may be stale.",
        cached_at.to_rfc3339(),
        age_hours
    );

    result.recommendations.insert(
        0,
        json!({
            "type": "fallback_disclaimer",
            "priority": "high",
            "title": "Stale data: showing cached fallback results",
            "description": message,
        }),
    );
    result.raw_data.insert(
        FALLBACK_NOTICE_KEY.to_string(),
        json!({
            "message": message,
            "cached_at": cached_at.to_rfc3339(),
            "age_hours": age_hours,
            "requested_start": start.to_string(),
            "requested_end": end.to_string(),
        }),
    );
}

/// Best-effort partial result for an interrupted run.
///
/// `fraction` is clamped to `0.0..=1.0` and reported as a percentage.
pub fn synthesize_partial_result(
    unit_name: &str,
    subject_id: &str,
    fraction: f64,
    reason: &str,
) -> UnitResult {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let percent = (fraction * 100.0).round() as u32;

    UnitResult::with_recommendations(vec![json!({
        "type": "partial_result",
        "priority": "high",
        "title": format!("Partial analysis: {}% complete, {}", percent, reason),
        "description": format!(
            "The {} analysis for {} was interrupted before completion. Re-run it for full results.",
            unit_name, subject_id
        ),
    })])
    .metric("completion_fraction", json!(fraction))
    .raw(
        PARTIAL_RESULT_KEY,
        json!({
            "unit_name": unit_name,
            "subject_id": subject_id,
            "percent_complete": percent,
            "reason": reason,
            "generated_at": Utc::now().to_rfc3339(),
        }),
    )
}

/// True when `raw_data` carries a fallback or partial marker.
pub fn is_degraded(result: &UnitResult) -> bool {
    result.raw_data.contains_key(FALLBACK_NOTICE_KEY)
        || result.raw_data.contains_key(PARTIAL_RESULT_KEY)
}
