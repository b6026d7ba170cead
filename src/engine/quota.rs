//! Advertising-API quota accounting.
//!
//! Tracks consumption against a daily budget and a per-minute budget.
//! The per-minute window is bucketed on wall-clock minutes
//! (`unix_seconds / 60`), not a sliding log, so admission near a minute
//! boundary can be slightly generous or strict.
//!
//! Admission is check-then-reserve: call [`QuotaManager::check_quota_available`]
//! and then [`QuotaManager::reserve_quota`] immediately before the expensive
//! call, or use [`QuotaManager::try_reserve_quota`] to do both under one lock.
//! Exhaustion is never an error; callers decide whether to wait, skip or
//! escalate.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics;

/// Quota limits.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Maximum operations per calendar day (UTC)
    pub daily_limit: u64,
    /// Maximum operations per wall-clock minute
    pub per_minute_limit: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 15_000,
            per_minute_limit: 100,
        }
    }
}

/// Persistent quota counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub daily_usage: u64,
    pub per_minute_usage: u64,
    pub daily_limit: u64,
    pub per_minute_limit: u64,
    pub last_reset_date: NaiveDate,
    /// Minute bucket the per-minute counter belongs to
    #[serde(default)]
    pub minute_bucket: i64,
    /// Bumped on every reservation; orders state-file writes
    #[serde(skip)]
    revision: u64,
}

impl QuotaState {
    fn new(config: &QuotaConfig, now: DateTime<Utc>) -> Self {
        Self {
            daily_usage: 0,
            per_minute_usage: 0,
            daily_limit: config.daily_limit,
            per_minute_limit: config.per_minute_limit,
            last_reset_date: now.date_naive(),
            minute_bucket: minute_bucket(now),
            revision: 0,
        }
    }

    /// Reset counters whose window has passed.
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.last_reset_date != today {
            info!(
                previous = %self.last_reset_date,
                usage = self.daily_usage,
                "Daily quota window reset"
            );
            self.daily_usage = 0;
            self.last_reset_date = today;
        }

        let bucket = minute_bucket(now);
        if self.minute_bucket != bucket {
            self.per_minute_usage = 0;
            self.minute_bucket = bucket;
        }
    }

    fn fits(&self, cost: u64) -> bool {
        self.daily_usage.saturating_add(cost) <= self.daily_limit
            && self.per_minute_usage.saturating_add(cost) <= self.per_minute_limit
    }
}

/// Usage snapshot for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub daily_usage: u64,
    pub daily_limit: u64,
    pub daily_remaining: u64,
    pub daily_percentage: f64,
    pub per_minute_usage: u64,
    pub per_minute_limit: u64,
    pub per_minute_remaining: u64,
    pub last_reset_date: NaiveDate,
}

/// Quota manager shared by every caller of the external API.
pub struct QuotaManager {
    state: Mutex<QuotaState>,
    state_path: Option<PathBuf>,
    /// Revision last written to `state_path`
    persisted: Mutex<u64>,
}

impl QuotaManager {
    /// Create an in-memory quota manager.
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            state: Mutex::new(QuotaState::new(&config, Utc::now())),
            state_path: None,
            persisted: Mutex::new(0),
        }
    }

    /// Create a quota manager persisted to a JSON state file.
    ///
    /// An existing file restores today's counters; configured limits always
    /// win over the limits stored in the file.
    pub fn with_state_file(config: QuotaConfig, path: &Path) -> Result<Self> {
        let mut state = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<QuotaState>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                QuotaState::new(&config, Utc::now())
            }
            Err(e) => return Err(e.into()),
        };
        state.daily_limit = config.daily_limit;
        state.per_minute_limit = config.per_minute_limit;

        debug!(path = %path.display(), usage = state.daily_usage, "Loaded quota state");

        Ok(Self {
            state: Mutex::new(state),
            state_path: Some(path.to_path_buf()),
            persisted: Mutex::new(0),
        })
    }

    /// Check whether `cost` operations would currently be admitted.
    ///
    /// Does not consume anything.
    pub fn check_quota_available(&self, cost: u64) -> bool {
        self.check_at(cost, Utc::now())
    }

    /// Consume `cost` operations from both windows.
    pub fn reserve_quota(&self, cost: u64) {
        self.reserve_at(cost, Utc::now())
    }

    /// Check and reserve atomically. Returns false when the quota is exhausted.
    pub fn try_reserve_quota(&self, cost: u64) -> bool {
        self.try_reserve_at(cost, Utc::now())
    }

    /// Wait until `cost` operations fit, then reserve them.
    ///
    /// Returns false if `max_wait` elapses first.
    pub async fn wait_for_quota(&self, cost: u64, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if self.try_reserve_quota(cost) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let poll = Duration::from_secs(1).min(deadline - now);
            tokio::time::sleep(poll).await;
        }
    }

    /// Current usage, remaining budget and daily percentage.
    pub fn get_quota_status(&self) -> QuotaStatus {
        self.status_at(Utc::now())
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_at(&self, cost: u64, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        state.roll_windows(now);
        state.fits(cost)
    }

    fn reserve_at(&self, cost: u64, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.roll_windows(now);
        state.daily_usage = state.daily_usage.saturating_add(cost);
        state.per_minute_usage = state.per_minute_usage.saturating_add(cost);
        metrics::record_quota_reserved(cost);
        state.revision += 1;
        let snapshot = state.clone();
        drop(state);
        self.persist(snapshot);
    }

    fn try_reserve_at(&self, cost: u64, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        state.roll_windows(now);
        if !state.fits(cost) {
            metrics::record_quota_rejected();
            debug!(
                cost,
                daily_usage = state.daily_usage,
                per_minute_usage = state.per_minute_usage,
                "Quota reservation refused"
            );
            return false;
        }
        state.daily_usage = state.daily_usage.saturating_add(cost);
        state.per_minute_usage = state.per_minute_usage.saturating_add(cost);
        metrics::record_quota_reserved(cost);
        state.revision += 1;
        let snapshot = state.clone();
        drop(state);
        self.persist(snapshot);
        true
    }

    fn status_at(&self, now: DateTime<Utc>) -> QuotaStatus {
        let mut state = self.lock();
        state.roll_windows(now);
        let daily_percentage = if state.daily_limit == 0 {
            100.0
        } else {
            (state.daily_usage as f64 / state.daily_limit as f64) * 100.0
        };
        QuotaStatus {
            daily_usage: state.daily_usage,
            daily_limit: state.daily_limit,
            daily_remaining: state.daily_limit.saturating_sub(state.daily_usage),
            daily_percentage,
            per_minute_usage: state.per_minute_usage,
            per_minute_limit: state.per_minute_limit,
            per_minute_remaining: state.per_minute_limit.saturating_sub(state.per_minute_usage),
            last_reset_date: state.last_reset_date,
        }
    }

    /// Write a snapshot taken after the counter lock was released.
    ///
    /// Snapshots older than the last one written are skipped, so concurrent
    /// reservations never leave a stale file behind.
    fn persist(&self, snapshot: QuotaState) {
        let Some(path) = &self.state_path else {
            return;
        };
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if snapshot.revision <= *persisted {
            return;
        }
        let tmp = path.with_extension("json.tmp");
        let written = serde_json::to_string_pretty(&snapshot)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&tmp, json))
            .and_then(|_| std::fs::rename(&tmp, path));
        match written {
            Ok(()) => *persisted = snapshot.revision,
            Err(e) => warn!(path = %path.display(), "Failed to persist quota state: {}", e),
        }
    }
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new(QuotaConfig::default())
    }
}

fn minute_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(60)
}
