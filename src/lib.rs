//! adflow - execution core for scheduled marketing-analytics workflows
//!
//! adflow runs pluggable analysis units against an advertising API under a
//! shared quota, and strings them together into durable, per-customer
//! workflows.
//!
//! ## Key Features
//!
//! - **Resilient analyzer runs**: per-attempt timeouts, exponential backoff,
//!   validated JSON output, cached fallback results and `_ERROR` artifacts
//! - **Quota accounting**: daily and per-minute API budgets, optionally
//!   persisted across restarts
//! - **Durable workflows**: start, pause, resume and cancel, with one live
//!   execution per workflow and customer
//! - **Structured errors**: stable error codes for schedulers and dashboards
//!
//! ## Example
//!
//! ```yaml
//! name: weekly-audit
//! description: Weekly account health review
//!
//! steps:
//!   - name: pacing
//!     service: analyzer
//!     retry_count: 1
//!     config:
//!       unit: budget_pacing
//!
//!   - name: waste
//!     service: analyzer
//!     config:
//!       unit: keyword_waste
//!       timeout_seconds: 120
//! ```

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod workflow;

pub use error::{Error, Result};
