//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::StepSpec;

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    /// Pending and running executions hold the per-customer concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Step record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

/// Durable record of one workflow run for one customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_definition_id: String,
    pub workflow_name: String,
    pub customer_id: String,
    pub status: ExecutionStatus,
    /// Index of the next step to run
    pub current_step: u32,
    pub context: Map<String, Value>,
    /// Step list captured when the execution was created
    pub steps: Vec<StepSpec>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Execution record for a single step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub execution_id: String,
    pub step_name: String,
    pub position: u32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl WorkflowStep {
    /// Create a pending step record.
    pub fn pending(execution_id: &str, step_name: &str, position: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_name: step_name.to_string(),
            position,
            status: StepStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            error: None,
        }
    }
}

/// Cached successful unit result used for degraded-mode fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSnapshot {
    pub unit_name: String,
    pub subject_id: String,
    pub result: Value,
    pub cached_at: DateTime<Utc>,
}

/// Query filters for execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub customer_id: Option<String>,
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            customer_id: None,
            workflow_name: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}
