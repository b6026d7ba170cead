//! Output and error artifacts.
//!
//! Every analyzer run leaves exactly one artifact behind: a validated result
//! document at the requested path, or an `_ERROR` document next to it. A
//! result document is written to a temporary sibling, renamed into place and
//! re-read; if the re-read fails validation the file is removed, so a
//! truncated or zero-length result never survives.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::analysis::{AnalysisRequest, UnitResult};
use crate::error::{Error, Result};

/// Default minimum size of a valid result document, in bytes.
pub const MIN_OUTPUT_BYTES: u64 = 100;

/// Suffix appended to the file stem of error artifacts.
pub const ERROR_SUFFIX: &str = "_ERROR";

/// Where the content of a result document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Live,
    Fallback,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub degraded: bool,
    pub source: ResultSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub unit_name: String,
    pub subject_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub recommendations_count: usize,
}

/// Result document written for a unit run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDocument {
    pub execution_metadata: ExecutionMetadata,
    pub analysis_metadata: AnalysisMetadata,
    pub recommendations: Vec<Value>,
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub raw_data: Map<String, Value>,
}

impl OutputDocument {
    pub fn new(
        unit_name: &str,
        request: &AnalysisRequest,
        result: &UnitResult,
        execution_metadata: ExecutionMetadata,
    ) -> Self {
        Self {
            execution_metadata,
            analysis_metadata: AnalysisMetadata {
                unit_name: unit_name.to_string(),
                subject_id: request.subject_id.clone(),
                start_date: request.start,
                end_date: request.end,
                recommendations_count: result.recommendations.len(),
            },
            recommendations: result.recommendations.clone(),
            metrics: result.metrics.clone(),
            raw_data: result.raw_data.clone(),
        }
    }
}

/// Error document written when a unit run fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDocument {
    pub error: String,
    pub error_type: String,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub unit_name: String,
    pub subject_id: String,
}

/// `report.json` -> `report_ERROR.json`
pub fn error_artifact_path(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let file_name = match output_path.extension() {
        Some(ext) => format!("{}{}.{}", stem, ERROR_SUFFIX, ext.to_string_lossy()),
        None => format!("{}{}", stem, ERROR_SUFFIX),
    };
    output_path.with_file_name(file_name)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Write a result document and verify it by reading it back.
///
/// On any failure no file is left at `path`.
pub async fn write_output(path: &Path, document: &OutputDocument, min_bytes: u64) -> Result<()> {
    ensure_parent(path).await?;
    let bytes = serde_json::to_vec_pretty(document)?;
    let tmp = temp_path(path);

    if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
        remove_quietly(&tmp).await;
        return Err(Error::Output(format!(
            "Failed to write {}: {}",
            tmp.display(),
            e
        )));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        remove_quietly(&tmp).await;
        return Err(Error::Output(format!(
            "Failed to move output into {}: {}",
            path.display(),
            e
        )));
    }

    if let Err(e) = validate_output(path, min_bytes).await {
        warn!(path = %path.display(), "Output failed validation, removing: {}", e);
        remove_quietly(path).await;
        return Err(e);
    }

    debug!(path = %path.display(), bytes = bytes.len(), "Output written and validated");
    Ok(())
}

/// Validate a written result document without modifying it.
///
/// The file must exist, be larger than `min_bytes`, and parse as a JSON
/// object carrying the document sections.
pub async fn validate_output(path: &Path, min_bytes: u64) -> Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| Error::Output(format!("Output file missing: {}", path.display())))?;

    if metadata.len() <= min_bytes {
        return Err(Error::Output(format!(
            "Output file too small: {} bytes (minimum {})",
            metadata.len(),
            min_bytes
        )));
    }

    let content = tokio::fs::read(path).await?;
    let value: Value = serde_json::from_slice(&content)
        .map_err(|e| Error::Output(format!("Output is not valid JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| Error::Output("Output is not a JSON object".to_string()))?;
    for section in ["execution_metadata", "analysis_metadata", "metrics"] {
        if !object.get(section).map(Value::is_object).unwrap_or(false) {
            return Err(Error::Output(format!("Output missing section '{}'", section)));
        }
    }
    if !object
        .get("recommendations")
        .map(Value::is_array)
        .unwrap_or(false)
    {
        return Err(Error::Output(
            "Output missing section 'recommendations'".to_string(),
        ));
    }

    Ok(())
}

/// Write an error document next to `output_path`. Returns its location.
pub async fn write_error_artifact(output_path: &Path, document: &ErrorDocument) -> Result<PathBuf> {
    let path = error_artifact_path(output_path);
    ensure_parent(&path).await?;
    tokio::fs::write(&path, serde_json::to_vec_pretty(document)?).await?;
    Ok(path)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove partial artifact: {}", e);
        }
    }
}
