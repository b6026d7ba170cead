//! Analyzer execution engine: quota, fallback, output artifacts and the executor.

pub mod analyzer;
pub mod fallback;
pub mod output;
pub mod quota;

pub use analyzer::{AnalyzerExecutor, ExecutionOutcome, ExecutorConfig, EMPTY_RESULT_MESSAGE};
pub use fallback::{synthesize_partial_result, FallbackDataSource};
pub use output::{error_artifact_path, validate_output, ResultSource, MIN_OUTPUT_BYTES};
pub use quota::{QuotaConfig, QuotaManager, QuotaStatus};
