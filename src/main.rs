use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use adflow::analysis::AnalysisRegistry;
use adflow::config::Config;
use adflow::engine::{AnalyzerExecutor, FallbackDataSource, QuotaManager};
use adflow::shutdown::ShutdownCoordinator;
use adflow::storage::{ExecutionQuery, ExecutionStatus, SqliteStorage, WorkflowExecution};
use adflow::workflow::{parse_definition_file, AnalyzerStep, StepRegistry, WorkflowOrchestrator};

/// Upper bound for a foreground run; executions normally settle long before.
const FOREGROUND_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Parser)]
#[command(name = "adflow")]
#[command(about = "Execution core for marketing-analytics workflows", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to <config_dir>/adflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workflow definitions
    Definitions {
        #[command(subcommand)]
        action: DefinitionActions,
    },
    /// Run workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowActions,
    },
    /// Inspect and control executions
    Executions {
        #[command(subcommand)]
        action: ExecutionActions,
    },
    /// Inspect API quota usage
    Quota {
        #[command(subcommand)]
        action: QuotaActions,
    },
}

#[derive(Subcommand)]
enum DefinitionActions {
    /// Create or update a definition from a YAML or JSON file
    Create {
        /// Path to definition file
        file: String,
    },
    /// List all definitions
    List,
    /// Show a definition
    Show {
        /// Definition name
        name: String,
    },
    /// Enable a definition
    Enable {
        /// Definition name
        name: String,
    },
    /// Disable a definition
    Disable {
        /// Definition name
        name: String,
    },
}

#[derive(Subcommand)]
enum WorkflowActions {
    /// Start a workflow for a customer and drive it until it settles
    Start {
        /// Definition name
        name: String,
        /// Customer account id
        #[arg(long)]
        customer: String,
        /// Initial context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Subcommand)]
enum ExecutionActions {
    /// Show an execution and its step records
    Show {
        /// Execution ID
        execution_id: String,
    },
    /// List executions
    List {
        /// Customer filter
        #[arg(long)]
        customer: Option<String>,
        /// Workflow filter
        #[arg(long)]
        workflow: Option<String>,
        /// Status filter: pending|running|paused|completed|cancelled|failed
        #[arg(long)]
        status: Option<String>,
        /// Page size
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Offset for pagination
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Pause a pending or running execution
    Pause {
        /// Execution ID
        execution_id: String,
    },
    /// Resume a paused execution and drive it until it settles
    Resume {
        /// Execution ID
        execution_id: String,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Cancel an execution, including one left running by a process that died
    Cancel {
        /// Execution ID
        execution_id: String,
    },
}

#[derive(Subcommand)]
enum QuotaActions {
    /// Show current daily and per-minute usage
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    adflow::telemetry::init_logging(&config.logging);
    if let Err(e) = adflow::metrics::init_metrics() {
        tracing::warn!("Failed to install metrics recorder: {}", e);
    }

    match cli.command {
        Commands::Definitions { action } => match action {
            DefinitionActions::Create { file } => cmd_definitions_create(&config, &file).await?,
            DefinitionActions::List => cmd_definitions_list(&config).await?,
            DefinitionActions::Show { name } => cmd_definitions_show(&config, &name).await?,
            DefinitionActions::Enable { name } => {
                cmd_definitions_toggle(&config, &name, true).await?
            }
            DefinitionActions::Disable { name } => {
                cmd_definitions_toggle(&config, &name, false).await?
            }
        },
        Commands::Workflows { action } => match action {
            WorkflowActions::Start {
                name,
                customer,
                context,
                metrics,
            } => cmd_workflows_start(&config, &name, &customer, context.as_deref(), metrics).await?,
        },
        Commands::Executions { action } => match action {
            ExecutionActions::Show { execution_id } => {
                cmd_executions_show(&config, &execution_id).await?
            }
            ExecutionActions::List {
                customer,
                workflow,
                status,
                limit,
                offset,
            } => {
                let status = status
                    .as_deref()
                    .map(str::parse::<ExecutionStatus>)
                    .transpose()
                    .map_err(|e| anyhow::anyhow!(e))?;
                let query = ExecutionQuery {
                    customer_id: customer,
                    workflow_name: workflow,
                    status,
                    limit,
                    offset,
                };
                cmd_executions_list(&config, &query).await?
            }
            ExecutionActions::Pause { execution_id } => {
                cmd_executions_pause(&config, &execution_id).await?
            }
            ExecutionActions::Resume {
                execution_id,
                metrics,
            } => cmd_executions_resume(&config, &execution_id, metrics).await?,
            ExecutionActions::Cancel { execution_id } => {
                cmd_executions_cancel(&config, &execution_id).await?
            }
        },
        Commands::Quota { action } => match action {
            QuotaActions::Status => cmd_quota_status(&config)?,
        },
    }

    Ok(())
}

// ============================================================================
// Definition Commands
// ============================================================================

async fn cmd_definitions_create(config: &Config, file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let spec = parse_definition_file(path)?;
    let orchestrator = get_orchestrator(config)?;
    let definition = orchestrator.create_workflow_definition(spec).await?;

    println!(
        "✓ Definition '{}' saved (version {})",
        definition.name, definition.version
    );
    println!();
    println!("  Steps: {}", definition.steps.len());
    println!();
    println!(
        "Start with: adflow workflows start {} --customer <id>",
        definition.name
    );

    Ok(())
}

async fn cmd_definitions_list(config: &Config) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let definitions = storage.list_definitions().await?;

    if definitions.is_empty() {
        println!("No definitions found.");
        println!();
        println!("Create one with: adflow definitions create <file.yaml>");
        return Ok(());
    }

    println!(
        "{:<30} {:<8} {:<8} {:<8} {:<20}",
        "NAME", "VERSION", "STEPS", "ENABLED", "UPDATED"
    );
    println!("{}", "-".repeat(78));

    for definition in definitions {
        println!(
            "{:<30} {:<8} {:<8} {:<8} {:<20}",
            definition.name,
            definition.version,
            definition.steps.len(),
            if definition.enabled { "yes" } else { "no" },
            definition.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

async fn cmd_definitions_show(config: &Config, name: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let definition = storage
        .get_definition(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Definition not found: {}", name))?;

    print!("{}", serde_yaml::to_string(&definition)?);
    Ok(())
}

async fn cmd_definitions_toggle(config: &Config, name: &str, enabled: bool) -> anyhow::Result<()> {
    let orchestrator = get_orchestrator(config)?;
    orchestrator.set_definition_enabled(name, enabled).await?;
    println!(
        "✓ Definition '{}' {}",
        name,
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

// ============================================================================
// Workflow Commands
// ============================================================================

async fn cmd_workflows_start(
    config: &Config,
    name: &str,
    customer: &str,
    context: Option<&str>,
    print_metrics: bool,
) -> anyhow::Result<()> {
    let initial = parse_context(context)?;
    let orchestrator = get_orchestrator(config)?;
    orchestrator.shutdown_coordinator().start_signal_listener();
    orchestrator.start_cleanup_task();

    let execution = orchestrator.start_workflow(name, customer, initial).await?;
    println!("Started execution {}", execution.id);

    run_in_foreground(&orchestrator, &execution.id, print_metrics).await
}

// ============================================================================
// Execution Commands
// ============================================================================

async fn cmd_executions_show(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let execution = storage
        .get_execution(execution_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Execution not found: {}", execution_id))?;
    let steps = storage.get_steps(execution_id).await?;

    print_execution(&execution);
    if !execution.context.is_empty() {
        println!();
        println!("Context:");
        println!("{}", serde_json::to_string_pretty(&execution.context)?);
    }

    if !steps.is_empty() {
        println!();
        println!(
            "{:<4} {:<24} {:<10} {:<8} {:<20}",
            "#", "STEP", "STATUS", "RETRIES", "STARTED"
        );
        println!("{}", "-".repeat(70));
        for step in steps {
            println!(
                "{:<4} {:<24} {:<10} {:<8} {:<20}",
                step.position,
                step.step_name,
                step.status.to_string(),
                step.retry_count,
                step.started_at.format("%Y-%m-%d %H:%M:%S")
            );
            if let Some(error) = &step.error {
                println!("     error: {}", error);
            }
        }
    }

    Ok(())
}

async fn cmd_executions_list(config: &Config, query: &ExecutionQuery) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let executions = storage.query_executions(query).await?;

    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<16} {:<10} {:<6} {:<20}",
        "EXECUTION ID", "WORKFLOW", "CUSTOMER", "STATUS", "STEP", "STARTED"
    );
    println!("{}", "-".repeat(112));

    for execution in executions {
        println!(
            "{:<36} {:<20} {:<16} {:<10} {:<6} {:<20}",
            execution.id,
            execution.workflow_name,
            execution.customer_id,
            execution.status.to_string(),
            format!("{}/{}", execution.current_step, execution.steps.len()),
            execution.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn cmd_executions_pause(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let orchestrator = get_orchestrator(config)?;
    let execution = orchestrator.pause_workflow(execution_id).await?;
    println!(
        "✓ Execution {} paused at step {}",
        execution.id, execution.current_step
    );
    Ok(())
}

async fn cmd_executions_resume(
    config: &Config,
    execution_id: &str,
    print_metrics: bool,
) -> anyhow::Result<()> {
    let orchestrator = get_orchestrator(config)?;
    orchestrator.shutdown_coordinator().start_signal_listener();
    orchestrator.start_cleanup_task();

    let execution = orchestrator.resume_workflow(execution_id).await?;
    println!(
        "Resumed execution {} at step {}",
        execution.id, execution.current_step
    );

    run_in_foreground(&orchestrator, execution_id, print_metrics).await
}

async fn cmd_executions_cancel(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let orchestrator = get_orchestrator(config)?;
    let execution = orchestrator.cancel_workflow(execution_id).await?;
    println!("✓ Execution {} cancelled", execution.id);
    Ok(())
}

// ============================================================================
// Quota Commands
// ============================================================================

fn cmd_quota_status(config: &Config) -> anyhow::Result<()> {
    let status = get_quota(config)?.get_quota_status();

    println!("Quota ({}):", status.last_reset_date);
    println!(
        "  Daily:      {} / {} ({:.1}% used, {} remaining)",
        status.daily_usage, status.daily_limit, status.daily_percentage, status.daily_remaining
    );
    println!(
        "  Per minute: {} / {} ({} remaining)",
        status.per_minute_usage, status.per_minute_limit, status.per_minute_remaining
    );
    if config.quota.state_path.is_none() {
        println!();
        println!("  (no quota.state_path configured; usage is not persisted)");
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Executions run inside this process, so the CLI drives them to a settled
/// state. Ctrl+C parks the execution as paused at the next step boundary.
async fn run_in_foreground(
    orchestrator: &WorkflowOrchestrator,
    execution_id: &str,
    print_metrics: bool,
) -> anyhow::Result<()> {
    let settled = orchestrator
        .wait_until_settled(execution_id, FOREGROUND_TIMEOUT)
        .await;
    orchestrator.shutdown().await;
    let execution = settled?;

    println!();
    print_execution(&execution);
    if print_metrics {
        println!();
        print!("{}", adflow::metrics::render_metrics());
    }

    match execution.status {
        ExecutionStatus::Completed => Ok(()),
        ExecutionStatus::Paused => {
            println!();
            println!("Resume with: adflow executions resume {}", execution.id);
            Ok(())
        }
        status => anyhow::bail!("Execution {} finished as {}", execution.id, status),
    }
}

fn print_execution(execution: &WorkflowExecution) {
    println!("Execution: {}", execution.id);
    println!("  Workflow: {}", execution.workflow_name);
    println!("  Customer: {}", execution.customer_id);
    println!("  Status:   {}", execution.status);
    println!(
        "  Step:     {}/{}",
        execution.current_step,
        execution.steps.len()
    );
    println!(
        "  Started:  {}",
        execution.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed_at) = execution.completed_at {
        println!("  Finished: {}", completed_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if execution.retry_count > 0 {
        println!("  Retries:  {}", execution.retry_count);
    }
    if let Some(error) = &execution.error {
        println!("  Error:    {}", error);
    }
}

fn parse_context(context: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    match context {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("--context must be a JSON object"),
        },
    }
}

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&db_path)?)
}

fn get_quota(config: &Config) -> anyhow::Result<QuotaManager> {
    Ok(match &config.quota.state_path {
        Some(path) => QuotaManager::with_state_file(config.quota_config(), path)?,
        None => QuotaManager::new(config.quota_config()),
    })
}

/// Wire the orchestrator with the built-in analyzer step.
///
/// No analysis units ship with the binary; applications embedding adflow
/// register their own through [`AnalysisRegistry`].
fn get_orchestrator(config: &Config) -> anyhow::Result<WorkflowOrchestrator> {
    let storage = get_storage(config)?;
    let shutdown = ShutdownCoordinator::new();

    let executor = AnalyzerExecutor::new(config.executor_config())
        .with_fallback(FallbackDataSource::new(storage.clone()))
        .with_quota(Arc::new(get_quota(config)?))
        .with_shutdown(shutdown.clone());

    let mut steps = StepRegistry::new();
    steps.register(Arc::new(AnalyzerStep::new(
        executor,
        AnalysisRegistry::new(),
        config.output_dir(),
    )));

    Ok(WorkflowOrchestrator::with_shutdown(
        storage,
        steps,
        config.orchestrator_config(),
        shutdown,
    ))
}
