//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docflow_core::client::HttpJobClient;
use docflow_core::executor::{ExecutionObserver, ExecutionOutcome, Executor};
use docflow_shared::{
    AppConfig, DocflowError, DocumentRef, ExecutionId, RequestId, StartRequest, WorkflowConfig,
    WorkflowState, expand_home, init_config, load_config,
};
use docflow_storage::{ObjectStore, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docflow: durable document analysis workflows.
#[derive(Parser)]
#[command(
    name = "docflow",
    version,
    about = "Submit documents for analysis and persist every result page.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start a workflow for a stored document and run it to completion.
    Run {
        /// Container (bucket) holding the document.
        container: String,

        /// Object key of the document.
        key: String,

        /// Correlation id; reusing one returns the existing execution.
        #[arg(long)]
        request_id: Option<String>,

        /// Register the execution without running it.
        #[arg(long)]
        detach: bool,
    },

    /// Resume an interrupted execution, or every pending one.
    Resume {
        /// Execution to resume.
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        execution_id: Option<String>,

        /// Resume every non-terminal execution.
        #[arg(long)]
        all: bool,
    },

    /// Show the checkpoint and history of an execution.
    Status {
        /// Execution to inspect.
        execution_id: String,
    },

    /// List all executions.
    List,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docflow=info",
        1 => "docflow=debug",
        _ => "docflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            container,
            key,
            request_id,
            detach,
        } => cmd_run(container, key, request_id, detach).await,
        Command::Resume { execution_id, all } => cmd_resume(execution_id.as_deref(), all).await,
        Command::Status { execution_id } => cmd_status(&execution_id).await,
        Command::List => cmd_list().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.storage.database)?;
    Ok(Arc::new(Storage::open(&path).await?))
}

type CliExecutor = Executor<HttpJobClient, ObjectStore>;

/// Build the executor. With `show_progress`, also returns the spinner the
/// caller clears once every execution it drives has returned.
async fn build_executor(
    config: &AppConfig,
    show_progress: bool,
) -> Result<(CliExecutor, Option<Arc<CliProgress>>)> {
    let client = HttpJobClient::new(&config.analysis)?;
    let objects = ObjectStore::new(expand_home(&config.storage.objects_dir)?);
    let storage = open_storage(config).await?;

    let executor = Executor::new(
        Arc::new(client),
        Arc::new(objects),
        storage,
        WorkflowConfig::from(config),
    );
    if show_progress {
        let progress = Arc::new(CliProgress::new());
        Ok((executor.with_observer(progress.clone()), Some(progress)))
    } else {
        Ok((executor, None))
    }
}

fn clear_progress(progress: Option<Arc<CliProgress>>) {
    if let Some(progress) = progress {
        progress.done();
    }
}

fn parse_execution_id(raw: &str) -> Result<ExecutionId> {
    raw.parse()
        .map_err(|e| eyre!("invalid execution id '{raw}': {e}"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    container: String,
    key: String,
    request_id: Option<String>,
    detach: bool,
) -> Result<()> {
    let config = load_config()?;
    let (executor, progress) = build_executor(&config, !detach).await?;

    let request = StartRequest {
        request_id: request_id.map(RequestId).unwrap_or_else(RequestId::generate),
        document: DocumentRef::new(container, key),
    };
    info!(
        request_id = %request.request_id,
        document = %request.document,
        detach,
        "starting workflow"
    );

    let record = executor.start(request).await?;
    if detach {
        println!("{}", record.id);
        return Ok(());
    }

    let outcome = executor.run(&record.id).await;
    clear_progress(progress);
    let outcome = outcome?;
    print_outcome(&outcome, &config);
    finish(&outcome)
}

async fn cmd_resume(execution_id: Option<&str>, all: bool) -> Result<()> {
    let config = load_config()?;
    let single = match (all, execution_id) {
        (true, _) => None,
        (false, Some(raw)) => Some(parse_execution_id(raw)?),
        (false, None) => return Err(eyre!("an execution id or --all is required")),
    };
    let (executor, progress) = build_executor(&config, true).await?;

    let Some(id) = single else {
        let report = executor.resume_pending().await;
        clear_progress(progress);
        let report = report?;
        for outcome in &report.outcomes {
            print_outcome(outcome, &config);
        }
        for (id, error) in &report.errors {
            eprintln!("  {id}: {error}");
        }
        println!(
            "Resumed {} execution(s): {} succeeded, {} failed, {} aborted",
            report.outcomes.len() + report.errors.len(),
            report.outcomes.iter().filter(|o| o.is_success()).count(),
            report.outcomes.iter().filter(|o| !o.is_success()).count(),
            report.errors.len(),
        );
        return Ok(());
    };

    let outcome = executor.run(&id).await;
    clear_progress(progress);
    let outcome = outcome?;
    print_outcome(&outcome, &config);
    finish(&outcome)
}

async fn cmd_status(execution_id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let id = parse_execution_id(execution_id)?;

    let record = storage
        .get_execution(&id)
        .await?
        .ok_or_else(|| eyre!("no execution with id {id}"))?;

    println!();
    println!("  Execution: {}", record.id);
    println!("  Request:   {}", record.request_id);
    println!("  Document:  {}", record.context.document);
    println!("  State:     {}", record.state);
    println!("  Attempt:   {}", record.attempt);
    if let Some(at) = record.resume_at {
        println!("  Resume at: {}", at.to_rfc3339());
    }
    if let Some(error) = &record.error {
        println!("  Error:     {error}");
    }
    println!();
    println!("  Context:");
    println!("{}", serde_json::to_string_pretty(&record.context)?);
    println!();
    println!("  History:");
    for event in storage.list_events(&id).await? {
        match &event.detail {
            Some(detail) => println!(
                "    {}  {:<15} {:<16} {detail}",
                event.at, event.state, event.kind
            ),
            None => println!("    {}  {:<15} {}", event.at, event.state, event.kind),
        }
    }
    println!();
    Ok(())
}

async fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let executions = storage.list_executions().await?;

    if executions.is_empty() {
        println!("No executions yet. Start one with `docflow run <container> <key>`.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<14}  {:<20}  DOCUMENT",
        "EXECUTION", "STATE", "UPDATED"
    );
    for record in executions {
        println!(
            "{:<36}  {:<14}  {:<20}  {}",
            record.id,
            record.state,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
            record.context.document,
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn print_outcome(outcome: &ExecutionOutcome, config: &AppConfig) {
    println!();
    match outcome.state {
        WorkflowState::Success => println!("  Workflow succeeded!"),
        _ => println!("  Workflow failed."),
    }
    println!("  Execution: {}", outcome.execution_id);
    println!("  Request:   {}", outcome.request_id);
    println!("  Document:  {}", outcome.context.document);
    if let Some(job_id) = &outcome.context.job_id {
        println!("  Job:       {job_id}");
    }
    if outcome.is_success() {
        let objects_dir = expand_home(&config.storage.objects_dir)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| config.storage.objects_dir.clone());
        println!(
            "  Results:   {}",
            results_pattern(&objects_dir, &outcome.context.document)
        );
    }
    if let Some(error) = &outcome.error {
        println!("  Error:     {error}");
    }
    println!();
}

fn results_pattern(objects_dir: &str, document: &DocumentRef) -> String {
    format!(
        "{}/{}/{}_raw_<n>.json",
        objects_dir.trim_end_matches('/'),
        document.container,
        document.key
    )
}

fn finish(outcome: &ExecutionOutcome) -> Result<()> {
    if outcome.is_success() {
        Ok(())
    } else {
        Err(eyre!(
            "execution {} ended in {}",
            outcome.execution_id,
            outcome.state
        ))
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
///
/// One spinner is shared by every execution a command drives, so a finished
/// execution prints a line and leaves the spinner running for the others.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn done(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ExecutionObserver for CliProgress {
    fn state_entered(&self, execution_id: &ExecutionId, state: WorkflowState) {
        let message = match state {
            WorkflowState::Initialize => "Submitting analysis job",
            WorkflowState::Wait => "Waiting for the job to finish",
            WorkflowState::ProcessResults => "Checking job status",
            WorkflowState::Decide => "Deciding next step",
            WorkflowState::Success => "Done",
            WorkflowState::Failure => "Failed",
        };
        self.spinner.set_message(format!("[{execution_id}] {message}"));
    }

    fn step_failed(
        &self,
        _execution_id: &ExecutionId,
        state: WorkflowState,
        error: &DocflowError,
        retry_in: Option<Duration>,
    ) {
        let line = match retry_in {
            Some(delay) => format!("{state} failed ({error}), retrying in {delay:?}"),
            None => format!("{state} failed ({error})"),
        };
        self.spinner.println(line);
    }

    fn finished(&self, outcome: &ExecutionOutcome) {
        self.spinner
            .println(format!("[{}] {}", outcome.execution_id, outcome.state));
    }
}
