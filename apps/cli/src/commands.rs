//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use pubflow_core::{
    Admin, CheckpointEmitter, EntityTarget, OperationReport, Orchestrator, ProgressReporter,
    ResetFilter, RunSummary, StatusReport, discover_content,
};
use pubflow_shared::{AppConfig, RunConfig, WorkflowStep, init_config, load_config, load_config_from};
use pubflow_storage::StateStore;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// pubflow: track content through a fixed publishing pipeline.
#[derive(Parser)]
#[command(
    name = "pubflow",
    version,
    about = "Drive content entities through ingest, test, validate, publish and finalize steps.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// State document path (overrides `defaults.state_path`).
    #[arg(long, global = true, env = "PUBFLOW_STATE")]
    pub state: Option<PathBuf>,

    /// Config file path (defaults to ~/.pubflow/pubflow.toml).
    #[arg(long, global = true, env = "PUBFLOW_CONFIG")]
    pub config: Option<PathBuf>,

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
    /// Run every pending step batch.
    Run {
        /// Worker pool size per step batch.
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Show one entity, or a summary of the whole pipeline.
    Status {
        /// Entity id.
        id: Option<String>,
    },

    /// Move a failed step back to pending.
    Retry {
        /// Step to retry.
        step: String,

        /// Entity id.
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        entity: Option<String>,

        /// Retry every entity failed at the step.
        #[arg(long)]
        all: bool,
    },

    /// List entities that the next run will continue.
    Resume,

    /// Skip earlier steps and reopen from STEP.
    SkipTo {
        /// Step to continue from.
        step: String,

        /// Entity id.
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        entity: Option<String>,

        /// Every entity that is behind STEP.
        #[arg(long)]
        all: bool,
    },

    /// Force STEP and later steps back to pending, clearing attempt counters.
    Reset {
        /// First step to clear.
        step: String,

        /// Glob over entity ids (e.g. `guides/**`).
        #[arg(long)]
        filter: Option<String>,

        /// Only entities that are failed or blocked.
        #[arg(long)]
        only_failed: bool,
    },

    /// Force a stuck running step to completed.
    Complete {
        /// Entity id.
        id: String,
    },

    /// Force a stuck running step to failed.
    Fail {
        /// Entity id.
        id: String,

        /// Failure reason recorded on the step.
        #[arg(long)]
        reason: String,
    },

    /// Start tracking a new entity.
    Add {
        /// Entity id.
        id: String,

        /// Metadata as a JSON value, handed to executors unchanged.
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Track existing content under DIR as already finalized.
    Migrate {
        /// Content root directory.
        dir: PathBuf,

        /// File extensions to import (repeatable).
        #[arg(long = "ext", default_value = "md")]
        extensions: Vec<String>,
    },

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
        0 => "pubflow=info",
        1 => "pubflow=debug",
        _ => "pubflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

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
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&cli),
        };
    }

    let app = resolve_config(&cli)?;
    let mut config = RunConfig::try_from(&app)?;
    if let Some(state) = &cli.state {
        config.state_path = state.clone();
    }

    match cli.command {
        Command::Run { concurrency } => {
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            cmd_run(&config).await
        }
        Command::Status { id } => cmd_status(&config, id.as_deref()),
        Command::Retry { step, entity, all } => {
            let report = admin(&config).retry(&step, entity.as_deref(), all)?;
            print_report(&report);
            Ok(())
        }
        Command::Resume => cmd_resume(&config),
        Command::SkipTo { step, entity, all } => {
            let target = match (entity, all) {
                (Some(id), false) => EntityTarget::One(id),
                (None, true) => EntityTarget::All,
                _ => return Err(eyre!("skip-to needs exactly one of --entity or --all")),
            };
            let report = admin(&config).skip_to(&step, target)?;
            print_report(&report);
            Ok(())
        }
        Command::Reset {
            step,
            filter,
            only_failed,
        } => {
            let report = admin(&config).reset(
                &step,
                &ResetFilter {
                    pattern: filter,
                    only_failed,
                },
            )?;
            print_report(&report);
            Ok(())
        }
        Command::Complete { id } => {
            print_report(&admin(&config).complete(&id)?);
            Ok(())
        }
        Command::Fail { id, reason } => {
            print_report(&admin(&config).fail(&id, &reason)?);
            Ok(())
        }
        Command::Add { id, metadata } => {
            let metadata = match metadata {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| eyre!("--metadata is not valid JSON: {e}"))?,
                None => serde_json::json!({}),
            };
            print_report(&admin(&config).register(&id, metadata)?);
            Ok(())
        }
        Command::Migrate { dir, extensions } => cmd_migrate(&config, &dir, &extensions),
        Command::Config { .. } => Ok(()),
    }
}

/// Config file from `--config`, or the user config (defaults if absent).
fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn admin(config: &RunConfig) -> Admin {
    Admin::new(StateStore::open(&config.state_path))
        .with_emitter(CheckpointEmitter::from_config(config))
}

fn print_report(report: &OperationReport) {
    println!("{}", report.message);
    for id in &report.entities {
        println!("  {id}");
    }
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.entity_id, skipped.reason);
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &RunConfig) -> Result<()> {
    info!(
        state = %config.state_path.display(),
        concurrency = config.concurrency,
        executors = config.executors.len(),
        "starting pipeline run"
    );

    let orchestrator = Orchestrator::from_config(config);
    let reporter = CliProgress::new();
    let summary = orchestrator.run(&reporter).await?;

    println!();
    println!("  Run {}", summary.run_id);
    for entry in &summary.steps {
        println!(
            "  {:<10} processed {:>4}  succeeded {:>4}  failed {:>4}  ({} ms)",
            entry.step.as_str(),
            entry.processed,
            entry.succeeded,
            entry.failed,
            entry.duration_ms
        );
    }
    if summary.steps.is_empty() {
        println!("  Nothing pending.");
    }
    for failure in &summary.failures {
        println!("  failed: {failure}");
    }
    for error in summary.stuck_errors() {
        println!("  stuck:  {error}");
    }
    println!("  Time:   {:.1}s", summary.duration.as_secs_f64());
    println!();

    if summary.is_clean() {
        Ok(())
    } else {
        Err(eyre!(
            "{} entities failed and {} are stuck",
            summary.failures.len(),
            summary.stuck.len()
        ))
    }
}

fn cmd_status(config: &RunConfig, id: Option<&str>) -> Result<()> {
    let admin = Admin::new(StateStore::open_readonly(&config.state_path));

    match admin.status(id)? {
        StatusReport::Entity(entity) => {
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
        StatusReport::Summary(summary) => {
            println!("  Entities: {}", summary.total);
            for (status, count) in &summary.by_status {
                println!("    {:<12} {count}", status.to_string());
            }
            println!("  Waiting at:");
            for step in WorkflowStep::ALL {
                let count = summary.by_step.get(&step).copied().unwrap_or(0);
                println!("    {:<12} {count}", step.as_str());
            }
            for (id, step, status) in &summary.attention {
                println!("  {status}: {id} at {step}");
            }
            for id in &summary.stuck {
                println!("  stuck: {id} (resolve with complete or fail)");
            }
            if let Some(batch) = &summary.last_batch {
                println!(
                    "  Last batch: {} at {} ({} processed, {} failed)",
                    batch.step, batch.timestamp, batch.processed, batch.failed
                );
            }
        }
    }
    Ok(())
}

fn cmd_resume(config: &RunConfig) -> Result<()> {
    let report = Admin::new(StateStore::open_readonly(&config.state_path)).resume()?;
    println!("{}", report.message);
    for entry in &report.ready {
        println!("  {} at {}", entry.entity_id, entry.step);
    }
    for id in &report.stuck {
        println!("  stuck: {id}");
    }
    Ok(())
}

fn cmd_migrate(config: &RunConfig, dir: &Path, extensions: &[String]) -> Result<()> {
    if !dir.is_dir() {
        return Err(eyre!("'{}' is not a directory", dir.display()));
    }
    let items = discover_content(dir, extensions)?;
    info!(dir = %dir.display(), found = items.len(), "importing existing content");
    print_report(&admin(config).migrate(items)?);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(cli: &Cli) -> Result<()> {
    let config = resolve_config(cli)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn step_started(&self, step: WorkflowStep, total: usize) {
        self.spinner.set_message(format!("{step}: dispatching {total} entities"));
    }

    fn entity_finished(&self, entity_id: &str, step: WorkflowStep, ok: bool, current: usize, total: usize) {
        let mark = if ok { "ok" } else { "failed" };
        self.spinner
            .set_message(format!("{step} [{current}/{total}] {entity_id} {mark}"));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}
