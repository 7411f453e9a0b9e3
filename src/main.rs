//! # Diagram Contextualizer CLI (`dgx`)
//!
//! The `dgx` binary runs contextualization workflows and review commands
//! against the detection / annotation service configured in the TOML file.
//!
//! ## Usage
//!
//! ```bash
//! dgx --config ./config/dgx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dgx plan --workflow <file>` | Show the chunk plan of a workflow (offline) |
//! | `dgx run --workflow <file>` | Detect tags and reconcile them into annotations |
//! | `dgx approve <ids…>` | Confirm pending annotations of files |
//! | `dgx reject <ids…>` | Discard pending annotations of files |
//! | `dgx clear <ids…> --yes` | Delete every annotation of files |
//! | `dgx export <ids…>` | Render files with their confirmed annotations |
//! | `dgx label <ids…>` | Show derived label and annotation counts |
//!
//! Progress goes to stderr (`--progress`), logs go to stderr through
//! `RUST_LOG` / `--verbose`, results go to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use diagram_contextualizer::api::DiagramApi;
use diagram_contextualizer::batcher::JobBatcher;
use diagram_contextualizer::config::{self, Config};
use diagram_contextualizer::export::{ExportJobOrchestrator, ExportView};
use diagram_contextualizer::http::HttpApi;
use diagram_contextualizer::models::FileId;
use diagram_contextualizer::progress::{ProgressMode, ProgressReporter};
use diagram_contextualizer::review::{ReviewCommandProcessor, ReviewReport};
use diagram_contextualizer::workflow::{Workflow, WorkflowRunner};

/// Diagram Contextualizer CLI: detect tags in engineering diagrams, link them
/// to assets and files, and review the results.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dgx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dgx",
    about = "Diagram Contextualizer: detection jobs and annotation review for engineering diagrams",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dgx.toml")]
    config: PathBuf,

    /// Progress output on stderr.
    #[arg(long, global = true, value_enum, default_value = "auto")]
    progress: ProgressMode,

    /// Log at info level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print how a workflow would be chunked, without contacting the service.
    Plan {
        /// Workflow file (JSON).
        #[arg(long)]
        workflow: PathBuf,
    },

    /// Run a workflow: submit detection jobs, poll them, and reconcile results.
    ///
    /// Per-file and per-chunk failures are reported but do not change the
    /// exit code.
    Run {
        /// Workflow file (JSON).
        #[arg(long)]
        workflow: PathBuf,
    },

    /// Confirm every pending annotation of the given files.
    Approve {
        #[arg(required = true)]
        file_ids: Vec<FileId>,
    },

    /// Discard every pending annotation of the given files.
    Reject {
        #[arg(required = true)]
        file_ids: Vec<FileId>,
    },

    /// Delete all annotations of the given files and strip their labels.
    ///
    /// Irreversible; requires `--yes`.
    Clear {
        #[arg(required = true)]
        file_ids: Vec<FileId>,

        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Export files with their confirmed annotations baked in.
    Export {
        #[arg(required = true)]
        file_ids: Vec<FileId>,

        /// Name prefix for the exported artifacts (overrides `[export].prefix`).
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Show the label each file should carry, derived from its annotations.
    Label {
        #[arg(required = true)]
        file_ids: Vec<FileId>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn read_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
    Workflow::from_json(&content)
        .with_context(|| format!("Failed to parse workflow file: {}", path.display()))
}

fn connect(cfg: &Config) -> Result<Arc<dyn DiagramApi>> {
    let api = HttpApi::new(&cfg.api).context("Failed to build HTTP client")?;
    Ok(Arc::new(api))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let progress: Arc<dyn ProgressReporter> = Arc::from(cli.progress.reporter());

    // `plan` never reaches the service, so a missing config is fine.
    if let Commands::Plan { workflow } = &cli.command {
        let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal());
        return plan(&cfg, &read_workflow(workflow)?);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Plan { .. } => {}
        Commands::Run { workflow } => {
            let mut wf = read_workflow(&workflow)?;
            let runner = WorkflowRunner::new(connect(&cfg)?, cfg.clone()).with_progress(progress);
            let cancel = runner.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            let status = runner.run(&mut wf).await;
            print_run(&wf);
            println!("Status: {} ({}%)", status.as_str(), wf.percent());
        }
        Commands::Approve { file_ids } => {
            let report = processor(&cfg, progress)?.approve(&file_ids).await?;
            print_review(&report);
        }
        Commands::Reject { file_ids } => {
            let report = processor(&cfg, progress)?.reject(&file_ids).await?;
            print_review(&report);
        }
        Commands::Clear { file_ids, yes } => {
            let report = processor(&cfg, progress)?.clear(&file_ids, yes).await?;
            print_review(&report);
        }
        Commands::Export { file_ids, prefix } => {
            let exports = ExportJobOrchestrator::new(connect(&cfg)?, cfg.export.polling())
                .with_prefix(prefix.or_else(|| cfg.export.prefix.clone()))
                .with_progress(progress);
            let mut failed = 0usize;
            for &id in &file_ids {
                if let Err(e) = exports.submit(id).await {
                    println!("{}  error  {}", id, e);
                    failed += 1;
                }
            }
            for &id in &file_ids {
                match exports.wait(id).await.map(|j| j.view()) {
                    Some(ExportView::Ready { svg_id }) => println!("{}  ready  {}", id, svg_id),
                    Some(ExportView::Failed { message }) => {
                        println!("{}  failed  {}", id, message);
                        failed += 1;
                    }
                    Some(ExportView::InProgress) => {
                        println!("{}  still running, check back later", id);
                        failed += 1;
                    }
                    None => {}
                }
            }
            if failed > 0 {
                bail!("{} of {} export(s) did not produce an artifact", failed, file_ids.len());
            }
        }
        Commands::Label { file_ids } => {
            let p = processor(&cfg, progress)?;
            for id in file_ids {
                let state = p.inspect(id).await?;
                println!(
                    "{}  {}  (pending {}, confirmed {}, discarded {})",
                    id,
                    state.label.as_str(),
                    state.pending,
                    state.confirmed,
                    state.discarded
                );
            }
        }
    }

    Ok(())
}

fn processor(cfg: &Config, progress: Arc<dyn ProgressReporter>) -> Result<ReviewCommandProcessor> {
    Ok(ReviewCommandProcessor::new(connect(cfg)?)
        .checked_by(cfg.review.checked_by.clone())
        .with_progress(progress))
}

fn plan(cfg: &Config, wf: &Workflow) -> Result<()> {
    let batcher = JobBatcher::new(cfg.detection.chunk_size);
    let ids = wf.diagram_ids();
    let chunks = batcher.plan(&ids);
    let entities = wf.entity_payload(cfg);
    let options = wf.detect_options(cfg);

    println!("Workflow {}", wf.id);
    println!("Diagrams: {}", ids.len());
    println!("Entities: {}", entities.len());
    println!(
        "Options: searchField={} minTokens={} partialMatch={}",
        options.search_field, options.min_tokens, options.partial_match
    );
    println!("Chunks: {} (size {})", chunks.len(), batcher.chunk_size());
    for (i, chunk) in chunks.iter().enumerate() {
        let first = chunk.first().copied().unwrap_or_default();
        let last = chunk.last().copied().unwrap_or_default();
        println!("  chunk {}: {} diagram(s) [{} .. {}]", i + 1, chunk.len(), first, last);
    }
    if !wf.has_selection() {
        println!("Status: {}", wf.status().as_str());
    }
    Ok(())
}

fn print_run(wf: &Workflow) {
    for (file_id, c) in wf.annotation_counts() {
        println!(
            "{}  new assets {}  new files {}  existing assets {}  existing files {}",
            file_id, c.new_asset_links, c.new_file_links, c.existing_asset_links, c.existing_file_links
        );
    }
    for f in wf.failed_files() {
        println!(
            "{}  failed  {}",
            f.file_id,
            f.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    for c in &wf.submission_failures {
        println!(
            "chunk {}  not submitted ({} diagram(s))  {}",
            c.chunk + 1,
            c.file_ids.len(),
            c.message
        );
    }
    for job in wf.jobs.iter().filter(|j| j.stalled) {
        println!("job {}  still running, check back later", job.job_id);
    }
}

fn print_review(report: &ReviewReport) {
    for f in &report.files {
        println!("{}  {}  {} changed", f.file_id, f.label.as_str(), f.changed);
    }
}
