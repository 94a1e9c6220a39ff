//! Command-line driver for manuscript generation
//!
//! ```bash
//! # Credit estimate for a 12-chapter book
//! manuscript-agents estimate --chapters 12 --words 2500 --threshold 80
//!
//! # One chapter
//! MANUSCRIPT_PROVIDER_API_KEY=... manuscript-agents --deposit 500 \
//!     generate --chapter 1 --words 2000 --title "The Salt Road" \
//!     --genre fantasy --premise "A courier carries a map nobody can read."
//!
//! # Whole book, progress streamed to the log (Ctrl-C cancels)
//! manuscript-agents --config manuscript.toml --deposit 5000 \
//!     auto-complete --chapters 12 --bible bible.md --style-guide style.md ...
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use coordination::events::ProgressEvent;
use coordination::ledger::CreditLedger;
use coordination::provider::{OpenAiCompatProvider, SharedProvider};
use coordination::state::{JobSettings, MemoryStore, Project, SharedDocumentStore};
use manuscript_agents::{GeneratorConfig, JobOrchestrator};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (overrides MANUSCRIPT_* environment defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Account the credits are charged to
    #[arg(long, global = true, default_value = "local")]
    user: String,

    /// Credits deposited before the run
    #[arg(long, global = true, default_value_t = 0)]
    deposit: u64,

    /// RocksDB directory for projects, chapters and jobs
    #[cfg(feature = "heavy-state")]
    #[arg(long, global = true)]
    state_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the credit estimate for a book
    Estimate(BookArgs),
    /// Generate a single chapter and print it
    Generate {
        #[command(flatten)]
        project: ProjectArgs,
        #[arg(long, default_value_t = 1)]
        chapter: u32,
        #[arg(long, default_value_t = 2500)]
        words: u32,
    },
    /// Generate every chapter of a book
    AutoComplete {
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        book: BookArgs,
    },
}

#[derive(Args, Debug)]
struct BookArgs {
    #[arg(long, default_value_t = 12)]
    chapters: u32,
    #[arg(long, default_value_t = 2500)]
    words: u32,
    /// Quality threshold, 0-100
    #[arg(long, default_value_t = 80)]
    threshold: u8,
}

impl BookArgs {
    fn settings(&self) -> JobSettings {
        JobSettings {
            target_chapters: self.chapters,
            words_per_chapter: self.words,
            quality_threshold: self.threshold,
        }
    }
}

#[derive(Args, Debug)]
struct ProjectArgs {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "general")]
    genre: String,
    #[arg(long)]
    premise: String,
    /// Book bible file (characters, world, canon)
    #[arg(long)]
    bible: Option<PathBuf>,
    /// Style guide file
    #[arg(long)]
    style_guide: Option<PathBuf>,
}

impl ProjectArgs {
    fn project(&self, owner: &str) -> Result<Project> {
        let mut project = Project::new(owner, &self.title, &self.genre, &self.premise);
        if let Some(path) = &self.bible {
            let bible = std::fs::read_to_string(path)
                .with_context(|| format!("reading book bible {}", path.display()))?;
            project = project.with_book_bible(bible);
        }
        if let Some(path) = &self.style_guide {
            let guide = std::fs::read_to_string(path)
                .with_context(|| format!("reading style guide {}", path.display()))?;
            project = project.with_style_guide(guide);
        }
        Ok(project)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GeneratorConfig::load(path)?,
        None => GeneratorConfig::default(),
    };
    info!(
        provider = %config.provider.base_url,
        model = %config.provider.model,
        max_retries = config.pipeline.max_retries,
        "Manuscript generator starting"
    );

    if let Command::Estimate(book) = &cli.command {
        let settings = book.settings();
        let estimate = config.costs.estimate_book(
            settings.target_chapters,
            settings.words_per_chapter,
            settings.quality_threshold,
            config.pipeline.max_retries,
        );
        println!("{}", serde_json::to_string_pretty(&estimate)?);
        return Ok(());
    }

    let orchestrator = build_orchestrator(&cli, config)?;
    if cli.deposit > 0 {
        orchestrator.ledger().deposit(&cli.user, cli.deposit)?;
    }
    let shutdown = CancellationToken::new();
    let sweeper = orchestrator.spawn_sweeper(shutdown.clone());
    let logger = spawn_progress_logger(orchestrator.subscribe());

    let outcome = run_command(&cli, &orchestrator).await;

    shutdown.cancel();
    logger.abort();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }
    let balance = orchestrator.ledger().balance(&cli.user)?;
    info!(
        user = %cli.user,
        committed = balance.committed,
        available = balance.available,
        "Final balance"
    );
    outcome
}

fn build_orchestrator(cli: &Cli, config: GeneratorConfig) -> Result<JobOrchestrator> {
    let provider: SharedProvider = Arc::new(
        OpenAiCompatProvider::new(config.provider.clone())
            .context("set MANUSCRIPT_PROVIDER_API_KEY or [provider].api_key")?,
    );
    let store = open_store(cli)?;
    let ledger = CreditLedger::new().shared();
    Ok(JobOrchestrator::new(provider, store, ledger, config)?)
}

#[cfg(feature = "heavy-state")]
fn open_store(cli: &Cli) -> Result<SharedDocumentStore> {
    match &cli.state_path {
        Some(path) => {
            let store = coordination::state::RocksStore::open(path)
                .with_context(|| format!("opening state at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(MemoryStore::new().shared()),
    }
}

#[cfg(not(feature = "heavy-state"))]
fn open_store(_cli: &Cli) -> Result<SharedDocumentStore> {
    Ok(MemoryStore::new().shared())
}

async fn run_command(cli: &Cli, orchestrator: &JobOrchestrator) -> Result<()> {
    match &cli.command {
        Command::Estimate(_) => Ok(()),
        Command::Generate {
            project,
            chapter,
            words,
        } => {
            let project = project.project(&cli.user)?;
            orchestrator.store().put_project(&project)?;
            let generated = orchestrator
                .generate(&cli.user, &project.id, *chapter, *words)
                .await?;
            println!("{}", serde_json::to_string_pretty(&generated)?);
            Ok(())
        }
        Command::AutoComplete { project, book } => {
            let project = project.project(&cli.user)?;
            orchestrator.store().put_project(&project)?;
            let job_id = orchestrator
                .start(&cli.user, &project.id, book.settings())
                .await?;

            let job = tokio::select! {
                job = orchestrator.wait(&job_id) => job?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(job_id = %job_id, "Interrupted; cancelling job");
                    orchestrator.cancel(&job_id).await?;
                    orchestrator.wait(&job_id).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
    }
}

fn spawn_progress_logger(mut events: broadcast::Receiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    job_id = %event.job_id,
                    chapter = ?event.chapter,
                    stage = %event.stage,
                    pct = event.percentage,
                    "{}",
                    event.message
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
