#![forbid(unsafe_code)]

//! **bloom-cli** – command-line entry point for Bloom.
//!
//! Wires the `bloom-*` crates into a running scheduler (`bloom run`)
//! plus a handful of inspection and human-queue subcommands. The CLI
//! surface itself is deliberately thin: it loads configuration and the
//! task file, builds the collaborators, and either drives the
//! scheduler loop or prints a snapshot of state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bloom_agent_runtime::{AgentRegistry, AgentRuntime};
use bloom_bus::{EventBus, InMemoryBus};
use bloom_config::BloomConfig;
use bloom_orchestrator::{FsRepoManager, Scheduler, TemplatePromptAssembler};
use bloom_queue::HumanQueue;
use bloom_store::{ReadySetFilter, TaskStore};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "bloom")]
#[command(about = "Bloom - a multi-agent orchestrator for coding-assistant CLIs")]
#[command(version)]
struct Cli {
    /// Path to the task graph file.
    #[arg(long, default_value = "tasks.yaml")]
    tasks: PathBuf,

    /// Path to the configuration file.
    #[arg(long, default_value = "bloom.config.yaml")]
    config: PathBuf,

    /// Directory holding question/interjection records and session state.
    #[arg(long, default_value = ".bloom")]
    bloom_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted.
    Run,
    /// Print the current ready set.
    Ready {
        /// Restrict to tasks assigned to this agent.
        #[arg(long)]
        agent: Option<String>,
    },
    /// Print every task and its status.
    Status,
    /// Reset stuck (`in_progress`/`blocked`) tasks back to `ready_for_agent`.
    ResetStuck,
    /// List queued questions.
    Questions,
    /// Answer a queued question.
    Answer {
        /// Question id.
        id: String,
        /// Answer text.
        text: String,
    },
    /// List open interjections.
    Interjections,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    info!("starting bloom v{}", env!("CARGO_PKG_VERSION"));

    let config = BloomConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let store = TaskStore::load(&cli.tasks)
        .await
        .with_context(|| format!("loading task graph from {}", cli.tasks.display()))?;
    let queue = HumanQueue::open(&cli.bloom_dir, config.poll_interval())
        .await
        .context("opening human queue")?;

    match cli.command {
        Commands::Run => handle_run(store, config, queue).await?,
        Commands::Ready { agent } => handle_ready(&store, agent.as_deref()).await,
        Commands::Status => handle_status(&store).await,
        Commands::ResetStuck => handle_reset_stuck(&store).await?,
        Commands::Questions => handle_questions(&queue).await?,
        Commands::Answer { id, text } => handle_answer(&queue, &id, &text).await?,
        Commands::Interjections => handle_interjections(&queue).await?,
    }

    Ok(())
}

//─────────────────────────────
//  Command handlers
//─────────────────────────────

async fn handle_run(store: TaskStore, config: BloomConfig, queue: HumanQueue) -> Result<()> {
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::default());
    let registry = AgentRegistry::with_builtins();
    let runtime = Arc::new(AgentRuntime::new(registry).with_bus(bus.clone()));
    let repo_manager = Arc::new(FsRepoManager::new(std::env::current_dir()?));
    let prompt_assembler = Arc::new(TemplatePromptAssembler::new(
        "You are an autonomous coding assistant working inside a git worktree.",
    ));

    let scheduler = Scheduler::new_with_bus_and_queue(
        store,
        runtime,
        config,
        repo_manager,
        prompt_assembler,
        bus.clone(),
        Arc::new(queue),
    );

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "bus event");
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let driver = tokio::spawn(scheduler.run_forever(shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = driver.await;

    Ok(())
}

async fn handle_ready(store: &TaskStore, agent: Option<&str>) {
    let filter = ReadySetFilter { agent_filter: agent };
    let ready = store.ready_set(filter).await;
    if ready.is_empty() {
        println!("no ready tasks");
        return;
    }
    for task in ready {
        println!("{}\t{}\t{}", task.id, task.agent_name.as_deref().unwrap_or("-"), task.title);
    }
}

async fn handle_status(store: &TaskStore) {
    let file = store.snapshot().await;
    for task in bloom_types::flatten(&file.tasks) {
        println!("{}\t{:?}\t{}", task.id, task.status, task.title);
    }
}

async fn handle_reset_stuck(store: &TaskStore) -> Result<()> {
    let count = store.reset_stuck().await?;
    println!("reset {count} stuck task(s)");
    Ok(())
}

async fn handle_questions(queue: &HumanQueue) -> Result<()> {
    let questions = queue.list_questions(None).await?;
    if questions.is_empty() {
        println!("no questions");
        return Ok(());
    }
    for q in questions {
        println!("{}\t{}\t{}", q.id, q.agent_name, q.question);
    }
    Ok(())
}

async fn handle_answer(queue: &HumanQueue, id: &str, text: &str) -> Result<()> {
    if queue.answer_question(id, text).await? {
        println!("answered {id}");
    } else {
        println!("no such question: {id}");
    }
    Ok(())
}

async fn handle_interjections(queue: &HumanQueue) -> Result<()> {
    let interjections = queue.list_interjections(None).await?;
    if interjections.is_empty() {
        println!("no interjections");
        return Ok(());
    }
    for i in interjections {
        println!("{}\t{}\t{}", i.id, i.agent_name, i.working_directory);
    }
    Ok(())
}

//─────────────────────────────
//  Utility functions
//─────────────────────────────

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
