mod config;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use conductor_core::{InterruptType, NodeExecution, Plan, PlanExecution};
use db::{create_pool, run_migrations, ExecutionStore};
use events::{DispatcherConfig, EventDispatcher, EventFilter, HandlerRegistry, TracingHandler};
use orchestrator::{
    EngineContext, ExecutionEngine, ExpirySweeper, InterruptRequest, InterruptResult,
    NotifyOutcome, OrderedEventEmitter, WorkerPool,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::{ConductorConfig, CONFIG_FILE};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Durable pipeline execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Overrides `database.url` from the config file.
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start a plan and work it in-process until it ends
    Run {
        /// Plan definition (JSON)
        plan: PathBuf,
        /// Setup abstraction as key=value, repeatable
        #[arg(short, long = "setup", value_parser = parse_setup)]
        setup: Vec<(String, String)>,
    },
    /// Start a plan and leave it for `conductor work`
    Start {
        plan: PathBuf,
        #[arg(short, long = "setup", value_parser = parse_setup)]
        setup: Vec<(String, String)>,
    },
    /// Drain the work queue and sweep expiries until interrupted
    Work {
        /// Worker count; defaults to `engine.workers`
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Register an interrupt against a node or a plan
    Interrupt {
        #[arg(value_enum)]
        kind: InterruptKind,
        #[arg(long, conflicts_with = "plan", required_unless_present = "plan")]
        node: Option<Uuid>,
        #[arg(long)]
        plan: Option<Uuid>,
    },
    /// Deliver a response to a waiting node
    Notify {
        correlation_id: String,
        /// Response payload (JSON)
        #[arg(short, long)]
        response: Option<String>,
    },
    /// Show a plan execution and its nodes
    Status { plan_execution_id: Uuid },
    /// Delete ended plans past their retention
    Purge,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InterruptKind {
    Abort,
    AbortAll,
    Pause,
    Resume,
    Retry,
}

impl From<InterruptKind> for InterruptType {
    fn from(kind: InterruptKind) -> Self {
        match kind {
            InterruptKind::Abort => InterruptType::Abort,
            InterruptKind::AbortAll => InterruptType::AbortAll,
            InterruptKind::Pause => InterruptType::Pause,
            InterruptKind::Resume => InterruptType::Resume,
            InterruptKind::Retry => InterruptType::Retry,
        }
    }
}

fn parse_setup(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=info,orchestrator=info,events=info,db=warn".into()),
        )
        .init();
}

/// Engine wired to the configured database, with events logged through tracing.
struct Runtime {
    config: ConductorConfig,
    engine: ExecutionEngine,
    dispatcher: EventDispatcher,
}

impl Runtime {
    async fn open(config: ConductorConfig) -> Result<Self> {
        let pool = create_pool(&config.database.url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database.url))?;
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
        debug!(url = %config.database.url, "Database ready");

        let registry = HandlerRegistry::new().with(
            "tracing",
            EventFilter::all(),
            Arc::new(TracingHandler::default()),
        );
        let dispatcher = EventDispatcher::start(
            registry,
            DispatcherConfig::default()
                .with_workers(config.engine.event_workers)
                .with_capacity(config.engine.event_queue_capacity),
        );
        let ctx = EngineContext::new(ExecutionStore::new(pool), config.engine.clone())
            .with_emitter(OrderedEventEmitter::new(dispatcher.clone()));

        Ok(Self {
            config,
            engine: ExecutionEngine::new(Arc::new(ctx)),
            dispatcher,
        })
    }

    async fn close(self) {
        self.dispatcher.flush().await;
        self.dispatcher.shutdown().await;
    }
}

async fn load_plan(path: &Path) -> Result<Plan> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid plan {}", path.display()))
}

/// Background workers plus the expiry sweeper.
struct Background {
    workers: WorkerPool,
    sweeper: tokio::task::JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl Background {
    fn start(engine: &ExecutionEngine, workers: usize) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        Self {
            workers: WorkerPool::start(engine.clone(), workers),
            sweeper: ExpirySweeper::new(engine.clone()).spawn(stop_rx),
            stop,
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        self.workers.shutdown().await;
        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ConductorConfig::load(&cli.config).await?;
    if let Some(url) = cli.database {
        config.database.url = url;
    }

    match cli.command {
        Commands::Init { force } => init(&cli.config, config, force).await,
        Commands::Run { plan, setup } => {
            let runtime = Runtime::open(config).await?;
            let result = run(&runtime, &plan, setup.into_iter().collect()).await;
            runtime.close().await;
            result
        }
        Commands::Start { plan, setup } => {
            let runtime = Runtime::open(config).await?;
            let plan = load_plan(&plan).await?;
            let execution = runtime
                .engine
                .start_plan(plan, setup.into_iter().collect())
                .await?;
            println!("{}", execution.id);
            runtime.close().await;
            Ok(())
        }
        Commands::Work { workers } => {
            let runtime = Runtime::open(config).await?;
            let workers = workers.unwrap_or(runtime.config.engine.workers);
            let background = Background::start(&runtime.engine, workers);
            info!(workers, "Working; press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Shutting down");
            background.stop().await;
            runtime.close().await;
            Ok(())
        }
        Commands::Interrupt { kind, node, plan } => {
            let runtime = Runtime::open(config).await?;
            let result = interrupt(&runtime, kind, node, plan).await;
            runtime.close().await;
            result
        }
        Commands::Notify {
            correlation_id,
            response,
        } => {
            let runtime = Runtime::open(config).await?;
            let response = match response {
                Some(raw) => serde_json::from_str(&raw).context("Response is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let outcome = runtime
                .engine
                .context()
                .wait_notify
                .notify(&correlation_id, response)
                .await?;
            match outcome {
                NotifyOutcome::Resumed { node_execution_id } => {
                    println!("Resumed node {node_execution_id}")
                }
                NotifyOutcome::Ignored => println!("No wait registered for {correlation_id}"),
            }
            runtime.close().await;
            Ok(())
        }
        Commands::Status { plan_execution_id } => {
            let runtime = Runtime::open(config).await?;
            let store = runtime.engine.store();
            let Some(plan) = store.plans().find_by_id(plan_execution_id).await? else {
                bail!("Plan execution {plan_execution_id} not found");
            };
            let nodes = store.nodes().find_by_plan(plan_execution_id).await?;
            print_plan(&plan, &nodes);
            runtime.close().await;
            Ok(())
        }
        Commands::Purge => {
            let runtime = Runtime::open(config).await?;
            let purged = runtime.engine.store().plans().purge_expired(Utc::now()).await?;
            println!("Purged {purged} plan execution(s)");
            runtime.close().await;
            Ok(())
        }
    }
}

async fn init(path: &Path, config: ConductorConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("{} already exists, keeping it", path.display());
    } else {
        config.write(path).await?;
        println!("Wrote {}", path.display());
    }
    let url = config.database.url.clone();
    Runtime::open(config).await?.close().await;
    println!("Database ready at {url}");
    Ok(())
}

async fn run(runtime: &Runtime, plan_path: &Path, setup: HashMap<String, String>) -> Result<()> {
    let plan = load_plan(plan_path).await?;
    let engine = &runtime.engine;
    let execution = engine.start_plan(plan, setup).await?;
    println!("Started plan execution {}", execution.id);

    let background = Background::start(engine, runtime.config.engine.workers);
    let poll = runtime.config.engine.poll_interval();
    let ended = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(plan_execution_id = %execution.id, "Interrupted; plan left running");
                break None;
            }
            _ = tokio::time::sleep(poll) => {
                let plan = engine.store().plans().get(execution.id).await?;
                if plan.is_terminal() {
                    break Some(plan);
                }
            }
        }
    };
    background.stop().await;

    let plan = match ended {
        Some(plan) => plan,
        None => engine.store().plans().get(execution.id).await?,
    };
    let nodes = engine.store().nodes().find_by_plan(execution.id).await?;
    print_plan(&plan, &nodes);
    Ok(())
}

async fn interrupt(
    runtime: &Runtime,
    kind: InterruptKind,
    node: Option<Uuid>,
    plan: Option<Uuid>,
) -> Result<()> {
    let request = match (node, plan) {
        (Some(node), _) => InterruptRequest::node(kind.into(), node),
        (None, Some(plan)) => InterruptRequest::plan(kind.into(), plan),
        (None, None) => bail!("Either --node or --plan is required"),
    };
    let interrupt_id = request.interrupt_id;
    match runtime.engine.interrupts().apply(request).await? {
        InterruptResult::Applied(effects) => {
            println!("Interrupt {interrupt_id} applied");
            for effect in effects {
                println!(
                    "  {} {} -> {}",
                    effect.interrupt_type, effect.from_status, effect.to_status
                );
            }
        }
        InterruptResult::AlreadyApplied => println!("Interrupt already applied"),
        InterruptResult::AlreadyTerminal => println!("Target has already ended"),
        InterruptResult::NotDue => println!("Target is not past its deadline"),
    }
    Ok(())
}

fn print_plan(plan: &PlanExecution, nodes: &[NodeExecution]) {
    println!();
    println!("Plan       {} ({})", plan.plan.name, plan.id);
    println!("Status     {}", plan.status);
    println!("Started    {}", plan.started_at.to_rfc3339());
    if let Some(ended) = plan.ended_at {
        println!("Ended      {}", ended.to_rfc3339());
    }
    println!();

    let mut nodes: Vec<&NodeExecution> = nodes.iter().collect();
    nodes.sort_by_key(|n| n.created_at);
    for node in nodes {
        let depth = node.ambiance.levels().len().saturating_sub(1);
        let attempts = node.retry_ids.len() + 1;
        print!(
            "{:indent$}{:<20} {:<16} attempts={attempts}",
            "",
            node.identifier,
            node.status.as_str(),
            indent = depth * 2
        );
        if let Some(notify_id) = &node.notify_id {
            print!(" waiting={notify_id}");
        }
        println!();
        if let Some(failure) = &node.failure_info {
            println!("{:indent$}  {}", "", failure.error_message(), indent = depth * 2);
        }
    }
}
