use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use torque_core::config::AppConfig;
use torque_core::event::EventBus;
use torque_core::plan::WorkflowPlan;
use torque_core::traits::ServiceDirectory;

use torque_engine::{DependencyGraph, HttpTransport, RunCoordinator, RunLogger, StaticDirectory};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "torque", version, about = "DAG workflow engine for automotive service agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "torque.toml", env = "TORQUE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow plan and print its report
    Run {
        /// Plan file (JSON)
        plan: PathBuf,
        /// Probe agent health before running
        #[arg(long)]
        probe: bool,
        /// Print the narrative summary instead of the JSON report
        #[arg(long)]
        summary: bool,
    },
    /// Check a plan and print the waves it would form
    Validate {
        /// Plan file (JSON)
        plan: PathBuf,
    },
    /// List the agents in the service directory
    Agents {
        /// Probe each agent's health endpoint
        #[arg(long)]
        probe: bool,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("torque=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { plan } => validate(&plan)?,
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Agents { probe } => {
            let config = load_config(&cli.config)?;
            let mut directory = StaticDirectory::from_config(&config);
            if probe {
                let transport = HttpTransport::new(config.engine.invoke_path.clone())?;
                directory = directory.probe_health(transport.client(), PROBE_TIMEOUT).await;
            }
            if directory.is_empty() {
                println!("No agents configured. Add [agents.<name>] sections to the config.");
            }
            for endpoint in directory.endpoints() {
                println!(
                    "{:<16} {:<32} {}",
                    endpoint.name,
                    endpoint.address,
                    if endpoint.healthy { "healthy" } else { "unhealthy" }
                );
            }
        }
        Commands::Run {
            plan,
            probe,
            summary,
        } => {
            let config = load_config(&cli.config)?;
            if !run(&config, &plan, probe, summary).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn run(config: &AppConfig, plan_path: &Path, probe: bool, summary: bool) -> anyhow::Result<bool> {
    let plan = WorkflowPlan::load(plan_path)?;

    let transport = HttpTransport::new(config.engine.invoke_path.clone())?;
    let mut directory = StaticDirectory::from_config(config);
    if probe {
        directory = directory.probe_health(transport.client(), PROBE_TIMEOUT).await;
    }
    for step in &plan.steps {
        if directory.resolve(&step.target_agent).is_err() {
            warn!(step_id = %step.step_id, agent = %step.target_agent, "Agent not in directory");
        }
    }

    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    let logger = match &config.log {
        Some(log) if log.enabled => {
            info!("RunLogger started (level {})", log.level);
            Some(
                RunLogger::new(log.resolved_dir(), log.level).spawn(
                    &event_bus,
                    plan.plan_id.clone(),
                    cancel.clone(),
                ),
            )
        }
        _ => None,
    };

    let coordinator = RunCoordinator::with_event_bus(
        Arc::new(directory),
        Arc::new(transport),
        config.engine.clone(),
        event_bus,
    );

    let report = tokio::select! {
        report = coordinator.execute(&plan) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, in-flight steps abandoned");
            cancel.cancel();
            std::process::exit(130);
        }
    };

    if let Some(handle) = logger {
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }

    if summary {
        println!("{}", report.summary);
    } else {
        println!("{}", report.to_json_pretty()?);
    }
    Ok(report.success)
}

fn validate(plan_path: &Path) -> anyhow::Result<()> {
    let plan = WorkflowPlan::load(plan_path)?;
    let graph = DependencyGraph::build(&plan)?;

    println!(
        "Plan {} ({:?} risk): {} steps",
        plan.plan_id,
        plan.risk_level,
        graph.len()
    );
    for (i, level) in graph.levels().iter().enumerate() {
        println!("  wave {}: {}", i + 1, level.join(", "));
    }
    for (group, members) in graph.parallel_groups() {
        println!("  group {}: {}", group, members.join(", "));
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".torque").join("config.toml"));
    if let Some(ref home) = home_config {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(home)?);
        }
    }

    eprintln!(
        "Warning: No config file found at {}. Using defaults with an empty agent directory.",
        path.display()
    );
    Ok(AppConfig::default())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
