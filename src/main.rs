//! vault-orchestrator — watches a vault and dispatches AI CLI executions on
//! file events, cron ticks, and pollers.

mod agent;
mod config;
mod cron_sched;
mod error;
mod event;
mod exec;
mod orchestrator;
mod poller;
mod slots;
mod task;
mod watch;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use event::Event;
use orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "vault-orchestrator")]
#[command(about = "Watches a vault and dispatches AI CLI agent executions")]
#[command(version)]
struct Cli {
    /// Path to the vault root (default: search upward for orchestrator.yaml,
    /// falling back to the VAULT_PATH environment variable).
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Path to the config file (default: <root>/orchestrator.yaml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the event loop until a shutdown signal arrives.
    Run,

    /// List every loaded agent and its resolved settings.
    ListAgents,

    /// Manually fire an agent, optionally against a specific file.
    Trigger {
        /// Agent name or abbreviation.
        agent: String,
        /// Optional path to treat as the trigger file.
        file: Option<PathBuf>,
    },

    /// Print the fully-resolved configuration.
    ShowConfig,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let root = match resolve_root(cli.root.as_deref()) {
        Some(r) => r,
        None => {
            eprintln!("Error: no orchestrator.yaml found and VAULT_PATH is not set.");
            process::exit(2);
        }
    };

    let loaded = match config::load(&root, cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(2);
        }
    };

    let exit_code = match cli.command {
        Commands::Run => run_command(loaded),
        Commands::ListAgents => list_agents_command(loaded),
        Commands::Trigger { agent, file } => trigger_command(loaded, &agent, file),
        Commands::ShowConfig => show_config_command(loaded),
    };

    process::exit(exit_code);
}

fn run_command(loaded: config::LoadedConfig) -> i32 {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting tokio runtime: {e}");
            return 1;
        }
    };

    rt.block_on(async move {
        let orchestrator = match Orchestrator::new(loaded.settings, loaded.agents, loaded.pollers) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        };

        match orchestrator.run().await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        }
    })
}

fn list_agents_command(loaded: config::LoadedConfig) -> i32 {
    if loaded.agents.is_empty() {
        println!("No agents configured.");
        return 0;
    }
    for agent in &loaded.agents {
        println!(
            "{:6}  {:<40}  executor={:<12}  max_parallel={}  priority={:?}{}",
            agent.abbreviation,
            agent.name,
            agent.executor.canonical_name(),
            agent.max_parallel,
            agent.priority,
            agent.cron.as_deref().map(|c| format!("  cron={c}")).unwrap_or_default(),
        );
    }
    0
}

fn trigger_command(loaded: config::LoadedConfig, agent_name: &str, file: Option<PathBuf>) -> i32 {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting tokio runtime: {e}");
            return 1;
        }
    };

    rt.block_on(async move {
        let orchestrator = match Orchestrator::new(loaded.settings, loaded.agents, loaded.pollers) {
            Ok(o) => o,
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        };

        if orchestrator.registry().by_name_or_abbr(agent_name).is_none() {
            eprintln!("Error: unknown agent \"{agent_name}\"");
            return 1;
        }

        let event = Event::manual(agent_name.to_string(), file);
        orchestrator.dispatch(event).await;
        orchestrator.join_workers(std::time::Duration::from_secs(300)).await;
        0
    })
}

fn show_config_command(loaded: config::LoadedConfig) -> i32 {
    println!("vault_root:      {}", loaded.settings.vault_root.display());
    println!("prompts_dir:     {}", loaded.settings.prompts_dir.display());
    println!("tasks_dir:       {}", loaded.settings.tasks_dir.display());
    println!("logs_dir:        {}", loaded.settings.logs_dir.display());
    println!("max_concurrent:  {}", loaded.settings.max_concurrent);
    println!("poll_interval:   {:?}", loaded.settings.poll_interval);
    println!("agents:          {}", loaded.agents.len());
    println!("pollers:         {}", loaded.pollers.len());
    println!("secrets loaded:  {}", loaded.secrets.len());
    0
}

fn resolve_root(explicit: Option<&std::path::Path>) -> Option<PathBuf> {
    if let Some(r) = explicit {
        return Some(r.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(found) = config::find_vault_root(&cwd) {
            return Some(found);
        }
    }
    std::env::var("VAULT_PATH").ok().map(PathBuf::from)
}

fn init_tracing() {
    let filter = if std::env::var("DEBUG").is_ok() {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
