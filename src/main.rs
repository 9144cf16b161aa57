use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repo_file_sync::config::LoggingConfig;
use repo_file_sync::daemon::shutdown_signal;
use repo_file_sync::{registry_from_config, Config, Daemon, RunController, RunSummary};

#[derive(Parser)]
#[command(name = "repo-file-sync")]
#[command(about = "Propagate files to every branch of many repositories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization pass and exit
    Once {
        /// Queue capacity for this run
        #[arg(long)]
        concurrent_size: Option<usize>,
    },

    /// Run synchronization passes on a schedule, in the foreground
    Daemon {
        /// Local time of the first run, HH:MM
        #[arg(long)]
        start_time: Option<String>,

        /// Time between runs, e.g. "24h" or "30m"
        #[arg(long)]
        interval: Option<String>,
    },

    /// Validate configuration and show what a run would cover
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let config = load_config(&config_path)?;

    init_logging(&config.logging, cli.verbose)?;
    info!("Starting repo-file-sync v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Once { concurrent_size } => cmd_once(config, concurrent_size).await,
        Commands::Daemon {
            start_time,
            interval,
        } => cmd_daemon(config, config_path, start_time, interval).await,
        Commands::Validate => cmd_validate(&config),
    }
}

/// Initialize logging from the config, `-v` forces debug
fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        "full" => registry.with(fmt::layer()).try_init(),
        _ => registry.with(fmt::layer().compact()).try_init(),
    }
    .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from the given path, creating the default file if it is
/// the default location and missing
fn load_config(path: &Path) -> Result<Config> {
    let default_path = Config::default_config_path().ok();
    if default_path.as_deref() == Some(path) {
        Config::load_or_default()
    } else {
        Config::load(path)
    }
}

/// Run one pass, cancelling it on Ctrl+C or SIGTERM
async fn cmd_once(config: Config, concurrent_size: Option<usize>) -> Result<()> {
    let mut settings = config.run_settings()?;
    if let Some(size) = concurrent_size {
        anyhow::ensure!(size > 0, "--concurrent-size must be positive");
        settings.queue_capacity = size;
    }

    let controller = RunController::new(registry_from_config(&config.clients), settings);
    let handle = controller.start(config.sync_files.clone());

    let canceller = handle.canceller();
    let signal = tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, cancelling run...");
        canceller.cancel();
    });

    let summary = handle.wait().await;
    signal.abort();

    print_summary(&summary);
    Ok(())
}

async fn cmd_daemon(
    mut config: Config,
    config_path: PathBuf,
    start_time: Option<String>,
    interval: Option<String>,
) -> Result<()> {
    if let Some(start_time) = start_time {
        config.schedule.start_time = start_time;
    }
    if let Some(interval) = interval {
        config.schedule.interval = interval;
    }

    println!("🚀 Starting repo-file-sync daemon (Ctrl+C to stop)");
    println!(
        "   First run at {}, then every {}",
        config.schedule.start_time, config.schedule.interval
    );

    let mut daemon = Daemon::new(config, Some(config_path))?;
    daemon.run().await?;

    println!("✅ Daemon stopped after {} runs", daemon.total_runs());
    Ok(())
}

fn cmd_validate(config: &Config) -> Result<()> {
    let settings = config.run_settings()?;

    println!("✅ Configuration is valid");
    println!(
        "   Queue capacity: {}, executors: {}, max retries: {}",
        settings.queue_capacity, settings.executors, settings.max_retries
    );
    println!(
        "   Schedule: first run at {}, then every {}",
        config.schedule.start_time, config.schedule.interval
    );

    println!("\n📡 Clients ({}):", config.clients.len());
    for client in &config.clients {
        println!("   {} -> {} (timeout {})", client.platform, client.endpoint, client.timeout);
    }

    let missing = config.platforms_without_client();

    println!("\n📄 Sync files:");
    for item in &config.sync_files {
        let client = if missing.contains(&item.platform.as_str()) {
            "no client"
        } else {
            "client configured"
        };
        println!("   {} [{}] ({})", item.platform, item.file_names.join(", "), client);
        for selector in &item.org_repos {
            let scope = if !selector.repos.is_empty() && selector.verify_repos {
                format!("only {}, if they exist", selector.repos.join(", "))
            } else if !selector.repos.is_empty() {
                format!("only {}", selector.repos.join(", "))
            } else if !selector.excluded_repos.is_empty() {
                format!("all except {}", selector.excluded_repos.join(", "))
            } else {
                "all repos".to_string()
            };
            println!("      {}: {}", selector.org, scope);
        }
    }

    if !missing.is_empty() {
        println!("\n⚠️  No client configured for: {}", missing.join(", "));
        println!("   These platforms are skipped during a run");
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    if summary.cancelled {
        println!("\n🛑 Run cancelled");
    } else {
        println!("\n🎉 Run complete!");
    }
    println!("   📊 Produced tasks: {}", summary.produced_tasks);
    println!("   📁 Repo listings: {}", summary.repo_listings);
    println!("   🌿 Branch listings: {}", summary.branch_listings);
    println!("   ✅ Synced branches: {}", summary.synced_branches);
    println!(
        "   🔁 Failed attempts: {} ({} requeued)",
        summary.failed_attempts, summary.requeued_retries
    );
    println!("   ⚡ Inline executions: {}", summary.inline_executions);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if !summary.abandoned.is_empty() {
        println!("\n🔍 Abandoned tasks:");
        for task in &summary.abandoned {
            let mut target = format!("{}/{}", task.platform, task.org);
            if let Some(repo) = &task.repo {
                target.push('/');
                target.push_str(repo);
            }
            if let Some(branch) = &task.branch {
                target.push('@');
                target.push_str(branch);
            }
            println!("   ❌ {} {}: {}", task.level, target, task.error);
        }
    }
}
