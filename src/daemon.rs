//! Daemon - periodic synchronization runs
//!
//! The first run starts at a configured local wall-clock time, later runs
//! follow at a fixed interval. The configuration file is re-read before each
//! run, so edits take effect on the next run without a restart.

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime, Timelike};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::registry_from_config;
use crate::run::{RunController, RunSummary};
use crate::Config;

const SECONDS_PER_DAY: u64 = 24 * 3600;

/// When runs happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start_time: NaiveTime,
    pub interval: Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            start_time: config.schedule.start_time()?,
            interval: config.schedule.interval()?,
        })
    }

    /// Time from `now` until the next occurrence of the start time: later
    /// today, or tomorrow if it has already passed this minute.
    pub fn delay_until_start(&self, now: NaiveTime) -> Duration {
        let minute_of = |t: NaiveTime| u64::from(t.hour()) * 3600 + u64::from(t.minute()) * 60;

        let start = minute_of(self.start_time);
        let now = minute_of(now);

        if start >= now {
            Duration::from_secs(start - now)
        } else {
            Duration::from_secs(SECONDS_PER_DAY + start - now)
        }
    }
}

/// Daemon state and control
pub struct Daemon {
    config: Config,
    config_path: Option<PathBuf>,
    schedule: Schedule,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    total_runs: AtomicU64,
    clean_runs: AtomicU64,
}

impl Daemon {
    /// Create a daemon. With a `config_path` the file is reloaded before
    /// every run.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate().context("Invalid configuration for daemon")?;
        let schedule = Schedule::from_config(&config)?;
        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            config,
            config_path,
            schedule,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            total_runs: AtomicU64::new(0),
            clean_runs: AtomicU64::new(0),
        })
    }

    /// Override the configured schedule
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Sender that stops the daemon when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::SeqCst)
    }

    /// Run in the foreground until Ctrl+C or SIGTERM
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting repo-file-sync daemon");

        let shutdown_sender = self.shutdown_sender.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            let _ = shutdown_sender.send(());
        });

        self.run_until_shutdown().await
    }

    /// Main daemon loop, stopped only through [`Daemon::shutdown_handle`]
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        let first_run = self.schedule.delay_until_start(Local::now().time());
        self.run_loop(first_run).await
    }

    async fn run_loop(&mut self, first_run: Duration) -> Result<()> {
        let mut shutdown_receiver = self.shutdown_sender.subscribe();
        self.is_running.store(true, Ordering::SeqCst);

        info!(
            "Daemon loop started: first run in {}s, then every {:?}",
            first_run.as_secs(),
            self.schedule.interval
        );

        let mut timer = interval_at(Instant::now() + first_run, self.schedule.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    info!("Shutdown signal received in daemon loop");
                    break;
                }

                _ = timer.tick() => {
                    if self.tick(&mut shutdown_receiver).await {
                        break;
                    }
                }
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!(
            "Daemon loop exiting after {} runs ({} clean)",
            self.total_runs.load(Ordering::SeqCst),
            self.clean_runs.load(Ordering::SeqCst)
        );
        Ok(())
    }

    /// One scheduled run. Returns true when shutdown was requested meanwhile.
    async fn tick(&mut self, shutdown_receiver: &mut broadcast::Receiver<()>) -> bool {
        self.reload_config();

        let settings = match self.config.run_settings() {
            Ok(settings) => settings,
            Err(e) => {
                error!("Skipping scheduled run: {}", e);
                return false;
            }
        };

        debug!("Starting scheduled run");
        let controller = RunController::new(registry_from_config(&self.config.clients), settings);
        let handle = controller.start(self.config.sync_files.clone());
        let canceller = handle.canceller();

        let wait = handle.wait();
        tokio::pin!(wait);

        let (summary, shutdown) = tokio::select! {
            summary = &mut wait => (summary, false),
            _ = shutdown_receiver.recv() => {
                info!("Shutdown requested during run, cancelling");
                canceller.cancel();
                (wait.await, true)
            }
        };

        self.record(&summary);
        shutdown
    }

    fn reload_config(&mut self) {
        let Some(path) = &self.config_path else {
            return;
        };

        match Config::load(path) {
            Ok(config) => {
                debug!("Reloaded configuration from {:?}", path);
                self.config = config;
            }
            Err(e) => {
                warn!("Failed to reload configuration, keeping previous one: {:#}", e);
            }
        }
    }

    fn record(&self, summary: &RunSummary) {
        self.total_runs.fetch_add(1, Ordering::SeqCst);
        if summary.is_clean() {
            self.clean_runs.fetch_add(1, Ordering::SeqCst);
        }

        info!(
            "Run completed in {:.2}s: {} repo listings, {} branch listings, {} synced, {} abandoned",
            summary.duration.as_secs_f64(),
            summary.repo_listings,
            summary.branch_listings,
            summary.synced_branches,
            summary.abandoned.len()
        );
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}
