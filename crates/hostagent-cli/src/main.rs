//! Host agent CLI - exercise and inspect the resource manager

use clap::{Parser, Subcommand};
use hostagent_core::config::{Config, LoggingConfig};
use hostagent_core::domain::resource::{
    LockMode, RequestHandle, RequestState, ResourceConfig, ResourceError, ResourceHandle,
    ResourceManager, SimpleResourceFactory,
};
use hostagent_core::error::Error;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "hostagent")]
#[command(author, version, about = "Host agent resource manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer a manager with concurrent shared and exclusive acquisitions
    Stress {
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = 8, value_parser = clap::value_parser!(u32).range(1..))]
        threads: u32,
        /// Acquisitions per worker
        #[arg(short, long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
        iterations: u32,
        /// Number of distinct resources
        #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
        resources: u32,
        /// Every n-th acquisition is exclusive
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
        exclusive_every: u32,
        /// Timeout for blocking acquisitions, in seconds
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Run a queueing scenario and show which requests were granted
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Exclusive holder, then S, S, E, S, S queued behind it
    Barrier {
        /// Cancel the queued exclusive request before the holder releases
        #[arg(long)]
        cancel_barrier: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show the config file path
    Path,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A broken config file must not keep `config path` or `config set` from working
    let loaded = Config::load();
    let filter = loaded
        .as_ref()
        .map(|config| config.logging.filter.clone())
        .unwrap_or_else(|_| LoggingConfig::default().filter);

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(filter.parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Stress {
            threads,
            iterations,
            resources,
            exclusive_every,
            timeout,
        } => {
            let options = StressOptions {
                threads: threads as usize,
                iterations: iterations as usize,
                resources: resources as usize,
                exclusive_every: exclusive_every as usize,
                timeout: timeout.as_deref().map(parse_timeout_arg).transpose()?,
            };
            cmd_stress(loaded?, options, cli.format, cli.quiet).await
        }

        Commands::Scenario { action } => cmd_scenario(action, cli.format, cli.quiet),

        Commands::Config { action } => cmd_config(action, loaded, cli.format, cli.quiet),
    };

    if let Err(e) = &result {
        if let Some(suggestion) = e.downcast_ref::<Error>().and_then(Error::suggestion) {
            eprintln!("hint: {}", suggestion);
        }
    }
    result
}

fn parse_timeout_arg(value: &str) -> anyhow::Result<Duration> {
    hostagent_core::domain::resource::parse_timeout(value).map_err(|e| Error::from(e).into())
}

// ============================================================================
// Stress
// ============================================================================

struct StressOptions {
    threads: usize,
    iterations: usize,
    resources: usize,
    exclusive_every: usize,
    timeout: Option<Duration>,
}

/// Holder counts of one resource, checked on every grant
#[derive(Default)]
struct HolderMonitor {
    shared: AtomicUsize,
    exclusive: AtomicUsize,
    violations: AtomicUsize,
}

impl HolderMonitor {
    fn enter(&self, mode: LockMode) {
        let clash = match mode {
            LockMode::Shared => {
                self.shared.fetch_add(1, Ordering::SeqCst);
                self.exclusive.load(Ordering::SeqCst) != 0
            }
            LockMode::Exclusive => {
                self.exclusive.fetch_add(1, Ordering::SeqCst) != 0
                    || self.shared.load(Ordering::SeqCst) != 0
            }
        };
        if clash {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared.fetch_sub(1, Ordering::SeqCst),
            LockMode::Exclusive => self.exclusive.fetch_sub(1, Ordering::SeqCst),
        };
    }
}

#[derive(Default)]
struct StressCounters {
    shared: AtomicUsize,
    exclusive: AtomicUsize,
    timed_out: AtomicUsize,
}

#[derive(Debug, Serialize)]
struct StressSummary {
    threads: usize,
    iterations: usize,
    resources: usize,
    shared_grants: usize,
    exclusive_grants: usize,
    timed_out: usize,
    violations: usize,
    leftover_entries: usize,
    elapsed_ms: u128,
}

async fn cmd_stress(
    config: Config,
    options: StressOptions,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let manager = ResourceManager::new(config.resources);
    manager
        .register_namespace("stress", Arc::new(SimpleResourceFactory), false)
        .map_err(Error::from)?;

    let monitors: Arc<HashMap<String, HolderMonitor>> = Arc::new(
        (0..options.resources)
            .map(|i| (format!("res-{}", i), HolderMonitor::default()))
            .collect(),
    );
    let counters = Arc::new(StressCounters::default());

    info!(
        threads = options.threads,
        iterations = options.iterations,
        resources = options.resources,
        "Starting stress run"
    );
    let started = Instant::now();

    let mut workers = Vec::with_capacity(options.threads);
    for worker in 0..options.threads {
        let manager = manager.clone();
        let monitors = monitors.clone();
        let counters = counters.clone();
        let (iterations, resources, exclusive_every, timeout) = (
            options.iterations,
            options.resources,
            options.exclusive_every,
            options.timeout,
        );

        workers.push(tokio::spawn(async move {
            for i in 0..iterations {
                let name = format!("res-{}", (worker + i) % resources);
                let mode = if (worker * iterations + i) % exclusive_every == 0 {
                    LockMode::Exclusive
                } else {
                    LockMode::Shared
                };

                // Alternate between the future-based and the blocking paths
                let acquired = if (worker + i) % 2 == 0 {
                    manager.acquire_resource_async("stress", &name, mode).await
                } else {
                    let manager = manager.clone();
                    let blocking_name = name.clone();
                    tokio::task::spawn_blocking(move || {
                        manager.acquire_resource("stress", &blocking_name, mode, timeout)
                    })
                    .await?
                };

                let handle = match acquired {
                    Ok(handle) => handle,
                    Err(ResourceError::TimedOut { .. }) => {
                        counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    Err(e) => return Err(anyhow::Error::from(Error::from(e))),
                };

                if let Some(monitor) = monitors.get(&name) {
                    monitor.enter(mode);
                    tokio::task::yield_now().await;
                    monitor.leave(mode);
                }
                match mode {
                    LockMode::Shared => counters.shared.fetch_add(1, Ordering::Relaxed),
                    LockMode::Exclusive => counters.exclusive.fetch_add(1, Ordering::Relaxed),
                };
                handle.release();
            }
            debug!(worker, "Stress worker finished");
            Ok::<(), anyhow::Error>(())
        }));
    }

    for worker in workers {
        worker.await??;
    }

    let summary = StressSummary {
        threads: options.threads,
        iterations: options.iterations,
        resources: options.resources,
        shared_grants: counters.shared.load(Ordering::Relaxed),
        exclusive_grants: counters.exclusive.load(Ordering::Relaxed),
        timed_out: counters.timed_out.load(Ordering::Relaxed),
        violations: monitors
            .values()
            .map(|m| m.violations.load(Ordering::SeqCst))
            .sum(),
        leftover_entries: manager.list_resources().len(),
        elapsed_ms: started.elapsed().as_millis(),
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Text if !quiet => {
            println!("Stress run finished in {} ms", summary.elapsed_ms);
            println!("  Shared grants:    {}", summary.shared_grants);
            println!("  Exclusive grants: {}", summary.exclusive_grants);
            println!("  Timed out:        {}", summary.timed_out);
            println!("  Violations:       {}", summary.violations);
            println!("  Leftover entries: {}", summary.leftover_entries);
        }
        OutputFormat::Text => {}
    }

    if summary.violations > 0 {
        anyhow::bail!("{} holders were granted incompatible access", summary.violations);
    }
    if summary.leftover_entries > 0 {
        anyhow::bail!("{} lock entries outlived their holders", summary.leftover_entries);
    }
    Ok(())
}

// ============================================================================
// Scenarios
// ============================================================================

#[derive(Debug, Serialize)]
struct QueuedRequest {
    index: usize,
    mode: LockMode,
    state: RequestState,
}

fn cmd_scenario(action: ScenarioAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ScenarioAction::Barrier { cancel_barrier } => {
            let manager = ResourceManager::new(ResourceConfig::default().with_auto_release_logging(false));
            manager
                .register_namespace("demo", Arc::new(SimpleResourceFactory), false)
                .map_err(Error::from)?;

            let holder = manager
                .acquire_resource("demo", "disk", LockMode::Exclusive, None)
                .map_err(Error::from)?;

            // Handles stay alive here so granted requests keep holding
            let delivered: Arc<Mutex<Vec<ResourceHandle>>> = Arc::default();
            let modes = [
                LockMode::Shared,
                LockMode::Shared,
                LockMode::Exclusive,
                LockMode::Shared,
                LockMode::Shared,
            ];
            let mut requests: Vec<RequestHandle> = Vec::with_capacity(modes.len());
            for mode in modes {
                let delivered = delivered.clone();
                let request = manager
                    .register_resource("demo", "disk", mode, move |_, resource| {
                        if let Some(resource) = resource {
                            delivered
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(resource);
                        }
                    })
                    .map_err(Error::from)?;
                requests.push(request);
            }

            if cancel_barrier {
                requests[2].cancel().map_err(Error::from)?;
            }
            holder.release();

            let report: Vec<QueuedRequest> = requests
                .iter()
                .enumerate()
                .map(|(index, request)| QueuedRequest {
                    index,
                    mode: request.mode(),
                    state: request.state(),
                })
                .collect();

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text => {
                    if !quiet {
                        println!("Exclusive holder released; queued requests:");
                    }
                    for entry in &report {
                        println!("  #{} {:<9} {}", entry.index, entry.mode, entry.state);
                    }
                }
            }
            Ok(())
        }
    }
}

// ============================================================================
// Config
// ============================================================================

fn cmd_config(
    action: ConfigAction,
    loaded: anyhow::Result<Config>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = loaded?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Text => {
                    for key in Config::keys() {
                        println!("{} = {}", key, config.get(key)?);
                    }
                }
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
        ConfigAction::Get { key } => {
            let config = loaded?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            // Setting a key is how a broken file gets repaired
            let mut config = loaded.unwrap_or_default();
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
    }
    Ok(())
}
