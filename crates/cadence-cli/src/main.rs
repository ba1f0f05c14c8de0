use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use cadence_host::{
    CadenceConfig, ConfigLoadError, EventBus, EventConsumer, EventEnvelope, FileFetcher,
    HostEvent, ScriptHost, ScriptRegistry,
};

mod directive;
mod logging;

use directive::DirectiveEvaluator;

#[derive(Parser)]
#[command(name = "cadence-soak")]
#[command(about = "Run many script hosts side by side, then stop them all")]
pub struct Args {
    /// Script files to run (default: the autoload list from the config)
    scripts: Vec<PathBuf>,

    /// Number of hosts to start per script
    #[arg(short, long, default_value = "4")]
    copies: u32,

    /// Seconds to run before stopping everything (0 waits for Ctrl+C)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Override the tick interval, in microseconds
    #[arg(long)]
    tick_us: Option<u64>,

    /// Config file (default: the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stats display interval in seconds
    #[arg(long, default_value = "5")]
    stats_interval: u64,

    /// Also write logs to the data directory
    #[arg(long)]
    log_file: bool,

    /// Log every printed message
    #[arg(short, long)]
    verbose: bool,
}

/// Counters shared between the stats consumer and the reporter
#[derive(Default)]
struct EventCounts {
    loaded: AtomicU32,
    updates: AtomicU32,
    printed: AtomicU32,
    errors: AtomicU32,
    finished: AtomicU32,
}

impl EventCounts {
    fn summary(&self) -> String {
        format!(
            "Updates: {} | Printed: {} | Errors: {} | Finished: {}",
            self.updates.load(Ordering::SeqCst),
            self.printed.load(Ordering::SeqCst),
            self.errors.load(Ordering::SeqCst),
            self.finished.load(Ordering::SeqCst),
        )
    }
}

/// Event consumer for soak runs
struct StatsConsumer {
    counts: Arc<EventCounts>,
    verbose: bool,
}

impl EventConsumer for StatsConsumer {
    fn handle_event(&mut self, envelope: EventEnvelope) {
        let host = envelope.host_id();
        match envelope.event {
            HostEvent::ScriptLoaded { .. } => {
                self.counts.loaded.fetch_add(1, Ordering::SeqCst);
            }
            HostEvent::Update { .. } => {
                self.counts.updates.fetch_add(1, Ordering::SeqCst);
            }
            HostEvent::PrintedMessage { message } => {
                self.counts.printed.fetch_add(1, Ordering::SeqCst);
                if self.verbose {
                    info!("[Host {}] {}", host, message);
                }
            }
            HostEvent::ErrorMessage { message } => {
                self.counts.errors.fetch_add(1, Ordering::SeqCst);
                warn!("[Host {}] {}", host, message);
            }
            HostEvent::ErrorLoadingScript { origin } => {
                self.counts.errors.fetch_add(1, Ordering::SeqCst);
                error!("[Host {}] Failed to load {}", host, origin);
            }
            HostEvent::LoadScriptRequest { url, .. } => {
                info!("[Host {}] Asked to load {} (ignored by soak runs)", host, url);
            }
            HostEvent::DoneRunning => {
                self.counts.finished.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<CadenceConfig> {
    let loaded = match &args.config {
        Some(path) => CadenceConfig::load_from(path),
        None => CadenceConfig::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(ConfigLoadError::NotFound) if args.config.is_none() => CadenceConfig::default(),
        Err(e) => return Err(e).context("failed to load config"),
    };
    if let Some(tick_us) = args.tick_us {
        config.host.tick_interval_us = tick_us;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = logging::init_logging("soak", args.log_file)?;
    let config = load_config(&args)?;

    let scripts: Vec<String> = if args.scripts.is_empty() {
        config.scripts.autoload_paths()
    } else {
        args.scripts
            .iter()
            .map(|path| path.display().to_string())
            .collect()
    };
    if scripts.is_empty() {
        bail!("no scripts given and nothing to autoload in the config");
    }

    info!(
        "Starting soak run: {} script(s) x {} copies, tick {:?}",
        scripts.len(),
        args.copies,
        config.host.tick_interval()
    );

    let registry = Arc::new(ScriptRegistry::new());
    let (bus, mut events) = EventBus::new(config.host.event_capacity);
    let fetcher = Arc::new(FileFetcher::new(tokio::runtime::Handle::current()));
    let counts = Arc::new(EventCounts::default());
    let start_time = Instant::now();

    // Consumer task
    let mut consumer = StatsConsumer {
        counts: counts.clone(),
        verbose: args.verbose,
    };
    let consumer_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => consumer.handle_event(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Stats consumer lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut threads = Vec::new();
    for script in &scripts {
        for _ in 0..args.copies {
            let host = ScriptHost::builder(registry.clone(), Box::new(DirectiveEvaluator))
                .config(config.host.clone())
                .event_bus(bus.clone())
                .fetcher(fetcher.clone())
                .build();
            if let Err(e) = host.load_url(script) {
                warn!("Could not load {}: {}", script, e);
                continue;
            }
            let (_, thread) = host
                .spawn()
                .with_context(|| format!("failed to start host for {}", script))?;
            threads.push(thread);
        }
    }
    info!("Spawned {} host(s)", threads.len());

    // Stats display task
    let stats_counts = counts.clone();
    let stats_registry = registry.clone();
    let stats_interval = args.stats_interval.max(1);
    let stats_handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(stats_interval)).await;
            info!(
                "[Stats @ {}s] Hosts: {} | {}",
                start_time.elapsed().as_secs(),
                stats_registry.len(),
                stats_counts.summary()
            );
        }
    });

    if args.duration == 0 {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, stopping all scripts..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    } else {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {
                info!("Soak duration reached, stopping all scripts...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping all scripts...");
            }
        }
    }

    registry.stop_all().await;
    stats_handle.abort();

    for thread in threads {
        if thread.join().is_err() {
            error!("A script host thread panicked");
        }
    }
    drop(bus);
    let _ = consumer_handle.await;

    info!("Soak run complete");
    info!("Total time: {:.2}s", start_time.elapsed().as_secs_f64());
    info!("Scripts loaded: {}", counts.loaded.load(Ordering::SeqCst));
    info!("{}", counts.summary());
    info!("Hosts still registered: {}", registry.len());
    Ok(())
}
