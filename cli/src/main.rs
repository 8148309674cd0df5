// qtop — phase-driven stream delay injection
//
// Command-line driver for the core pipeline: simulate or replay stream
// events through the interceptor, inspect the seed pool, and check the
// delay window for a circuit.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use parking_lot::Mutex;
use qtop_core::control::{
    ControlEvent, DelayExecutor, LocalEventSource, RecordingExecutor, StreamDelayHandler,
    StreamEvent, StreamEventInterceptor, StreamStatus, ThreadSleepExecutor,
};
use qtop_core::entropy::{block_to_scalar, FALLBACK_SCALAR};
use qtop_core::monitoring::{
    interceptor_check, pool_check, HealthRegistry, MetricsRegistry, STREAM_DELAY_MS,
};
use qtop_core::privacy::{SharedEngine, SharedPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "qtop")]
#[command(about = "QTOP — phase-driven stream delay injection", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed synthetic stream events through the interceptor
    Simulate {
        #[arg(short, long, default_value = "4")]
        circuits: u64,
        #[arg(short, long, default_value = "8")]
        streams: u64,
        /// Record delays instead of sleeping
        #[arg(long)]
        no_wait: bool,
    },
    /// Feed newline-delimited JSON stream events from a file
    Replay {
        file: PathBuf,
        #[arg(long)]
        no_wait: bool,
    },
    /// Compute sample delays for a circuit and check each against the window
    CheckCircuit {
        circuit_id: u64,
        #[arg(short, long, default_value = "10")]
        samples: u64,
    },
    /// Preload the seed pool and show the first draws
    Pool {
        #[arg(short, long, default_value = "5")]
        draws: usize,
        /// Also show paired draws in [-1, 1)
        #[arg(long)]
        complex: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::Config::config_file()?,
    };

    match cli.command {
        Commands::Simulate {
            circuits,
            streams,
            no_wait,
        } => cmd_simulate(&config_path, circuits, streams, no_wait).await,
        Commands::Replay { file, no_wait } => cmd_replay(&config_path, &file, no_wait).await,
        Commands::CheckCircuit {
            circuit_id,
            samples,
        } => cmd_check_circuit(&config_path, circuit_id, samples),
        Commands::Pool { draws, complex } => cmd_pool(&config_path, draws, complex),
        Commands::Config { action } => cmd_config(&config_path, action),
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Wraps the real executor and remembers the last delay so the feed loop
/// can report it next to the event
struct ReportingExecutor {
    inner: Arc<dyn DelayExecutor>,
    last: Mutex<Option<Duration>>,
}

impl ReportingExecutor {
    fn new(no_wait: bool) -> Self {
        let inner: Arc<dyn DelayExecutor> = if no_wait {
            Arc::new(RecordingExecutor::new())
        } else {
            Arc::new(ThreadSleepExecutor)
        };
        Self {
            inner,
            last: Mutex::new(None),
        }
    }

    fn take(&self) -> Option<Duration> {
        self.last.lock().take()
    }
}

impl DelayExecutor for ReportingExecutor {
    fn wait(&self, delay: Duration) {
        *self.last.lock() = Some(delay);
        self.inner.wait(delay);
    }
}

struct Session {
    pool: SharedPool,
    engine: SharedEngine,
    source: Arc<LocalEventSource>,
    executor: Arc<ReportingExecutor>,
    metrics: Arc<MetricsRegistry>,
    interceptor: Arc<StreamEventInterceptor>,
}

#[derive(Debug, Default)]
struct FeedSummary {
    delayed: usize,
    ignored: usize,
    total: Duration,
    interrupted: bool,
}

fn start_session(config: &config::Config, no_wait: bool) -> Result<Session> {
    let (pool, engine) = config.build_engine()?;

    // the in-process source accepts the configured password
    let source = Arc::new(match &config.control.password {
        Some(password) => LocalEventSource::with_password(password.clone()),
        None => LocalEventSource::new(),
    });

    let executor = Arc::new(ReportingExecutor::new(no_wait));
    let metrics = Arc::new(MetricsRegistry::new());
    let handler =
        StreamDelayHandler::new(engine.clone(), executor.clone()).with_metrics(metrics.clone());
    let interceptor = Arc::new(StreamEventInterceptor::with_handler(
        source.clone(),
        handler,
        config.control.clone(),
    ));

    interceptor
        .start()
        .context("Failed to start stream interception")?;
    info!(
        "Session started: phase source {}, {} seeds",
        engine.lock().phase_source_name(),
        pool.lock().len()
    );

    Ok(Session {
        pool,
        engine,
        source,
        executor,
        metrics,
        interceptor,
    })
}

fn feed(
    source: &LocalEventSource,
    executor: &ReportingExecutor,
    interceptor: &StreamEventInterceptor,
    events: Vec<StreamEvent>,
) -> FeedSummary {
    let mut summary = FeedSummary::default();
    for event in events {
        if !interceptor.is_active() {
            summary.interrupted = true;
            break;
        }
        let line = event.to_string();
        if !source.dispatch(&ControlEvent::Stream(event)) {
            summary.interrupted = true;
            break;
        }
        match executor.take() {
            Some(delay) => {
                summary.delayed += 1;
                summary.total += delay;
                println!(
                    "  {} {:<48} {}",
                    "→".bright_green(),
                    line,
                    format!("{:.3}ms", delay.as_secs_f64() * 1000.0).bright_yellow()
                );
            }
            None => {
                summary.ignored += 1;
                println!("  {} {}", "·".dimmed(), line.dimmed());
            }
        }
    }
    summary
}

async fn run_session(session: Session, events: Vec<StreamEvent>) -> Result<()> {
    let signal_target = session.interceptor.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping interception");
            signal_target.stop();
        }
    });

    let source = session.source.clone();
    let executor = session.executor.clone();
    let interceptor = session.interceptor.clone();
    let summary =
        tokio::task::spawn_blocking(move || feed(&source, &executor, &interceptor, events))
            .await
            .context("Event feed task failed")?;
    signal.abort();

    println!();
    if summary.interrupted {
        println!("{}", "Interception stopped before all events were fed.".yellow());
    }
    println!("{}", "Summary".bold());
    println!("  Delayed streams:  {}", summary.delayed);
    println!("  Ignored events:   {}", summary.ignored);
    println!(
        "  Injected latency: {:.3}ms",
        summary.total.as_secs_f64() * 1000.0
    );
    if let Some(histogram) = session.metrics.histogram(STREAM_DELAY_MS) {
        println!(
            "  Delay min/mean/max: {:.3} / {:.3} / {:.3} ms",
            histogram.min,
            histogram.mean(),
            histogram.max
        );
    }
    println!(
        "  Tracked circuits: {}",
        session.engine.lock().tracked_circuits()
    );

    let mut health = HealthRegistry::new();
    health.register("seed_pool", pool_check(session.pool.clone(), 0.5));
    health.register("interceptor", interceptor_check(session.interceptor.clone()));
    let status = health.status();

    println!();
    println!("{}", "Health".bold());
    for (name, check) in &status.checks {
        let mark = if check.healthy { "✓".green() } else { "✗".red() };
        println!("  {} {:<12} {}", mark, name, check.message);
    }

    println!();
    println!("{}", "Metrics".bold());
    for line in session.metrics.render_prometheus().lines() {
        println!("  {}", line.dimmed());
    }

    session.interceptor.stop();
    Ok(())
}

fn synthetic_events(circuits: u64, streams: u64) -> Vec<StreamEvent> {
    let circuits = circuits.max(1);
    let mut events = Vec::new();
    for i in 0..streams {
        let stream_id = (i + 1).to_string();
        let circuit_id = i % circuits + 1;
        let target = format!("10.0.{}.{}:443", i / 250, i % 250 + 1);
        let attach = if i % 2 == 0 {
            StreamStatus::New
        } else {
            StreamStatus::NewResolve
        };
        for status in [attach, StreamStatus::Succeeded, StreamStatus::Closed] {
            events.push(StreamEvent::new(stream_id.clone(), circuit_id, status).with_target(&target));
        }
    }
    events
}

fn read_events(file: &Path) -> Result<Vec<StreamEvent>> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut events = Vec::new();
    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: StreamEvent = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid stream event", file.display(), n + 1))?;
        events.push(event);
    }
    Ok(events)
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn cmd_simulate(config_path: &Path, circuits: u64, streams: u64, no_wait: bool) -> Result<()> {
    let config = config::Config::load_from(config_path)?;
    let session = start_session(&config, no_wait)?;

    println!("{}", "QTOP — Simulating stream events".bold());
    println!(
        "  {} streams over {} circuits, window {}–{}ms",
        streams, circuits, config.timing.min_delay, config.timing.max_delay
    );
    println!();

    run_session(session, synthetic_events(circuits, streams)).await
}

async fn cmd_replay(config_path: &Path, file: &Path, no_wait: bool) -> Result<()> {
    let config = config::Config::load_from(config_path)?;
    let events = read_events(file)?;
    let session = start_session(&config, no_wait)?;

    println!("{}", "QTOP — Replaying stream events".bold());
    println!("  {} events from {}", events.len(), file.display().to_string().bright_cyan());
    println!();

    run_session(session, events).await
}

fn cmd_check_circuit(config_path: &Path, circuit_id: u64, samples: u64) -> Result<()> {
    let config = config::Config::load_from(config_path)?;
    let (_pool, engine) = config.build_engine()?;
    let mut engine = engine.lock();

    println!("{} {}", "Circuit".bold(), circuit_id.to_string().bright_cyan());
    println!(
        "  {:>4}  {:>10}  {:>10}  {:>3}  {:>10}",
        "#", "phase", "delta", "k", "delay(ms)"
    );

    let mut failures = 0;
    for sample in 0..samples {
        let fingerprint =
            StreamEvent::new(sample.to_string(), circuit_id, StreamStatus::New).fingerprint();
        let computation = engine.compute(circuit_id, fingerprint);
        let ok = engine.verify_winding(circuit_id, computation.delay);
        if !ok {
            failures += 1;
        }
        let mark = if ok { "✓".green() } else { "✗".red() };
        println!(
            "  {:>4}  {:>10.6}  {:>10.6}  {:>3}  {:>10.4}  {}",
            sample + 1,
            computation.phase,
            computation.delta,
            computation.winding,
            computation.delay,
            mark
        );
    }

    println!();
    if failures == 0 {
        println!("{} All {} delays within window", "✓".green(), samples);
        Ok(())
    } else {
        anyhow::bail!("{} of {} delays outside the window", failures, samples)
    }
}

fn cmd_pool(config_path: &Path, draws: usize, complex: bool) -> Result<()> {
    let config = config::Config::load_from(config_path)?;
    let pool = config.build_pool()?;
    let mut pool = pool.lock();

    println!("{}", "Seed Pool".bold());
    println!("  Source:   {}", config.pool.source.bright_cyan());
    println!("  Loaded:   {} / {}", pool.len(), pool.capacity());
    println!("  Sources:  {}", pool.sources().ids().join(", "));
    println!();

    for i in 0..draws {
        match pool.draw_block() {
            Some(block) => println!(
                "  {:>4}  {}…  {:.12}",
                i,
                hex::encode(&block[..8]).dimmed(),
                block_to_scalar(&block)
            ),
            None => println!("  {:>4}  (empty)  {:.12}", i, FALLBACK_SCALAR),
        }
    }

    if complex {
        println!();
        for _ in 0..draws {
            let (re, im) = pool.draw_complex();
            println!("  {:+.9} {:+.9}i", re, im);
        }
    }

    let stats = pool.stats();
    println!();
    println!(
        "  Cursor: {}  Hits: {}  Misses: {}  Hit rate: {:.3}",
        stats.cursor, stats.hits, stats.misses, stats.hit_rate
    );
    Ok(())
}

fn cmd_config(config_path: &Path, action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load_from(config_path)?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save_to(config_path)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None if config.list().iter().any(|(k, _)| *k == key) => {
                println!("{} = {}", key.bright_cyan(), "(unset)".dimmed())
            }
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }

    Ok(())
}
