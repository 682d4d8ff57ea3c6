//! Rewind - rate-limited match history analysis
//!
//! Fetches a player's recent matches under the telemetry API's quota,
//! caches them durably, aggregates statistics and asks an inference
//! service for a narrative while streaming progress to observers.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, upstream, job failure, etc.)

mod analysis;
mod cache;
mod cli;
mod config;
mod error;
mod limiter;
mod models;
mod orchestrator;
mod progress;
mod report;
mod server;
mod upstream;

use anyhow::{bail, Context, Result};
use cli::{Args, Command, OutputFormat};
use config::{Config, DEFAULT_CONFIG_FILE};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cache::RecordCache;
use limiter::{AdaptiveBackoff, QuotaLimiter};
use models::JobStatus;
use orchestrator::{JobRequest, Orchestrator, Services};
use progress::Step;
use upstream::{ChatClient, InferenceService, RiotClient, TelemetrySource};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle init-config early (no logging needed)
    if matches!(args.command, Command::InitConfig) {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Rewind v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args).await {
        error!("Command failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Handle init-config: generate a default .rewind.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Set RIOT_API_KEY or [telemetry].api_key before running.");
    Ok(())
}

/// Initialize logging; `RUST_LOG` overrides the verbosity flags.
fn init_logging(args: &Args) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(args.log_level()).into())
        .from_env_lossy();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config
        .validate(args.needs_api_key())
        .context("Invalid configuration")?;

    match args.command.clone() {
        Command::Serve { .. } => run_server(&config).await,
        Command::Analyze {
            player,
            name,
            count,
            format,
            output,
        } => {
            let output = output.unwrap_or_else(|| format.default_output());
            run_analysis(&config, player, name, count, format, output, args.quiet).await
        }
        Command::Sweep { .. } => run_sweep(&config).await,
        Command::InitConfig => handle_init_config(),
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default()? {
        Some(config) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        None => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

async fn open_cache(config: &Config) -> Result<RecordCache> {
    RecordCache::open(&config.cache.dir, config.ttl_policy())
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache.dir.display()))
}

/// The service cache: on disk unless `[cache].persist` is off.
async fn service_cache(config: &Config) -> Result<RecordCache> {
    if config.cache.persist {
        open_cache(config).await
    } else {
        info!("Cache persistence disabled, records are kept in memory");
        Ok(RecordCache::in_memory(config.ttl_policy()))
    }
}

async fn build_services(config: &Config) -> Result<Services> {
    let telemetry: Arc<dyn TelemetrySource> = Arc::new(
        RiotClient::new(config.riot_client_config()).context("Failed to build telemetry client")?,
    );
    let inference: Arc<dyn InferenceService> = Arc::new(
        ChatClient::new(config.chat_client_config())
            .context("Failed to build inference client")?,
    );

    Ok(Services {
        telemetry,
        inference,
        quota: Arc::new(QuotaLimiter::new(config.quota_windows())),
        backoff: Arc::new(AdaptiveBackoff::new(config.backoff_policy())),
        cache: Arc::new(service_cache(config).await?),
    })
}

async fn run_server(config: &Config) -> Result<()> {
    let services = build_services(config).await?;
    let orchestrator = Orchestrator::new(services, config.pipeline_settings());
    let reaper = orchestrator.spawn_reaper();

    let state = server::AppState {
        orchestrator,
        keepalive: Duration::from_secs(config.server.keepalive_secs),
    };
    let result = server::serve(&config.server.bind, state, &config.server.cors_origins).await;
    reaper.abort();
    result
}

async fn run_analysis(
    config: &Config,
    player: String,
    name: Option<String>,
    count: usize,
    format: OutputFormat,
    output: PathBuf,
    quiet: bool,
) -> Result<()> {
    let start_time = Instant::now();
    let services = build_services(config).await?;

    let model_used = services.inference.model_name().to_string();
    let orchestrator = Orchestrator::new(services, config.pipeline_settings());

    let mut request = match player.split_once('#') {
        Some((game_name, tag_line)) => {
            println!("🔎 Resolving Riot ID {}", player);
            JobRequest::by_riot_id(game_name, tag_line)
        }
        None => JobRequest::new(player),
    };
    request.display_name = name;
    request.record_count = count;

    let ticket = orchestrator
        .submit(request)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    info!("Started job {}", ticket.job_id);

    let Some(mut subscription) = orchestrator.subscribe(ticket.job_id) else {
        bail!("Job {} vanished before it could be observed", ticket.job_id);
    };

    let bar = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar.enable_steady_tick(Duration::from_millis(120));

    while let Some(event) = subscription.next().await {
        bar.set_position(u64::from(event.percent));
        bar.set_message(event.message.clone());
        if event.step == Step::Error {
            bar.abandon_with_message(event.message);
        } else if event.step == Step::Complete {
            bar.finish_with_message(event.message);
        }
    }

    let Some(snapshot) = orchestrator.snapshot(ticket.job_id) else {
        bail!("Job {} is no longer tracked", ticket.job_id);
    };

    let result = match (snapshot.status, snapshot.result) {
        (JobStatus::Complete, Some(result)) => result,
        _ => {
            let reason = snapshot
                .error
                .unwrap_or_else(|| "analysis ended without a result".to_string());
            match snapshot.retry_after_secs {
                Some(secs) => bail!("{} (retry after {}s)", reason, secs),
                None => bail!("{}", reason),
            }
        }
    };

    let run = report::RunMetadata {
        model_used,
        duration_seconds: start_time.elapsed().as_secs_f64(),
    };
    report::write_report(&result, &run, format, &output)?;

    println!("\n📊 Analysis Summary:");
    println!("   Player: {}", result.display_name);
    println!("   Rank: {}", result.rank);
    println!("   Main role: {}", result.main_role);
    println!("   {}", result.coverage_note());
    if !result.personality.is_empty() {
        println!("   Personality: {}", result.personality);
    }
    for note in &result.notes {
        println!("   ⚠️  {}", note);
    }
    println!("   Duration: {:.1}s", run.duration_seconds);
    println!("\n✅ Report saved to: {}", output.display());

    Ok(())
}

async fn run_sweep(config: &Config) -> Result<()> {
    let cache = open_cache(config).await?;
    let max_age = config.sweep_max_age();

    println!(
        "🧹 Sweeping cache entries older than {} days in {}",
        config.cache.sweep_max_age_days,
        config.cache.dir.display()
    );
    let summary = cache.sweep_stale(max_age).await?;
    let stats = cache.stats().await;

    println!(
        "   Removed {} matches and {} profiles",
        summary.matches, summary.profiles
    );
    println!(
        "   Remaining: {} matches ({} bytes), {} profiles ({} bytes)",
        stats.matches.total, stats.matches.disk_bytes, stats.profiles.total, stats.profiles.disk_bytes
    );
    Ok(())
}
