use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use convergence_bench::config::{Config, LoggingConfig};
use convergence_bench::metrics::{run_phase, MetricsCollector, Reporter};
use convergence_bench::monitor::presets;
use convergence_bench::monitor::sources::{stat_samplers, StatsSource};
use convergence_bench::probe::runner::{self, RunPlan};
use convergence_bench::redis_client::{self, RedisFeedSource, RedisStats, RedisWriter};
use convergence_bench::{server, wait_for_convergence, AppState, LatencyProbe, Target};

#[derive(Parser, Debug)]
#[command(name = "convergence-bench")]
#[command(about = "Convergence polling and write-to-feed latency probing", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults to ./convergence-bench.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL, overriding configuration and environment
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the probe control API and live metrics
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Take latency samples and print their percentiles
    Probe {
        #[arg(long, default_value = "10")]
        count: u64,

        /// Pause between probes (defaults to probe.sample_interval_ms)
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Wait for Redis INFO metrics to drain to zero
    Drain {
        /// Comma-separated INFO fields
        #[arg(long, value_delimiter = ',', required = true)]
        metrics: Vec<String>,

        #[arg(long)]
        max_wait_secs: Option<u64>,
    },

    /// Wait for an INFO metric to equal an expected count
    Count {
        #[arg(long, default_value = "dbsize")]
        metric: String,

        #[arg(long)]
        expected: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }
    if let Commands::Serve { port: Some(port) } = cli.command {
        config.server.port = port;
    }
    config.validate()?;

    init_logging(&config.logging);

    match cli.command {
        Commands::Serve { .. } => serve(config).await,
        Commands::Probe { count, interval_ms } => probe(config, count, interval_ms).await,
        Commands::Drain {
            metrics,
            max_wait_secs,
        } => drain(config, metrics, max_wait_secs).await,
        Commands::Count { metric, expected } => count(config, metric, expected).await,
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = fmt().with_env_filter(filter).with_target(false);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

async fn build_probe(config: &Config) -> Result<LatencyProbe, Box<dyn std::error::Error>> {
    // Feeds block their connection on XREAD, so each probe opens its own.
    let writer_conn = redis_client::connect(&config.redis.url).await?;
    let writer = RedisWriter::new(writer_conn, config.redis.record_prefix.clone())
        .publishing_to(config.redis.change_stream.clone());
    let feeds = RedisFeedSource::new(
        redis_client::open_client(&config.redis.url)?,
        config.redis.change_stream.clone(),
        config.redis.feed_batch_size,
    );
    Ok(LatencyProbe::new(
        Arc::new(writer),
        Arc::new(feeds),
        config.probe_settings(),
    ))
}

// ─── serve ───────────────────────────────────────────────────────

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("╔══════════════════════════════════════════════════╗");
    println!("║   CONVERGENCE BENCH: write → feed latency        ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    let probe = build_probe(&config).await?;
    let addr = config.listen_addr();
    let state = Arc::new(AppState::new(config, probe));
    let app = server::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");
    println!("Probe control   → POST http://{addr}/api/probe/start");
    println!("Metrics SSE     → http://{addr}/api/metrics/stream");
    println!("Metrics JSON    → http://{addr}/api/metrics");
    println!();

    axum::serve(listener, app).await?;
    Ok(())
}

// ─── probe ───────────────────────────────────────────────────────

async fn probe(
    config: Config,
    count: u64,
    interval_ms: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let probe = build_probe(&config).await?;
    let settings = probe.settings().clone();
    let interval = interval_ms.map_or(settings.sample_interval, Duration::from_millis);

    // Long enough for every probe to run out its own timeout.
    let per_probe = settings.timeout + interval;
    let plan = RunPlan {
        duration: per_probe.saturating_mul(u32::try_from(count).unwrap_or(u32::MAX)),
        max_probes: Some(count),
        interval,
    };

    let metrics = Arc::new(MetricsCollector::new());
    let reporter: Arc<dyn Reporter> = metrics.clone();
    let summary = runner::run(Arc::new(AtomicBool::new(true)), reporter, probe, plan).await;

    let snap = metrics.snapshot();
    println!("{} probes, {} failed", summary.probes, summary.failures);
    println!("latency: {}", snap.latency.summary());
    for (kind, n) in &snap.failures_by_kind {
        println!("  {kind}: {n}");
    }
    Ok(())
}

// ─── drain / count ───────────────────────────────────────────────

async fn drain(
    config: Config,
    metrics: Vec<String>,
    max_wait_secs: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn = redis_client::connect(&config.redis.url).await?;
    let stats: Arc<dyn StatsSource> = Arc::new(RedisStats::new(conn));

    let mut policy = config.poll_policy().absent_is_terminal();
    if let Some(secs) = max_wait_secs {
        policy.max_wait = Duration::from_secs(secs);
    }

    let names: Vec<&str> = metrics.iter().map(String::as_str).collect();
    let collector = MetricsCollector::new();
    let res = run_phase(
        &collector,
        "drain",
        wait_for_convergence(stat_samplers(&stats, &names), Target::Zero, &policy),
    )
    .await;
    print_phases(&collector);
    res?;
    Ok(())
}

async fn count(
    config: Config,
    metric: String,
    expected: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn = redis_client::connect(&config.redis.url).await?;
    let stats: Arc<dyn StatsSource> = Arc::new(RedisStats::new(conn));

    let mut policy = config.poll_policy();
    if policy.max_retries.is_none() {
        policy = policy.with_max_retries(presets::MAX_RETRY);
    }
    let collector = MetricsCollector::new();
    let res = run_phase(
        &collector,
        &format!("count:{metric}"),
        presets::wait_for_item_count(stats, &metric, expected, &policy),
    )
    .await;
    print_phases(&collector);
    res?;
    Ok(())
}

fn print_phases(collector: &MetricsCollector) {
    for outcome in collector.snapshot().phases {
        if let Ok(json) = serde_json::to_string_pretty(&outcome) {
            println!("{json}");
        }
    }
}
