//! CLI entry point for the GTFS feed cache.
//!
//! Provides subcommands for refreshing the configured feeds, inspecting and
//! diffing local archives, and triggering a graph rebuild when feeds change.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use gtfs_feed_cache::{
    cache::CacheManager,
    clock::{Clock, FixedClock, SystemClock},
    config::Config,
    diff::FeedDiff,
    fetch::{BasicClient, HttpClient},
    info::FeedInfo,
    output::{append_changelog, append_record, print_json, print_pretty},
    policy::FreshnessPolicy,
    rebuild::{CHANGELOG_NAME, CommandBuilder, GraphArtifact, RebuildOrchestrator},
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_feed_cache")]
#[command(about = "Keeps a cache of transit feeds fresh and decides when to rebuild", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true, default_value = "feeds.toml")]
    config: PathBuf,

    /// Override the configured cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Pretend today is this date (YYYY-MM-DD) for staleness checks
    #[arg(long, global = true)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh every configured feed and report freshness
    Check {
        /// Download bodies even when the remote says nothing changed
        #[arg(short, long, default_value_t = false)]
        force: bool,

        /// CSV file to append one row per feed to
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Fetch a single feed into the cache
    Fetch {
        #[arg(value_name = "URL")]
        url: String,

        /// Cache file name, e.g. trimet.zip
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
    /// Show date range, version and staleness of a local GTFS archive
    Info {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Days-until-end at or below which the feed counts as out of date
        #[arg(short, long, default_value_t = 0)]
        threshold: i64,
    },
    /// Compare two local GTFS archives table by table
    Diff {
        #[arg(value_name = "BASELINE")]
        a: PathBuf,

        #[arg(value_name = "CANDIDATE")]
        b: PathBuf,
    },
    /// Refresh feeds and run the graph builder if anything changed
    Rebuild {
        /// Rebuild even when feeds and graph are fresh
        #[arg(short, long, default_value_t = false)]
        force: bool,

        /// Only write the changelog and restore a failed graph; never build
        #[arg(long, default_value_t = false)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_feed_cache.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_feed_cache.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = match cli.today {
        Some(day) => Arc::new(FixedClock(day)),
        None => Arc::new(SystemClock),
    };

    match cli.command {
        Commands::Check { force, output } => {
            let config = load_config(&cli.config, cli.cache_dir, clock)?;
            let policy = FreshnessPolicy::new(config.clone(), cache_manager(&config)?);
            let report = policy.evaluate(force).await?;

            print_pretty(&report);
            print_json(&report)?;
            if let Some(path) = output {
                for feed in &report.feeds {
                    append_record(&path, feed)?;
                }
            }
            info!(should_rebuild = report.should_rebuild(), "Check complete");
        }
        Commands::Fetch { url, name, force } => {
            let dir = cli.cache_dir.unwrap_or_else(|| PathBuf::from("cache"));
            let cache = CacheManager::new(dir, http_client()?)?;
            let outcome = cache.fetch(&url, &name, force).await?;
            info!(
                name = %outcome.name,
                changed = outcome.changed,
                transferred = outcome.transferred,
                checksum = %outcome.snapshot.checksum,
                size = outcome.snapshot.size,
                "Fetched"
            );
        }
        Commands::Info { path, threshold } => {
            let info = FeedInfo::open(&path, clock)?;
            let summary = info.get_feed_info()?;
            let (since, until) = info.get_days_since_stats()?;
            info!(
                start = %summary.start_date,
                end = %summary.end_date,
                publisher = %summary.publisher,
                version = %summary.version,
                days_since = since,
                days_until = until,
                out_of_date = info.is_out_of_date(threshold)?,
                "Feed info"
            );
        }
        Commands::Diff { a, b } => {
            let diff = FeedDiff::with_clock(&a, &b, clock)?;
            info!(
                baseline = %diff.baseline().display(),
                candidate = %diff.candidate().display(),
                different = diff.is_different(),
                "{}",
                serde_json::to_string_pretty(diff.result())?
            );
        }
        Commands::Rebuild { force, mock } => {
            let config = load_config(&cli.config, cli.cache_dir, clock)?;
            let cache = cache_manager(&config)?;

            if mock {
                let policy = FreshnessPolicy::new(config.clone(), cache.clone());
                let report = policy.evaluate(false).await?;
                append_changelog(&cache.cache_dir().join(CHANGELOG_NAME), &report.feeds, Local::now())?;
                if let Some(graph) = &config.graph {
                    GraphArtifact::new(cache.cache_dir(), graph).promote_failed()?;
                }
                return Ok(());
            }

            let graph = config
                .graph
                .clone()
                .context("rebuild needs a [graph] section with a command")?;
            let builder = Arc::new(CommandBuilder::from_config(&graph)?);
            let orchestrator = RebuildOrchestrator::new(FreshnessPolicy::new(config, cache), builder);

            let outcome = orchestrator.run(force).await?;
            match outcome.reason {
                Some(reason) => info!(?reason, "Graph rebuilt"),
                None => info!("No rebuild needed"),
            }
            for feed in outcome.report.feeds.iter().filter(|f| f.is_error()) {
                warn!(
                    feed = %feed.name,
                    error = feed.error_message.as_deref().unwrap_or(""),
                    "Feed is in a questionable state"
                );
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path, cache_dir: Option<PathBuf>, clock: Arc<dyn Clock>) -> Result<Config> {
    let mut config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    if let Some(dir) = cache_dir {
        config = config.with_cache_dir(dir);
    }
    Ok(config.with_clock(clock))
}

fn http_client() -> Result<Arc<dyn HttpClient>> {
    Ok(Arc::new(BasicClient::with_connect_timeout(Duration::from_secs(30))?))
}

fn cache_manager(config: &Config) -> Result<Arc<CacheManager>> {
    Ok(Arc::new(CacheManager::from_config(config, http_client()?)?))
}
