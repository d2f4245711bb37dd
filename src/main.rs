use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tracefeed::config::Config;
use tracefeed::decode::{Decoder, ManifestCache};
use tracefeed::health::HealthMetrics;
use tracefeed::producer::TraceProducer;
use tracefeed::sink::buffered::BufferedFileSink;
use tracefeed::sink::memory::MemorySink;
use tracefeed::sink::{Sink, SinkSet};

/// Incremental trace-log ingestion agent.
#[derive(Parser)]
#[command(name = "tracefeed", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Run a single pass over all providers and exit.
    Once,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("tracefeed {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cfg.log_level(cli.log_level.as_deref());
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        providers = cfg.providers.len(),
        "starting tracefeed",
    );

    let decoder = load_decoder(&cfg)?;
    let sinks = build_sinks(&cfg);

    if let Some(Command::Once) = &cli.command {
        let producer = TraceProducer::from_config(&cfg, sinks, decoder, None)?;
        let summary = producer.flush();
        for outcome in &summary.providers {
            tracing::info!(
                provider = %outcome.provider,
                files = outcome.files_read,
                records = outcome.records_dispatched,
                checkpoint = ?outcome.checkpoint,
                stopped = ?outcome.stopped,
                "provider summary",
            );
        }
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, sinks, decoder).await })
}

/// Load the decode manifest named in the configuration, if any.
fn load_decoder(cfg: &Config) -> Result<Option<Arc<dyn Decoder>>> {
    let Some(path) = &cfg.manifest_path else {
        return Ok(None);
    };
    let cache = ManifestCache::load(path)
        .with_context(|| format!("loading manifest {}", path.display()))?;
    tracing::info!(manifests = cache.len(), "decode manifest loaded");
    Ok(Some(Arc::new(cache)))
}

fn build_sinks(cfg: &Config) -> SinkSet {
    let mut sinks = SinkSet::default();

    if cfg.sinks.memory.enabled {
        let sink = if cfg.sinks.memory.decoded {
            MemorySink::decoded("memory", cfg.sinks.memory.capacity)
        } else {
            MemorySink::raw("memory", cfg.sinks.memory.capacity)
        };
        sinks.push(Arc::new(sink) as Arc<dyn Sink>);
    }

    if cfg.sinks.buffered.enabled {
        if let Some(dir) = &cfg.sinks.buffered.directory {
            let sink = BufferedFileSink::new("buffered", dir)
                .with_retention(cfg.sinks.buffered.retention);
            sinks.push(Arc::new(sink) as Arc<dyn Sink>);
        }
    }

    if sinks.is_empty() {
        tracing::warn!("no sinks enabled, records will be read and dropped");
    }

    sinks
}

async fn run(cfg: Config, sinks: SinkSet, decoder: Option<Arc<dyn Decoder>>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let health = if cfg.health.enabled {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        health
            .start()
            .await
            .context("starting health metrics server")?;
        Some(health)
    } else {
        None
    };

    let mut producer = TraceProducer::from_config(&cfg, sinks, decoder, health.clone())?;
    producer.start();

    let _ = shutdown_rx.await;

    producer.stop().await;
    if let Some(health) = &health {
        health.stop().await;
    }

    tracing::info!("tracefeed stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "registering SIGTERM handler, only SIGINT is handled");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
