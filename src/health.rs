use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "tracefeed";

/// Prometheus metrics for the ingestion passes.
///
/// All metrics use the "tracefeed" namespace. Per-provider series are
/// labelled with the provider's friendly name.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total passes run, timer-driven and out-of-band.
    pub passes_total: Counter,
    /// Wall-clock duration of a full pass.
    pub pass_duration: Histogram,
    /// Trace files read by provider and kind (active/inactive).
    pub files_processed: CounterVec,
    /// Records handed to sinks by provider.
    pub records_dispatched: CounterVec,
    /// Records whose timestamp was clamped forward.
    pub records_unordered: CounterVec,
    /// Records that failed to decode.
    pub decode_failures: CounterVec,
    /// Retried trace file open/read attempts.
    pub read_retries: CounterVec,
    /// Checkpoint writes that failed after all retries.
    pub checkpoint_write_failures: CounterVec,
    /// Last checkpoint value per provider, in seconds since the epoch.
    pub checkpoint_timestamp: GaugeVec,
    /// Providers that ran out of their share of the pass interval.
    pub deadline_exceeded: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let passes_total = Counter::with_opts(
            Opts::new("passes_total", "Total ingestion passes run.").namespace(NAMESPACE),
        )?;
        let pass_duration = Histogram::with_opts(
            HistogramOpts::new("pass_duration_seconds", "Duration of an ingestion pass.")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        let files_processed = CounterVec::new(
            Opts::new(
                "files_processed_total",
                "Trace files read by provider and kind.",
            )
            .namespace(NAMESPACE),
            &["provider", "kind"],
        )?;
        let records_dispatched = CounterVec::new(
            Opts::new(
                "records_dispatched_total",
                "Records dispatched to sinks by provider.",
            )
            .namespace(NAMESPACE),
            &["provider"],
        )?;
        let records_unordered = CounterVec::new(
            Opts::new(
                "records_unordered_total",
                "Records that arrived with a timestamp older than their predecessor.",
            )
            .namespace(NAMESPACE),
            &["provider"],
        )?;
        let decode_failures = CounterVec::new(
            Opts::new("decode_failures_total", "Records that failed to decode.")
                .namespace(NAMESPACE),
            &["provider"],
        )?;
        let read_retries = CounterVec::new(
            Opts::new("read_retries_total", "Retried trace file reads.").namespace(NAMESPACE),
            &["provider"],
        )?;
        let checkpoint_write_failures = CounterVec::new(
            Opts::new(
                "checkpoint_write_failures_total",
                "Checkpoint writes that failed after all retries.",
            )
            .namespace(NAMESPACE),
            &["provider"],
        )?;
        let checkpoint_timestamp = GaugeVec::new(
            Opts::new(
                "checkpoint_timestamp_seconds",
                "Current checkpoint per provider, seconds since the Unix epoch.",
            )
            .namespace(NAMESPACE),
            &["provider"],
        )?;
        let deadline_exceeded = CounterVec::new(
            Opts::new(
                "deadline_exceeded_total",
                "Providers that exhausted their time share before finishing.",
            )
            .namespace(NAMESPACE),
            &["provider"],
        )?;

        registry.register(Box::new(passes_total.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        registry.register(Box::new(files_processed.clone()))?;
        registry.register(Box::new(records_dispatched.clone()))?;
        registry.register(Box::new(records_unordered.clone()))?;
        registry.register(Box::new(decode_failures.clone()))?;
        registry.register(Box::new(read_retries.clone()))?;
        registry.register(Box::new(checkpoint_write_failures.clone()))?;
        registry.register(Box::new(checkpoint_timestamp.clone()))?;
        registry.register(Box::new(deadline_exceeded.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            passes_total,
            pass_duration,
            files_processed,
            records_dispatched,
            records_unordered,
            decode_failures,
            read_retries,
            checkpoint_write_failures,
            checkpoint_timestamp,
            deadline_exceeded,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
