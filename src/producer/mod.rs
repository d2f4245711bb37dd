pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::decode::Decoder;
use crate::health::HealthMetrics;
use crate::sink::SinkSet;

pub use runner::{
    PassRunner, PassSettings, PassSummary, Provider, ProviderOutcome, StopReason,
};

/// TraceProducer drives passes over all providers on a fixed interval.
///
/// Timer passes and [`TraceProducer::flush`] share one lock, so no two
/// passes ever run at the same time. The timer re-arms only once the
/// previous pass has returned.
pub struct TraceProducer {
    providers: Arc<Vec<Provider>>,
    runner: Arc<Mutex<PassRunner>>,
    sinks: SinkSet,
    interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TraceProducer {
    pub fn new(providers: Vec<Provider>, runner: PassRunner) -> Self {
        let sinks = runner.sinks().clone();
        let interval = runner.settings().read_interval;
        Self {
            providers: Arc::new(providers),
            runner: Arc::new(Mutex::new(runner)),
            sinks,
            interval,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Build a producer with file-backed checkpoints and the system clock.
    pub fn from_config(
        cfg: &Config,
        sinks: SinkSet,
        decoder: Option<Arc<dyn Decoder>>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        let providers = cfg
            .providers
            .iter()
            .map(|p| Provider::from_config(cfg, p))
            .collect::<Result<Vec<_>>>()
            .context("building providers")?;

        let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(
            &cfg.checkpoint_directory,
            cfg.checkpoint_retry.clone(),
        ));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut runner = PassRunner::new(
            PassSettings::from_config(cfg),
            store,
            sinks,
            decoder,
            clock,
        );
        if let Some(health) = health {
            runner = runner.with_health(health);
        }

        Ok(Self::new(providers, runner))
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    /// Start the pass timer. The first pass runs immediately.
    ///
    /// Without providers the producer logs the misconfiguration and stays
    /// idle.
    pub fn start(&mut self) {
        if self.providers.is_empty() {
            error!("no trace providers configured, producer will stay idle");
            return;
        }
        if self.task.is_some() {
            return;
        }

        let providers = Arc::clone(&self.providers);
        let runner = Arc::clone(&self.runner);
        let cancel = self.cancel.child_token();
        let interval = self.interval;

        info!(
            providers = providers.len(),
            interval = ?interval,
            "trace producer started",
        );

        self.task = Some(tokio::spawn(async move {
            loop {
                let pass_providers = Arc::clone(&providers);
                let pass_runner = Arc::clone(&runner);
                let pass_cancel = cancel.clone();
                let result = tokio::task::spawn_blocking(move || {
                    pass_runner.lock().run_pass(&pass_providers, &pass_cancel)
                })
                .await;

                if let Err(e) = result {
                    error!(error = %e, "pass task failed");
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    /// Stop the timer, cancelling a pass that is still running.
    ///
    /// Sinks are told to abort delivery when a pass was in flight.
    pub async fn stop(&mut self) {
        let in_pass = self.runner.try_lock().is_none();
        if in_pass {
            info!("stopping during a pass, aborting delivery");
            self.sinks.abort();
        }

        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "producer task failed");
            }
        }

        debug!("trace producer stopped");
    }

    /// Run one pass now, outside the timer. Blocks until any running pass
    /// has finished and this one is done.
    pub fn flush(&self) -> PassSummary {
        if self.providers.is_empty() {
            error!("no trace providers configured, nothing to flush");
            return PassSummary::default();
        }
        self.runner.lock().run_pass(&self.providers, &self.cancel)
    }

    /// Token that cancels passes of this producer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::sink::memory::MemorySink;
    use crate::sink::Sink;
    use crate::trace::event::{Level, Timestamp};
    use crate::trace::writer::TraceWriter;
    use crate::window::MarkerStore;

    fn producer(dir: &std::path::Path, sink: &Arc<MemorySink>, interval: Duration) -> TraceProducer {
        let traces = dir.join("traces");
        std::fs::create_dir_all(&traces).unwrap();
        let provider = Provider::new(
            "fabric",
            "*.trc",
            "fabric",
            &traces,
            MarkerStore::sibling_of(&traces),
        )
        .unwrap();

        let runner = PassRunner::new(
            PassSettings {
                read_interval: interval,
                retention: Duration::from_secs(3600),
                flush_lag: Duration::ZERO,
                dispatch_batch_size: 16,
                read_retry: RetryConfig {
                    max_attempts: 1,
                    initial_backoff: Duration::ZERO,
                    max_backoff: Duration::ZERO,
                },
            },
            Arc::new(MemoryCheckpointStore::new()),
            SinkSet::new(vec![Arc::clone(sink) as Arc<dyn Sink>]),
            None,
            Arc::new(ManualClock::at(Timestamp(u64::MAX / 2))),
        );
        TraceProducer::new(vec![provider], runner)
    }

    #[test]
    fn test_flush_runs_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::raw("mem", 64));
        let producer = producer(dir.path(), &sink, Duration::from_secs(60));

        let mut w = TraceWriter::create(&dir.path().join("traces/a.trc"), 1).unwrap();
        w.append(Timestamp(1), 1, Level::Error, b"").unwrap();
        w.append(Timestamp(2), 1, Level::Error, b"").unwrap();
        w.flush().unwrap();

        let summary = producer.flush();
        assert_eq!(summary.records_dispatched(), 2);
        assert_eq!(sink.passes_started(), 1);
        assert_eq!(sink.passes_ended(), 1);

        // Active file: timestamp 2 is held back, so it is delivered again.
        producer.flush();
        assert_eq!(sink.timestamps(), vec![1, 2, 2]);
    }

    #[test]
    fn test_empty_providers_is_noop() {
        let sink = Arc::new(MemorySink::raw("mem", 4));
        let runner = PassRunner::new(
            PassSettings {
                read_interval: Duration::from_secs(1),
                retention: Duration::from_secs(1),
                flush_lag: Duration::ZERO,
                dispatch_batch_size: 1,
                read_retry: RetryConfig {
                    max_attempts: 1,
                    initial_backoff: Duration::ZERO,
                    max_backoff: Duration::ZERO,
                },
            },
            Arc::new(MemoryCheckpointStore::new()),
            SinkSet::new(vec![Arc::clone(&sink) as Arc<dyn Sink>]),
            None,
            Arc::new(ManualClock::at(Timestamp(0))),
        );
        let producer = TraceProducer::new(Vec::new(), runner);
        assert!(producer.flush().providers.is_empty());
        assert_eq!(sink.passes_started(), 0);
    }

    #[tokio::test]
    async fn test_timer_runs_passes_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::raw("mem", 64));
        let mut producer = producer(dir.path(), &sink, Duration::from_millis(10));

        producer.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        producer.stop().await;

        let passes = sink.passes_started();
        assert!(passes >= 2, "expected several passes, got {passes}");
        assert_eq!(sink.passes_started(), sink.passes_ended());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.passes_started(), passes);
    }
}
