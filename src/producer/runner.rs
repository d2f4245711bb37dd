use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glob::Pattern;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::clock::Clock;
use crate::config::{Config, ProviderConfig, RetryConfig};
use crate::decode::Decoder;
use crate::health::HealthMetrics;
use crate::ingest::{Dispatcher, FileReadOutcome, ReadStatus};
use crate::sink::SinkSet;
use crate::trace::event::Timestamp;
use crate::window::{self, FileDescriptor, FileWindow, MarkerStore};

/// A group of trace files sharing a name pattern and one checkpoint.
#[derive(Debug, Clone)]
pub struct Provider {
    friendly_name: String,
    pattern: Pattern,
    checkpoint_key: String,
    directory: PathBuf,
    markers: MarkerStore,
}

impl Provider {
    pub fn new(
        friendly_name: impl Into<String>,
        name_pattern: &str,
        checkpoint_key: impl Into<String>,
        directory: impl Into<PathBuf>,
        markers: MarkerStore,
    ) -> Result<Self> {
        let pattern = Pattern::new(name_pattern)
            .with_context(|| format!("invalid name pattern {name_pattern}"))?;
        Ok(Self {
            friendly_name: friendly_name.into(),
            pattern,
            checkpoint_key: checkpoint_key.into(),
            directory: directory.into(),
            markers,
        })
    }

    /// Build a provider from its configuration entry.
    pub fn from_config(cfg: &Config, provider: &ProviderConfig) -> Result<Self> {
        let directory = cfg
            .provider_directory(provider)
            .with_context(|| format!("no trace directory for {}", provider.friendly_name()))?
            .to_path_buf();
        let markers = match &cfg.marker_directory {
            Some(dir) => MarkerStore::new(dir),
            None => MarkerStore::sibling_of(&directory),
        };
        Self::new(
            provider.friendly_name(),
            &provider.name_pattern,
            provider.checkpoint_key(),
            directory,
            markers,
        )
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn checkpoint_key(&self) -> &str {
        &self.checkpoint_key
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }
}

/// Settings a pass needs, fixed at construction.
#[derive(Debug, Clone)]
pub struct PassSettings {
    pub read_interval: Duration,
    pub retention: Duration,
    pub flush_lag: Duration,
    pub dispatch_batch_size: usize,
    pub read_retry: RetryConfig,
}

impl PassSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            read_interval: cfg.read_interval,
            retention: cfg.retention,
            flush_lag: cfg.flush_lag,
            dispatch_batch_size: cfg.dispatch_batch_size,
            read_retry: cfg.read_retry.clone(),
        }
    }
}

/// Why a provider stopped before reaching the end of its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
    ReadFailed,
    ResolveFailed,
}

/// What one provider did in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcome {
    pub provider: String,
    /// Checkpoint after the pass; `None` while nothing was ever read.
    pub checkpoint: Option<Timestamp>,
    pub files_read: usize,
    pub files_marked: usize,
    pub records_dispatched: u64,
    pub stopped: Option<StopReason>,
}

impl ProviderOutcome {
    fn new(provider: &Provider, checkpoint: Option<Timestamp>) -> Self {
        Self {
            provider: provider.friendly_name.clone(),
            checkpoint,
            files_read: 0,
            files_marked: 0,
            records_dispatched: 0,
            stopped: None,
        }
    }
}

/// Summary of one pass across all providers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub providers: Vec<ProviderOutcome>,
    pub cancelled: bool,
}

impl PassSummary {
    /// Outcome for the provider named `name`.
    pub fn provider(&self, name: &str) -> Option<&ProviderOutcome> {
        self.providers.iter().find(|p| p.provider == name)
    }

    pub fn records_dispatched(&self) -> u64 {
        self.providers.iter().map(|p| p.records_dispatched).sum()
    }
}

/// Runs passes and owns the state shared between them.
///
/// Callers serialize access (the producer keeps it behind a mutex), which
/// is what keeps checkpoint reads and writes per key race-free.
pub struct PassRunner {
    settings: PassSettings,
    store: Arc<dyn CheckpointStore>,
    sinks: SinkSet,
    decoder: Option<Arc<dyn Decoder>>,
    clock: Arc<dyn Clock>,
    health: Option<Arc<HealthMetrics>>,
    /// Checkpoints whose last write failed, ahead of the store until a
    /// write for the same key succeeds.
    unpersisted: HashMap<String, Timestamp>,
}

impl PassRunner {
    pub fn new(
        settings: PassSettings,
        store: Arc<dyn CheckpointStore>,
        sinks: SinkSet,
        decoder: Option<Arc<dyn Decoder>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            sinks,
            decoder,
            clock,
            health: None,
            unpersisted: HashMap::new(),
        }
    }

    /// Record pass metrics into `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn settings(&self) -> &PassSettings {
        &self.settings
    }

    pub fn sinks(&self) -> &SinkSet {
        &self.sinks
    }

    /// Checkpoint for `key` that is held in memory because persisting it
    /// failed.
    pub fn unpersisted_checkpoint(&self, key: &str) -> Option<Timestamp> {
        self.unpersisted.get(key).copied()
    }

    /// Run one pass over `providers`, sharing the read interval between them.
    pub fn run_pass(&mut self, providers: &[Provider], cancel: &CancellationToken) -> PassSummary {
        let started = Instant::now();
        let mut summary = PassSummary::default();

        let share = if providers.is_empty() {
            self.settings.read_interval
        } else {
            self.settings.read_interval / u32::try_from(providers.len()).unwrap_or(u32::MAX)
        };

        self.sinks.pass_start();

        for provider in providers {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let deadline = Instant::now() + share;
            let outcome = self.run_provider(provider, deadline, cancel);
            if outcome.stopped == Some(StopReason::Cancelled) {
                summary.cancelled = true;
            }
            summary.providers.push(outcome);
        }

        self.sinks.pass_end();

        let elapsed = started.elapsed();
        if let Some(health) = &self.health {
            health.passes_total.inc();
            health.pass_duration.observe(elapsed.as_secs_f64());
        }

        info!(
            providers = summary.providers.len(),
            records = summary.records_dispatched(),
            cancelled = summary.cancelled,
            elapsed = ?elapsed,
            "pass finished",
        );

        summary
    }

    /// Process one provider's window: inactive files in creation order, then
    /// the active file. `deadline` is checked between files only.
    pub fn run_provider(
        &mut self,
        provider: &Provider,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ProviderOutcome {
        let checkpoint = self.load_checkpoint(provider);
        let mut outcome = ProviderOutcome::new(provider, checkpoint);

        let files = match window::resolve(&provider.directory, &provider.pattern) {
            Ok(files) => files,
            Err(e) => {
                error!(provider = %provider.friendly_name, error = %e, "resolving trace files");
                outcome.stopped = Some(StopReason::ResolveFailed);
                return outcome;
            }
        };

        let cutoff = self
            .clock
            .now()
            .checked_sub(self.settings.retention)
            .unwrap_or(std::time::UNIX_EPOCH);
        let window = FileWindow::classify(files, &provider.markers, cutoff);

        debug!(
            provider = %provider.friendly_name,
            inactive = window.inactive.len(),
            has_active = window.active.is_some(),
            checkpoint = ?checkpoint,
            "resolved file window",
        );

        for file in &window.inactive {
            if let Some(reason) = self.should_stop(provider, &outcome, deadline, cancel) {
                outcome.stopped = Some(reason);
                return outcome;
            }

            let start = outcome.checkpoint.map_or(Timestamp::MIN, Timestamp::next_tick);
            let read = self.read(file, false, start, Timestamp::MAX, cancel);
            self.apply(provider, file, &read, &mut outcome);

            match read.status {
                ReadStatus::Completed => {
                    match provider.markers.mark(&file.name) {
                        Ok(()) => outcome.files_marked += 1,
                        Err(e) => warn!(
                            provider = %provider.friendly_name,
                            file = %file.name,
                            error = %e,
                            "creating marker, file will be read again",
                        ),
                    }
                }
                ReadStatus::Vanished => {}
                ReadStatus::Cancelled => {
                    outcome.stopped = Some(StopReason::Cancelled);
                    return outcome;
                }
                ReadStatus::Failed => {
                    // Later files would move the checkpoint past what this
                    // file still holds.
                    outcome.stopped = Some(StopReason::ReadFailed);
                    return outcome;
                }
            }
        }

        let Some(active) = &window.active else {
            return outcome;
        };

        if let Some(reason) = self.should_stop(provider, &outcome, deadline, cancel) {
            outcome.stopped = Some(reason);
            return outcome;
        }

        let start = outcome.checkpoint.map_or(Timestamp::MIN, Timestamp::next_tick);
        let end = self
            .clock
            .now_timestamp()
            .saturating_sub(self.settings.flush_lag);
        if start > end {
            debug!(
                provider = %provider.friendly_name,
                file = %active.name,
                start = %start,
                end = %end,
                "nothing new in active file",
            );
            return outcome;
        }

        let read = self.read(active, true, start, end, cancel);
        self.apply(provider, active, &read, &mut outcome);
        match read.status {
            ReadStatus::Cancelled => outcome.stopped = Some(StopReason::Cancelled),
            ReadStatus::Failed => outcome.stopped = Some(StopReason::ReadFailed),
            ReadStatus::Completed | ReadStatus::Vanished => {}
        }

        outcome
    }

    fn should_stop(
        &self,
        provider: &Provider,
        outcome: &ProviderOutcome,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Option<StopReason> {
        if cancel.is_cancelled() {
            info!(provider = %provider.friendly_name, "pass cancelled, deferring remaining files");
            return Some(StopReason::Cancelled);
        }

        // Every provider gets to read at least one file per pass.
        if outcome.files_read > 0 && Instant::now() >= deadline {
            warn!(
                provider = %provider.friendly_name,
                files_read = outcome.files_read,
                "time share exhausted, deferring remaining files",
            );
            if let Some(health) = &self.health {
                health
                    .deadline_exceeded
                    .with_label_values(&[provider.friendly_name.as_str()])
                    .inc();
            }
            return Some(StopReason::DeadlineExceeded);
        }

        None
    }

    fn read(
        &self,
        file: &FileDescriptor,
        is_active: bool,
        start: Timestamp,
        end: Timestamp,
        cancel: &CancellationToken,
    ) -> FileReadOutcome {
        let dispatcher = Dispatcher::new(
            &self.sinks,
            self.decoder.as_deref(),
            &self.settings.read_retry,
            self.settings.dispatch_batch_size,
            cancel,
        );
        dispatcher.read_file(file, is_active, start, end)
    }

    /// Fold a file read into the provider's outcome and checkpoint.
    fn apply(
        &mut self,
        provider: &Provider,
        file: &FileDescriptor,
        read: &FileReadOutcome,
        outcome: &mut ProviderOutcome,
    ) {
        outcome.files_read += 1;
        outcome.records_dispatched += read.records_read;

        if let Some(health) = &self.health {
            let name = provider.friendly_name.as_str();
            let kind = if read.is_active { "active" } else { "inactive" };
            health.files_processed.with_label_values(&[name, kind]).inc();
            health
                .records_dispatched
                .with_label_values(&[name])
                .inc_by(read.records_read as f64);
            health
                .records_unordered
                .with_label_values(&[name])
                .inc_by(read.unordered() as f64);
            health
                .decode_failures
                .with_label_values(&[name])
                .inc_by(read.decode_failures as f64);
            health
                .read_retries
                .with_label_values(&[name])
                .inc_by(f64::from(read.retries));
        }

        if let Some(end) = read.safe_end() {
            outcome.checkpoint = Some(self.advance_checkpoint(provider, outcome.checkpoint, end));
        }

        info!(
            provider = %provider.friendly_name,
            file = %file.name,
            is_active = read.is_active,
            status = %read.status,
            records = read.records_read,
            unordered = read.unordered(),
            checkpoint = ?outcome.checkpoint,
            "trace file processed",
        );
    }

    /// Starting point for `provider`: the persisted checkpoint, or a newer
    /// one whose write failed. A reset of the store is honoured once every
    /// write for the key has succeeded.
    fn load_checkpoint(&self, provider: &Provider) -> Option<Timestamp> {
        let persisted = match self.store.last_end_time(&provider.checkpoint_key) {
            Ok(ts) => ts,
            Err(e) => {
                warn!(
                    provider = %provider.friendly_name,
                    error = %e,
                    "unreadable checkpoint, reading from the beginning",
                );
                None
            }
        };
        let unpersisted = self.unpersisted.get(&provider.checkpoint_key).copied();
        persisted.max(unpersisted)
    }

    /// Move the checkpoint from `current` forward to `end`, never backwards.
    /// Returns the resulting value.
    fn advance_checkpoint(
        &mut self,
        provider: &Provider,
        current: Option<Timestamp>,
        end: Timestamp,
    ) -> Timestamp {
        let key = provider.checkpoint_key.as_str();
        if let Some(current) = current.filter(|c| *c >= end) {
            return current;
        }

        if let Some(health) = &self.health {
            health
                .checkpoint_timestamp
                .with_label_values(&[provider.friendly_name.as_str()])
                .set(end.as_nanos() as f64 / 1e9);
        }

        match self.store.set_last_end_time(key, end) {
            Ok(()) => {
                self.unpersisted.remove(key);
            }
            Err(e) => {
                self.unpersisted.insert(key.to_string(), end);
                error!(
                    provider = %provider.friendly_name,
                    checkpoint = %end,
                    error = %e,
                    "persisting checkpoint, keeping it in memory",
                );
                if let Some(health) = &self.health {
                    health
                        .checkpoint_write_failures
                        .with_label_values(&[provider.friendly_name.as_str()])
                        .inc();
                }
            }
        }

        end
    }
}
