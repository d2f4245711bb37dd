//! Reading one trace file and fanning its records out to sinks.
//!
//! [`OrderingState`] keeps dispatched timestamps non-decreasing within a file
//! read and tracks the newest timestamp that can no longer receive records.
//! [`Dispatcher`] drives a [`TraceReader`] through it, decodes at most once
//! per record and delivers batches to the [`SinkSet`].

use std::cell::Cell;
use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::decode::Decoder;
use crate::retry::with_retries;
use crate::sink::SinkSet;
use crate::trace::event::{DecodedEvent, RawRecord, Timestamp};
use crate::trace::reader::{ReadError, TraceReader};
use crate::window::FileDescriptor;

/// Per-read timestamp bookkeeping.
///
/// Out-of-order records are clamped forward to the current timestamp rather
/// than reordered. The on-disk value stays in `RawRecord::original_timestamp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderingState {
    current: Option<Timestamp>,
    last_completed: Option<Timestamp>,
    unordered: u64,
}

impl OrderingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for `record`, clamping its timestamp if it went backwards.
    /// Returns true when the record was clamped.
    pub fn observe(&mut self, record: &mut RawRecord) -> bool {
        let t = record.timestamp;
        let Some(current) = self.current else {
            self.current = Some(t);
            return false;
        };

        if t > current {
            self.last_completed = Some(self.last_completed.map_or(current, |c| c.max(current)));
            self.current = Some(t);
            false
        } else if t < current {
            record.timestamp = current;
            self.unordered += 1;
            true
        } else {
            false
        }
    }

    /// Timestamp of the group currently being read.
    pub fn current(&self) -> Option<Timestamp> {
        self.current
    }

    /// Newest timestamp that is known to have no more records in this read.
    pub fn last_completed(&self) -> Option<Timestamp> {
        self.last_completed
    }

    /// Records clamped so far.
    pub fn unordered(&self) -> u64 {
        self.unordered
    }
}

/// How a file read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// All written data in the window was read.
    Completed,
    /// The cancellation token fired mid-read.
    Cancelled,
    /// The file no longer exists.
    Vanished,
    /// Open or read failed, possibly after records were dispatched.
    Failed,
}

impl ReadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Vanished => "vanished",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of reading one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadOutcome {
    pub status: ReadStatus,
    pub is_active: bool,
    pub ordering: OrderingState,
    pub records_read: u64,
    pub decode_failures: u64,
    pub retries: u32,
}

impl FileReadOutcome {
    fn new(is_active: bool) -> Self {
        Self {
            status: ReadStatus::Completed,
            is_active,
            ordering: OrderingState::new(),
            records_read: 0,
            decode_failures: 0,
            retries: 0,
        }
    }

    /// Whether the file was read to the end of its window.
    pub fn completed(&self) -> bool {
        self.status == ReadStatus::Completed
    }

    /// Timestamp the checkpoint may advance to, if any.
    ///
    /// A fully read inactive file is immutable, so its newest timestamp is
    /// safe. Everywhere else more records at the current timestamp may still
    /// exist, so only the last completed timestamp is safe.
    pub fn safe_end(&self) -> Option<Timestamp> {
        if self.completed() && !self.is_active {
            self.ordering.current()
        } else {
            self.ordering.last_completed()
        }
    }

    pub fn unordered(&self) -> u64 {
        self.ordering.unordered()
    }
}

/// Reads trace files and delivers their records to a sink set.
pub struct Dispatcher<'a> {
    sinks: &'a SinkSet,
    decoder: Option<&'a dyn Decoder>,
    read_retry: &'a RetryConfig,
    batch_size: usize,
    cancel: &'a CancellationToken,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        sinks: &'a SinkSet,
        decoder: Option<&'a dyn Decoder>,
        read_retry: &'a RetryConfig,
        batch_size: usize,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            sinks,
            decoder,
            read_retry,
            batch_size: batch_size.max(1),
            cancel,
        }
    }

    /// Read records of `file` with on-disk timestamps in `[start, end]` and
    /// dispatch them.
    ///
    /// Until the first record is read, failures are retried. After that a
    /// failure abandons the rest of the file for this pass.
    pub fn read_file(
        &self,
        file: &FileDescriptor,
        is_active: bool,
        start: Timestamp,
        end: Timestamp,
    ) -> FileReadOutcome {
        let mut outcome = FileReadOutcome::new(is_active);

        debug!(
            file = %file.name,
            is_active,
            start = %start,
            end = %end,
            "reading trace file",
        );
        self.sinks.file_read_start(file, is_active, start);

        let attempts = Cell::new(0u32);
        let opened = with_retries(
            self.read_retry,
            "trace file read",
            || {
                attempts.set(attempts.get() + 1);
                let mut reader = TraceReader::open(&file.path)?;
                let first = reader.read_between(start, end).next().transpose()?;
                Ok::<_, ReadError>((reader, first))
            },
            |e| !e.is_not_found(),
        );
        outcome.retries = attempts.get().saturating_sub(1);

        match opened {
            Ok((mut reader, first)) => {
                if let Some(first) = first {
                    let mut batch = Batch::new(self, reader.manifest_version());
                    self.process(&mut batch, &mut outcome, first);

                    let mut records = reader.read_between(start, end);
                    loop {
                        if self.cancel.is_cancelled() {
                            outcome.status = ReadStatus::Cancelled;
                            break;
                        }
                        match records.next() {
                            Some(Ok(record)) => self.process(&mut batch, &mut outcome, record),
                            Some(Err(e)) => {
                                outcome.status = self.abort_status(file, &e, outcome.records_read);
                                break;
                            }
                            None => break,
                        }
                    }

                    // Records already ordered count toward the safe end, so
                    // they must reach sinks even when the read stops early.
                    batch.flush(self.sinks);
                }
                reader.close();
            }
            Err(e) => {
                outcome.status = self.abort_status(file, &e, 0);
            }
        }

        if outcome.decode_failures > 0 {
            warn!(
                file = %file.name,
                failures = outcome.decode_failures,
                manifest_loaded = self.decoder.is_some(),
                "records skipped for decoded sinks",
            );
        }
        if outcome.unordered() > 0 {
            debug!(
                file = %file.name,
                unordered = outcome.unordered(),
                "clamped out-of-order timestamps",
            );
        }

        self.sinks
            .file_read_stop(file, is_active, !outcome.completed());
        outcome
    }

    fn abort_status(&self, file: &FileDescriptor, e: &ReadError, records_read: u64) -> ReadStatus {
        if e.is_not_found() {
            info!(file = %file.name, records_read, "trace file vanished, skipping");
            ReadStatus::Vanished
        } else {
            warn!(file = %file.name, records_read, error = %e, "abandoning trace file for this pass");
            ReadStatus::Failed
        }
    }

    fn process(&self, batch: &mut Batch, outcome: &mut FileReadOutcome, mut record: RawRecord) {
        outcome.ordering.observe(&mut record);
        outcome.records_read += 1;

        if batch.wants_decoded {
            match self.decoder {
                Some(decoder) => match decoder.decode(batch.manifest_version, &record) {
                    Ok(event) => batch.decoded.push(event),
                    Err(e) => {
                        debug!(
                            timestamp = %record.original_timestamp,
                            task_id = record.task_id,
                            error = %e,
                            "decode failed",
                        );
                        outcome.decode_failures += 1;
                    }
                },
                None => outcome.decode_failures += 1,
            }
        }
        if batch.wants_raw {
            batch.raw.push(record);
        }

        batch.pending += 1;
        if batch.pending >= self.batch_size {
            batch.flush(self.sinks);
        }
    }
}

/// Records waiting to be delivered, in both representations.
struct Batch {
    manifest_version: Option<u16>,
    wants_raw: bool,
    wants_decoded: bool,
    raw: Vec<RawRecord>,
    decoded: Vec<DecodedEvent>,
    pending: usize,
}

impl Batch {
    fn new(dispatcher: &Dispatcher<'_>, manifest_version: Option<u16>) -> Self {
        let wants_raw = dispatcher.sinks.any_needs_raw();
        let wants_decoded = dispatcher.sinks.any_needs_decoded();
        Self {
            manifest_version,
            wants_raw,
            wants_decoded,
            raw: Vec::with_capacity(if wants_raw { dispatcher.batch_size } else { 0 }),
            decoded: Vec::with_capacity(if wants_decoded { dispatcher.batch_size } else { 0 }),
            pending: 0,
        }
    }

    fn flush(&mut self, sinks: &SinkSet) {
        if self.pending == 0 {
            return;
        }
        sinks.deliver(&self.raw, &self.decoded);
        self.raw.clear();
        self.decoded.clear();
        self.pending = 0;
    }
}
