pub mod buffered;
pub mod memory;

use std::sync::Arc;

use crate::trace::event::{DecodedEvent, RawRecord, Timestamp};
use crate::window::FileDescriptor;

/// A batch of records handed to a sink, in the representation it asked for.
#[derive(Debug, Clone, Copy)]
pub enum RecordBatch<'a> {
    Raw(&'a [RawRecord]),
    Decoded(&'a [DecodedEvent]),
}

impl RecordBatch<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Raw(r) => r.len(),
            Self::Decoded(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sink receives records read from trace files.
///
/// Delivery is at-least-once: records near a pass boundary may be delivered
/// again in the next pass, so implementations must be idempotent.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Whether the sink wants decoded events instead of raw records.
    fn needs_decoded(&self) -> bool;

    /// Called before any provider is processed in a pass.
    fn on_pass_start(&self) {}

    /// Called after provider iteration, including when a pass was cut short.
    fn on_pass_end(&self) {}

    /// Called before a file is read. `start` is the first timestamp of the
    /// read window; it stays the same across passes until the checkpoint
    /// moves, so `(file, start, position)` identifies a record for dedupe.
    fn on_file_read_start(&self, _file: &FileDescriptor, _is_active: bool, _start: Timestamp) {}

    /// Called after a file read ends. `aborted` is set when the read stopped
    /// early because of cancellation or an error.
    fn on_file_read_stop(&self, _file: &FileDescriptor, _is_active: bool, _aborted: bool) {}

    /// Deliver a batch of records in read order.
    fn on_records(&self, batch: RecordBatch<'_>);

    /// Called when the producer is stopping while a pass may still be running.
    fn on_abort(&self) {}
}

/// The registered sinks of one producer.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Sink>> {
        self.sinks.iter()
    }

    /// Whether at least one sink wants decoded events.
    pub fn any_needs_decoded(&self) -> bool {
        self.sinks.iter().any(|s| s.needs_decoded())
    }

    /// Whether at least one sink wants raw records.
    pub fn any_needs_raw(&self) -> bool {
        self.sinks.iter().any(|s| !s.needs_decoded())
    }

    pub fn pass_start(&self) {
        for sink in &self.sinks {
            sink.on_pass_start();
        }
    }

    pub fn pass_end(&self) {
        for sink in &self.sinks {
            sink.on_pass_end();
        }
    }

    pub fn file_read_start(&self, file: &FileDescriptor, is_active: bool, start: Timestamp) {
        for sink in &self.sinks {
            sink.on_file_read_start(file, is_active, start);
        }
    }

    pub fn file_read_stop(&self, file: &FileDescriptor, is_active: bool, aborted: bool) {
        for sink in &self.sinks {
            sink.on_file_read_stop(file, is_active, aborted);
        }
    }

    pub fn abort(&self) {
        for sink in &self.sinks {
            sink.on_abort();
        }
    }

    /// Hand each sink the representation it asked for.
    pub fn deliver(&self, raw: &[RawRecord], decoded: &[DecodedEvent]) {
        for sink in &self.sinks {
            let batch = if sink.needs_decoded() {
                RecordBatch::Decoded(decoded)
            } else {
                RecordBatch::Raw(raw)
            };
            if !batch.is_empty() {
                sink.on_records(batch);
            }
        }
    }
}
