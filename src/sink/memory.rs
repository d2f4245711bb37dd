use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{RecordBatch, Sink};
use crate::trace::event::{DecodedEvent, RawRecord, Timestamp};
use crate::window::FileDescriptor;

/// File-read notices kept for inspection; older ones are discarded.
pub const MAX_FILE_NOTICES: usize = 1024;

/// A record held by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Raw(RawRecord),
    Decoded(DecodedEvent),
}

impl Delivered {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Raw(r) => r.timestamp,
            Self::Decoded(d) => d.timestamp,
        }
    }
}

/// One `on_file_read_stop` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadNotice {
    pub file: String,
    pub is_active: bool,
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct State {
    records: VecDeque<Delivered>,
    dropped: u64,
    passes_started: u64,
    passes_ended: u64,
    aborts: u64,
    file_reads: VecDeque<FileReadNotice>,
}

/// Bounded in-memory buffer of delivered records, drained by an uploader.
///
/// When full, the oldest records are dropped and counted.
pub struct MemorySink {
    name: String,
    decoded: bool,
    capacity: usize,
    state: Mutex<State>,
}

impl MemorySink {
    /// A sink that keeps raw records.
    pub fn raw(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, capacity, false)
    }

    /// A sink that keeps decoded events.
    pub fn decoded(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, capacity, true)
    }

    fn new(name: impl Into<String>, capacity: usize, decoded: bool) -> Self {
        Self {
            name: name.into(),
            decoded,
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
        }
    }

    /// Remove and return everything buffered so far.
    pub fn drain(&self) -> Vec<Delivered> {
        self.state.lock().records.drain(..).collect()
    }

    /// Copy of the buffered records.
    pub fn snapshot(&self) -> Vec<Delivered> {
        self.state.lock().records.iter().cloned().collect()
    }

    /// Timestamps of the buffered records, in delivery order.
    pub fn timestamps(&self) -> Vec<u64> {
        self.state
            .lock()
            .records
            .iter()
            .map(|r| r.timestamp().as_nanos())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn passes_started(&self) -> u64 {
        self.state.lock().passes_started
    }

    pub fn passes_ended(&self) -> u64 {
        self.state.lock().passes_ended
    }

    pub fn aborts(&self) -> u64 {
        self.state.lock().aborts
    }

    /// The most recent file read completions, oldest first.
    pub fn file_reads(&self) -> Vec<FileReadNotice> {
        self.state.lock().file_reads.iter().cloned().collect()
    }

    fn push(state: &mut State, capacity: usize, item: Delivered) {
        if state.records.len() >= capacity {
            state.records.pop_front();
            state.dropped += 1;
        }
        state.records.push_back(item);
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_decoded(&self) -> bool {
        self.decoded
    }

    fn on_pass_start(&self) {
        self.state.lock().passes_started += 1;
    }

    fn on_pass_end(&self) {
        self.state.lock().passes_ended += 1;
    }

    fn on_file_read_stop(&self, file: &FileDescriptor, is_active: bool, aborted: bool) {
        let mut state = self.state.lock();
        if state.file_reads.len() >= MAX_FILE_NOTICES {
            state.file_reads.pop_front();
        }
        state.file_reads.push_back(FileReadNotice {
            file: file.name.clone(),
            is_active,
            aborted,
        });
    }

    fn on_records(&self, batch: RecordBatch<'_>) {
        let mut state = self.state.lock();
        match batch {
            RecordBatch::Raw(records) => {
                for r in records {
                    Self::push(&mut state, self.capacity, Delivered::Raw(r.clone()));
                }
            }
            RecordBatch::Decoded(events) => {
                for e in events {
                    Self::push(&mut state, self.capacity, Delivered::Decoded(e.clone()));
                }
            }
        }
    }

    fn on_abort(&self) {
        self.state.lock().aborts += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::event::Level;

    fn raw(ts: u64) -> RawRecord {
        RawRecord::new(Timestamp(ts), 1, Level::Informational, Vec::new())
    }

    #[test]
    fn test_buffers_in_order() {
        let sink = MemorySink::raw("mem", 10);
        sink.on_records(RecordBatch::Raw(&[raw(1), raw(2)]));
        sink.on_records(RecordBatch::Raw(&[raw(3)]));
        assert_eq!(sink.timestamps(), vec![1, 2, 3]);
    }

    #[test]
    fn test_drops_oldest_when_full() {
        let sink = MemorySink::raw("mem", 2);
        sink.on_records(RecordBatch::Raw(&[raw(1), raw(2), raw(3)]));
        assert_eq!(sink.timestamps(), vec![2, 3]);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_drain_empties_buffer() {
        let sink = MemorySink::decoded("mem", 4);
        assert!(sink.needs_decoded());
        sink.on_records(RecordBatch::Decoded(&[DecodedEvent {
            timestamp: Timestamp(9),
            task_name: "Store".to_string(),
            level: Level::Error,
            fields: Vec::new(),
        }]));
        let drained = sink.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].timestamp(), Timestamp(9));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_file_read_notices_are_bounded() {
        let sink = MemorySink::raw("mem", 1);
        let file = |i: usize| FileDescriptor {
            name: format!("fabric_{i}.trc"),
            path: std::path::PathBuf::from(format!("/traces/fabric_{i}.trc")),
            created: std::time::SystemTime::UNIX_EPOCH,
            last_write: std::time::SystemTime::UNIX_EPOCH,
        };

        for i in 0..MAX_FILE_NOTICES + 10 {
            sink.on_file_read_stop(&file(i), false, false);
        }

        let reads = sink.file_reads();
        assert_eq!(reads.len(), MAX_FILE_NOTICES);
        assert_eq!(reads[0].file, "fabric_10.trc");
        assert_eq!(
            reads[MAX_FILE_NOTICES - 1].file,
            format!("fabric_{}.trc", MAX_FILE_NOTICES + 9)
        );
    }

    #[test]
    fn test_counts_pass_notifications() {
        let sink = MemorySink::raw("mem", 1);
        sink.on_pass_start();
        sink.on_pass_end();
        sink.on_abort();
        assert_eq!(sink.passes_started(), 1);
        assert_eq!(sink.passes_ended(), 1);
        assert_eq!(sink.aborts(), 1);
    }
}
