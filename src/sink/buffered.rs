use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{RecordBatch, Sink};
use crate::trace::event::{DecodedEvent, Timestamp};
use crate::window::FileDescriptor;

/// First line of every cache file.
pub const CACHE_FORMAT_VERSION: &str = "Version: 2";

const CACHE_PREFIX: &str = "Cache_";
const TEMP_EXTENSION: &str = "tmp";
const READY_EXTENSION: &str = "dat";

/// Per-pass writer state.
#[derive(Default)]
struct PassState {
    writer: Option<BufWriter<File>>,
    /// `<trace file>:<window start>` of the file being read.
    bookmark: String,
    /// Position of the next event within the current file read.
    sequence: u64,
}

/// Writes decoded events of each pass into a cache file that an uploader
/// picks up once the pass ends.
///
/// During a pass events go to `Cache_<nanos>_<n>.tmp`. At pass end every
/// `Cache_*.tmp` in the directory, including leftovers from passes that were
/// interrupted, is renamed to `.dat` for delivery, and `.dat` files older
/// than the retention are deleted.
///
/// Each line is `id \t timestamp \t level \t task \t k=v,k=v`. The id is
/// `<trace file>:<window start>:<sequence>`, so a record delivered again by
/// a later pass with the same window start carries the same id.
pub struct BufferedFileSink {
    name: String,
    dir: PathBuf,
    retention: Option<Duration>,
    state: Mutex<PassState>,
    file_sequence: AtomicU64,
}

impl BufferedFileSink {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            retention: None,
            state: Mutex::new(PassState::default()),
            file_sequence: AtomicU64::new(0),
        }
    }

    /// Delete delivered cache files last written longer ago than `retention`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open_cache_file(&self) -> std::io::Result<(PathBuf, BufWriter<File>)> {
        fs::create_dir_all(&self.dir)?;
        let nanos = Timestamp::from_system_time(SystemTime::now()).as_nanos();
        let seq = self.file_sequence.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{CACHE_PREFIX}{nanos}_{seq}.{TEMP_EXTENSION}"));
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{CACHE_FORMAT_VERSION}")?;
        Ok((path, writer))
    }

    /// Cache files in the directory with the given extension.
    fn cache_files(&self, extension: &str) -> Vec<PathBuf> {
        let pattern = match Pattern::new(&format!("{CACHE_PREFIX}*.{extension}")) {
            Ok(p) => p,
            Err(e) => {
                error!(sink = %self.name, error = %e, "invalid cache file pattern");
                return Vec::new();
            }
        };

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(sink = %self.name, dir = %self.dir.display(), error = %e, "listing cache directory");
                return Vec::new();
            }
        };

        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| pattern.matches(name))
            })
            .map(|entry| entry.path())
            .collect()
    }

    /// Rename every finished temp cache file for delivery.
    fn publish_cache_files(&self) {
        for from in self.cache_files(TEMP_EXTENSION) {
            let to = from.with_extension(READY_EXTENSION);
            match fs::rename(&from, &to) {
                Ok(()) => info!(
                    sink = %self.name,
                    from = %from.display(),
                    to = %to.display(),
                    "cache file ready for delivery",
                ),
                Err(e) => error!(
                    sink = %self.name,
                    file = %from.display(),
                    error = %e,
                    "renaming cache file for delivery",
                ),
            }
        }
    }

    /// Remove delivered cache files older than the retention.
    fn delete_expired_cache_files(&self) {
        let Some(retention) = self.retention else {
            return;
        };
        let Some(cutoff) = SystemTime::now().checked_sub(retention) else {
            return;
        };

        let mut deleted = 0usize;
        for path in self.cache_files(READY_EXTENSION) {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    sink = %self.name,
                    file = %path.display(),
                    error = %e,
                    "deleting expired cache file",
                ),
            }
        }

        if deleted > 0 {
            info!(sink = %self.name, deleted, retention = ?retention, "deleted expired cache files");
        }
    }

    fn format_event(id: &str, event: &DecodedEvent) -> String {
        let fields = event
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}\t{}\t{}\t{}\t{}",
            escape(id),
            event.timestamp.as_nanos(),
            event.level,
            escape(&event.task_name),
            fields
        )
    }
}

/// Keep one event per line and make `k=v,k=v` splittable.
fn escape(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ',' => out.push_str("\\,"),
            '=' => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

impl Sink for BufferedFileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn needs_decoded(&self) -> bool {
        true
    }

    fn on_pass_start(&self) {
        let mut state = self.state.lock();
        match self.open_cache_file() {
            Ok((path, writer)) => {
                debug!(sink = %self.name, file = %path.display(), "buffering events for this pass");
                state.writer = Some(writer);
            }
            Err(e) => {
                // Nothing from this pass reaches the buffer.
                error!(sink = %self.name, dir = %self.dir.display(), error = %e, "creating cache file");
                state.writer = None;
            }
        }
    }

    fn on_file_read_start(&self, file: &FileDescriptor, _is_active: bool, start: Timestamp) {
        let mut state = self.state.lock();
        state.bookmark = format!("{}:{}", file.name, start.as_nanos());
        state.sequence = 0;
    }

    fn on_file_read_stop(&self, file: &FileDescriptor, _is_active: bool, _aborted: bool) {
        if let Some(writer) = self.state.lock().writer.as_mut() {
            if let Err(e) = writer.flush() {
                error!(sink = %self.name, trace_file = %file.name, error = %e, "flushing cache file");
            }
        }
    }

    fn on_records(&self, batch: RecordBatch<'_>) {
        let RecordBatch::Decoded(events) = batch else {
            return;
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(writer) = state.writer.as_mut() else {
            return;
        };

        for event in events {
            let id = format!("{}:{}", state.bookmark, state.sequence);
            state.sequence += 1;
            if let Err(e) = writeln!(writer, "{}", Self::format_event(&id, event)) {
                error!(sink = %self.name, error = %e, "writing to cache file");
                // Drop the writer so the rest of the pass is not half-written.
                state.writer = None;
                return;
            }
        }
    }

    fn on_pass_end(&self) {
        let writer = self.state.lock().writer.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush() {
                error!(sink = %self.name, error = %e, "closing cache file");
            }
        }
        self.publish_cache_files();
        self.delete_expired_cache_files();
    }

    fn on_abort(&self) {
        debug!(sink = %self.name, "delivery aborted");
    }
}
