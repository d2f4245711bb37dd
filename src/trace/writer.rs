use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::event::{Level, Timestamp};
use super::parse::{encode_file_header, encode_record_header, RecordHeader};

/// Appends records to a trace file in the on-disk format read by
/// [`super::reader::TraceReader`].
pub struct TraceWriter {
    inner: BufWriter<File>,
}

impl TraceWriter {
    /// Create (or truncate) a trace file and write its header.
    pub fn create(path: &Path, manifest_version: u16) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut inner = BufWriter::new(file);
        inner.write_all(&encode_file_header(manifest_version))?;
        Ok(Self { inner })
    }

    /// Open an existing trace file for appending further records.
    pub fn open_append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            inner: BufWriter::new(file),
        })
    }

    /// Append one record.
    pub fn append(
        &mut self,
        timestamp: Timestamp,
        task_id: u16,
        level: Level,
        payload: &[u8],
    ) -> io::Result<()> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
        let header = RecordHeader {
            timestamp,
            task_id,
            level,
            payload_len,
        };
        self.inner.write_all(&encode_record_header(&header))?;
        self.inner.write_all(payload)
    }

    /// Flush buffered records to the OS.
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
