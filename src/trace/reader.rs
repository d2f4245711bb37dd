use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::event::{RawRecord, Timestamp};
use super::parse::{
    parse_file_header, parse_record_header, ParseError, FILE_HEADER_SIZE, RECORD_HEADER_SIZE,
};

/// Errors raised while reading a trace file.
#[derive(Error, Debug)]
pub enum ReadError {
    /// The file disappeared, usually deleted by retention cleanup.
    #[error("trace file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed trace data in {} at offset {offset}: {source}", path.display())]
    Parse {
        path: PathBuf,
        offset: u64,
        #[source]
        source: ParseError,
    },
}

impl ReadError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether the error means the file no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Sequential reader over one trace file.
pub struct TraceReader {
    path: PathBuf,
    inner: BufReader<File>,
    offset: u64,
    manifest_version: Option<u16>,
}

impl TraceReader {
    /// Open a trace file and read its header.
    ///
    /// A file shorter than its header is treated as empty: the writer has
    /// created it but not flushed anything yet.
    pub fn open(path: &Path) -> Result<Self, ReadError> {
        let file = File::open(path).map_err(|e| ReadError::from_io(path, e))?;
        let mut reader = Self {
            path: path.to_path_buf(),
            inner: BufReader::new(file),
            offset: 0,
            manifest_version: None,
        };

        let mut header = [0u8; FILE_HEADER_SIZE];
        let n = reader.fill(&mut header)?;
        if n == FILE_HEADER_SIZE {
            let parsed = parse_file_header(&header).map_err(|source| ReadError::Parse {
                path: path.to_path_buf(),
                offset: 0,
                source,
            })?;
            reader.manifest_version = Some(parsed.manifest_version);
        } else {
            debug!(file = %path.display(), bytes = n, "trace file header not yet written");
        }

        Ok(reader)
    }

    /// Path of the file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Manifest version recorded in the file header, if the header was complete.
    pub fn manifest_version(&self) -> Option<u16> {
        self.manifest_version
    }

    /// Stream records whose on-disk timestamp lies in `[start, end]`.
    ///
    /// Records are yielded in on-disk order, which is not strictly
    /// timestamp order, so out-of-window records are skipped rather than
    /// ending the stream.
    pub fn read_between(&mut self, start: Timestamp, end: Timestamp) -> Records<'_> {
        Records {
            reader: self,
            start,
            end,
            done: false,
        }
    }

    /// Release the underlying file handle.
    pub fn close(self) {}

    /// Read until `buf` is full or EOF; returns bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let mut filled = 0;
        while filled < buf.len() {
            let slot = buf.get_mut(filled..).unwrap_or_default();
            match self.inner.read(slot) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReadError::from_io(&self.path, e)),
            }
        }
        self.offset += filled as u64;
        Ok(filled)
    }

    fn next_record(&mut self) -> Result<Option<RawRecord>, ReadError> {
        if self.manifest_version.is_none() {
            return Ok(None);
        }

        let record_offset = self.offset;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let n = self.fill(&mut header)?;
        if n < RECORD_HEADER_SIZE {
            if n > 0 {
                debug!(
                    file = %self.path.display(),
                    offset = record_offset,
                    "partial record header at end of written data",
                );
            }
            return Ok(None);
        }

        let parsed = parse_record_header(&header).map_err(|source| ReadError::Parse {
            path: self.path.clone(),
            offset: record_offset,
            source,
        })?;

        let mut payload = vec![0u8; parsed.payload_len as usize];
        let n = self.fill(&mut payload)?;
        if n < payload.len() {
            debug!(
                file = %self.path.display(),
                offset = record_offset,
                "partial record payload at end of written data",
            );
            return Ok(None);
        }

        Ok(Some(RawRecord::new(
            parsed.timestamp,
            parsed.task_id,
            parsed.level,
            payload,
        )))
    }
}

/// Iterator returned by [`TraceReader::read_between`].
///
/// Fused: after an error or the end of written data it yields nothing more.
pub struct Records<'a> {
    reader: &'a mut TraceReader,
    start: Timestamp,
    end: Timestamp,
    done: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<RawRecord, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.reader.next_record() {
                Ok(Some(rec)) => {
                    if rec.timestamp < self.start || rec.timestamp > self.end {
                        continue;
                    }
                    return Some(Ok(rec));
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
