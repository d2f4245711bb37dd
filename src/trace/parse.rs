//! Framing for trace files.
//!
//! A trace file is an 8-byte file header followed by records. Each record is
//! a fixed 16-byte header and a variable-length payload. Payload contents are
//! opaque here; see [`crate::decode`] for the manifest-driven codec.

use thiserror::Error;

use super::event::{Level, Timestamp};

/// File header size in bytes.
pub const FILE_HEADER_SIZE: usize = 8;

/// Record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Magic bytes at the start of every trace file.
pub const FILE_MAGIC: [u8; 4] = *b"TRCF";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Upper bound on a single record payload. Anything larger is corruption.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Errors that can occur while parsing trace file framing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("header too short: {size} bytes")]
    Truncated { size: usize },

    #[error("bad file magic {found:?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported format version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("unknown level byte {raw}")]
    UnknownLevel { raw: u8 },

    #[error("payload length {len} exceeds limit")]
    PayloadTooLarge { len: u32 },
}

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u16,
    pub manifest_version: u16,
}

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp: Timestamp,
    pub task_id: u16,
    pub level: Level,
    pub payload_len: u32,
}

/// Parse the 8-byte file header.
pub fn parse_file_header(data: &[u8]) -> Result<FileHeader, ParseError> {
    if data.len() < FILE_HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let magic = read_fixed::<4>(data, 0);
    if magic != FILE_MAGIC {
        return Err(ParseError::BadMagic { found: magic });
    }

    let format_version = read_u16_le(data, 4);
    if format_version == 0 || format_version > FORMAT_VERSION {
        return Err(ParseError::UnsupportedVersion {
            version: format_version,
        });
    }

    Ok(FileHeader {
        format_version,
        manifest_version: read_u16_le(data, 6),
    })
}

/// Parse a 16-byte record header.
pub fn parse_record_header(data: &[u8]) -> Result<RecordHeader, ParseError> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let level_raw = read_u8(data, 10);
    let level = Level::from_u8(level_raw).ok_or(ParseError::UnknownLevel { raw: level_raw })?;

    let payload_len = read_u32_le(data, 12);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ParseError::PayloadTooLarge { len: payload_len });
    }

    Ok(RecordHeader {
        timestamp: Timestamp(read_u64_le(data, 0)),
        task_id: read_u16_le(data, 8),
        level,
        // byte 11 reserved
        payload_len,
    })
}

/// Encode a file header.
pub fn encode_file_header(manifest_version: u16) -> [u8; FILE_HEADER_SIZE] {
    let mut buf = [0u8; FILE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&FILE_MAGIC);
    buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&manifest_version.to_le_bytes());
    buf
}

/// Encode a record header.
pub fn encode_record_header(header: &RecordHeader) -> [u8; RECORD_HEADER_SIZE] {
    let mut buf = [0u8; RECORD_HEADER_SIZE];
    buf[0..8].copy_from_slice(&header.timestamp.as_nanos().to_le_bytes());
    buf[8..10].copy_from_slice(&header.task_id.to_le_bytes());
    buf[10] = header.level as u8;
    buf[12..16].copy_from_slice(&header.payload_len.to_le_bytes());
    buf
}

// ---------------------------------------------------------------------------
// Byte-reading helpers. Callers check lengths up front.
// ---------------------------------------------------------------------------

fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or_default()
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn header(ts: u64, task_id: u16, level: u8, payload_len: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&task_id.to_le_bytes());
        buf.push(level);
        buf.push(0);
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf
    }

    #[test]
    fn test_parse_record_header() {
        let data = header(123_456_789, 7, 3, 42);
        let h = parse_record_header(&data).unwrap();
        assert_eq!(h.timestamp, Timestamp(123_456_789));
        assert_eq!(h.task_id, 7);
        assert_eq!(h.level, Level::Warning);
        assert_eq!(h.payload_len, 42);
    }

    #[test]
    fn test_record_header_truncated() {
        let data = header(1, 1, 1, 0);
        let err = parse_record_header(&data[..10]).unwrap_err();
        assert_eq!(err, ParseError::Truncated { size: 10 });
    }

    #[test]
    fn test_record_header_unknown_level() {
        let data = header(1, 1, 9, 0);
        let err = parse_record_header(&data).unwrap_err();
        assert_eq!(err, ParseError::UnknownLevel { raw: 9 });
    }

    #[test]
    fn test_record_header_payload_too_large() {
        let data = header(1, 1, 1, MAX_PAYLOAD_LEN + 1);
        assert!(matches!(
            parse_record_header(&data),
            Err(ParseError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_record_header_matches_parser() {
        let h = RecordHeader {
            timestamp: Timestamp(99),
            task_id: 513,
            level: Level::Verbose,
            payload_len: 4,
        };
        let encoded = encode_record_header(&h);
        assert_eq!(encoded.to_vec(), header(99, 513, 5, 4));
    }

    #[test]
    fn test_parse_file_header() {
        let data = encode_file_header(12);
        let h = parse_file_header(&data).unwrap();
        assert_eq!(h.format_version, FORMAT_VERSION);
        assert_eq!(h.manifest_version, 12);
    }

    #[test]
    fn test_file_header_bad_magic() {
        let mut data = encode_file_header(1);
        data[0] = b'X';
        assert!(matches!(
            parse_file_header(&data),
            Err(ParseError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_file_header_future_version() {
        let mut data = encode_file_header(1);
        data[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        assert_eq!(
            parse_file_header(&data).unwrap_err(),
            ParseError::UnsupportedVersion {
                version: FORMAT_VERSION + 1
            }
        );
    }

    #[test]
    fn test_file_header_truncated() {
        assert_eq!(
            parse_file_header(&[]).unwrap_err(),
            ParseError::Truncated { size: 0 }
        );
    }
}
