use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Trace timestamp in nanoseconds since the Unix epoch. One tick is one nanosecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Beginning of time. Used when no checkpoint exists yet.
    pub const MIN: Self = Self(0);

    /// Latest possible timestamp. Used to read a file to the end of written data.
    pub const MAX: Self = Self(u64::MAX);

    /// Create a timestamp from raw nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Raw nanoseconds since the Unix epoch.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// The timestamp one tick later, saturating at [`Timestamp::MAX`].
    pub const fn next_tick(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Subtract a duration, saturating at [`Timestamp::MIN`].
    pub fn saturating_sub(self, d: Duration) -> Self {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_sub(nanos))
    }

    /// Convert a wall-clock time. Times before the epoch map to MIN.
    pub fn from_system_time(t: SystemTime) -> Self {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        Self(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Convert back to wall-clock time.
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => f.write_str("min"),
            Self::MAX => f.write_str("max"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

/// Severity of a trace record.
/// Values must match the on-disk level byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Level {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

impl Level {
    /// Returns the canonical log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Informational => "info",
            Self::Verbose => "verbose",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Critical),
            2 => Some(Self::Error),
            3 => Some(Self::Warning),
            4 => Some(Self::Informational),
            5 => Some(Self::Verbose),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record exactly as read from a trace file.
///
/// `timestamp` may be rewritten by the ordering engine when the record
/// arrived out of order; `original_timestamp` always keeps the on-disk value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub timestamp: Timestamp,
    pub original_timestamp: Timestamp,
    pub task_id: u16,
    pub level: Level,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn new(timestamp: Timestamp, task_id: u16, level: Level, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            original_timestamp: timestamp,
            task_id,
            level,
            payload,
        }
    }

    /// Whether the dispatched timestamp differs from the on-disk one.
    pub fn was_clamped(&self) -> bool {
        self.timestamp != self.original_timestamp
    }
}

/// A record decoded through the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub timestamp: Timestamp,
    pub task_name: String,
    pub level: Level,
    pub fields: Vec<(String, String)>,
}

impl DecodedEvent {
    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}
