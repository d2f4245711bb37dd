pub mod event;
pub mod parse;
pub mod reader;
pub mod writer;

pub use self::event::{DecodedEvent, Level, RawRecord, Timestamp};
pub use self::reader::{ReadError, TraceReader};
pub use self::writer::TraceWriter;
