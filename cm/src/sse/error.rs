//! Codec errors

use thiserror::Error;

/// Terminal errors of an event stream
///
/// Cloneable so a decoder can hand the same sticky error to every reader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Decode error at line {line}: {reason}")]
    Decode { line: u64, reason: String },

    #[error("Record exceeds {limit} bytes")]
    RecordTooLarge { limit: usize },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Decoder closed")]
    Closed,

    #[error("Wire error: {0}")]
    Wire(String),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
