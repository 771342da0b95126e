//! Streaming event codec
//!
//! Line-oriented text format for exposing bus events to remote observers:
//!
//! ```text
//! event: InstanceMonitorUpdated
//! id: 1
//! time: 2024-05-01T12:30:00.123456789Z
//! data: {"path":"ns1/svc/app1","node":"node1","value":{...}}
//!
//! ```
//!
//! Lines starting with `:` are comments, a blank line dispatches the record.

mod decode;
mod encode;
mod error;
mod event;
mod stream;

pub use decode::{DEFAULT_MAX_RECORD_SIZE, Decoder, RecordParser};
pub use encode::encode;
pub use error::CodecError;
pub use event::Event;
pub use stream::{StreamOptions, serve_stream};
