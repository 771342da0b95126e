//! Event encoder

use chrono::SecondsFormat;

use super::event::Event;

/// Encode one event as a complete record, blank line included
pub fn encode(event: &Event) -> Vec<u8> {
    let time = event.time.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let mut out = Vec::with_capacity(event.kind.len() + event.data.len() + time.len() + 48);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(event.kind.as_bytes());
    out.extend_from_slice(b"\nid: ");
    out.extend_from_slice(event.id.to_string().as_bytes());
    out.extend_from_slice(b"\ntime: ");
    out.extend_from_slice(time.as_bytes());

    if !event.data.is_empty() {
        // The decoder appends a newline after every data line
        let data = event.data.strip_suffix(b"\n").unwrap_or(event.data.as_slice());
        out.extend_from_slice(b"\ndata: ");
        for &byte in data {
            if byte == b'\n' {
                out.extend_from_slice(b"\ndata: ");
            } else {
                out.push(byte);
            }
        }
    }

    out.extend_from_slice(b"\n\n");
    out
}
