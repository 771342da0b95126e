//! Wire-level event

use chrono::{DateTime, Utc};

use crate::bus::{Delivery, Msg};

use super::error::CodecError;

/// One record of the streaming wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    /// Monotonic within one delivery stream
    pub id: u64,
    /// Opaque payload; bus messages carry JSON followed by `\n`
    pub data: Vec<u8>,
    pub time: DateTime<Utc>,
}

impl Event {
    /// Kind of a record without an `event:` field
    pub const DEFAULT_KIND: &'static str = "message";

    pub fn new(kind: impl Into<String>, id: u64, data: impl Into<Vec<u8>>, time: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            id,
            data: data.into(),
            time,
        }
    }

    /// Wire event for a bus delivery, numbered `id` in its stream
    pub fn from_delivery(id: u64, delivery: &Delivery) -> Result<Self, CodecError> {
        let mut data = delivery
            .msg
            .to_json()
            .map_err(|e| CodecError::Wire(e.to_string()))?;
        data.push(b'\n');
        Ok(Self::new(delivery.msg.kind().as_str(), id, data, delivery.time))
    }

    /// Typed bus message carried by this event
    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        Msg::from_wire(&self.kind, &self.data).map_err(|e| CodecError::Wire(e.to_string()))
    }
}
