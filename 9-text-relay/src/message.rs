use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One relayed chat message.
///
/// `sender_tag` is stamped by the sending client with its own local address;
/// the server forwards it untouched. `received_at` is local bookkeeping and
/// never travels on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender_tag: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(sender_tag: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            sender_tag: sender_tag.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn text(sender_tag: impl Into<String>, text: &str) -> Self {
        Self::new(sender_tag, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
