//! Length-prefixed wire format.
//!
//! Every frame is `[u32 big-endian length][sender tag][0x00][payload]`, where
//! the length covers everything after the length field. The payload is
//! opaque, so messages containing whitespace, newlines or NUL bytes survive
//! the trip unchanged.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::{FramingError, RelayError},
    message::Message,
};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const TAG_SEPARATOR: u8 = 0x00;
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl MessageCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Encodes one message into a standalone frame.
    pub fn encode_frame(&self, message: &Message) -> Result<Bytes, FramingError> {
        let mut dst = BytesMut::new();
        self.encode_into(message, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Appends `incoming` to a connection's inbound buffer and decodes every
    /// complete frame now available, in arrival order.
    ///
    /// A partial trailing frame stays in `inbound` for the next call. Decoding
    /// stops after a [`FramingError::TooLarge`] because the stream can no
    /// longer be resynchronised; other framing errors consume only the
    /// offending frame.
    pub fn feed(
        &mut self,
        inbound: &mut BytesMut,
        incoming: &[u8],
    ) -> Vec<Result<Message, FramingError>> {
        inbound.extend_from_slice(incoming);

        let mut decoded = Vec::new();
        loop {
            match self.decode_frame(inbound) {
                Ok(Some(message)) => decoded.push(Ok(message)),
                Ok(None) => break,
                Err(err @ FramingError::TooLarge { .. }) => {
                    decoded.push(Err(err));
                    break;
                }
                Err(err) => decoded.push(Err(err)),
            }
        }
        decoded
    }

    fn encode_into(&self, message: &Message, dst: &mut BytesMut) -> Result<(), FramingError> {
        let tag = message.sender_tag.as_bytes();
        if tag.contains(&TAG_SEPARATOR) {
            return Err(FramingError::NulInSenderTag);
        }

        let len = tag.len() + 1 + message.payload.len();
        if len > self.max_frame_len || u32::try_from(len).is_err() {
            return Err(FramingError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_u32(len as u32);
        dst.put_slice(tag);
        dst.put_u8(TAG_SEPARATOR);
        dst.put_slice(&message.payload);
        Ok(())
    }

    fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Message>, FramingError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_len {
            return Err(FramingError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let frame_len = LENGTH_PREFIX_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len).freeze();
        parse_body(body).map(Some)
    }
}

fn parse_body(body: Bytes) -> Result<Message, FramingError> {
    let separator = body
        .iter()
        .position(|byte| *byte == TAG_SEPARATOR)
        .ok_or(FramingError::MissingSeparator)?;

    let sender_tag = std::str::from_utf8(&body[..separator])
        .map_err(|_| FramingError::InvalidSenderTag)?
        .to_string();

    Ok(Message {
        sender_tag,
        payload: body.slice(separator + 1..),
        received_at: Utc::now(),
    })
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_frame(src)?)
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = RelayError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(self.encode_into(item, dst)?)
    }
}
