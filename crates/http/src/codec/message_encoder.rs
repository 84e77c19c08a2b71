use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::MessageHead;
use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, SendError, StartLine};

/// Serializes a head followed by its body pieces.
///
/// The body encoder is picked from the head's framing and dropped once the
/// body is finished, after which the next item must be a head again.
#[derive(Debug)]
pub struct MessageEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl MessageEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }
}

impl<L: StartLine, D: Buf> Encoder<Message<MessageHead<L>, D>> for MessageEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<MessageHead<L>, D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header(head) => {
                if self.payload_encoder.as_ref().is_some_and(|encoder| !encoder.is_finish()) {
                    error!("expect payload item but receive message head");
                    return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
                }

                let payload_encoder = PayloadEncoder::from(head.framing);
                self.payload_encoder = if payload_encoder.is_finish() { None } else { Some(payload_encoder) };
                self.header_encoder.encode(head, dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    if payload_item.is_eof() {
                        return Ok(());
                    }
                    error!("expect message head but receive payload item");
                    return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
                };

                let is_eof = payload_item.is_eof();
                let result = payload_encoder.encode(payload_item, dst);
                if is_eof || payload_encoder.is_finish() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}
