use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::codec::body::PayloadDecoder;
use crate::codec::content::ContentCoding;
use crate::codec::header::HeaderDecoder;
use crate::codec::MessageHead;
use crate::protocol::{Body, HttpMessage, Message, ParseError, PayloadItem, StartLine};

/// Splits a byte stream into message heads followed by their body pieces.
///
/// Each head is yielded as [`Message::Header`], then the body as a run of
/// [`Message::Payload`] items ending with [`PayloadItem::Eof`]. The decoder then
/// goes back to reading a head, so pipelined messages come out one after another.
#[derive(Debug)]
pub struct MessageDecoder<L> {
    header_decoder: HeaderDecoder<L>,
    payload_decoder: Option<PayloadDecoder>,
    _line: PhantomData<fn() -> L>,
}

impl<L: StartLine> MessageDecoder<L> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<L> Default for MessageDecoder<L> {
    fn default() -> Self {
        Self { header_decoder: HeaderDecoder::default(), payload_decoder: None, _line: PhantomData }
    }
}

impl<L: StartLine> MessageDecoder<L> {
    fn on_payload(&mut self, item: Option<PayloadItem>) -> Option<Message<MessageHead<L>>> {
        if item.as_ref().is_some_and(PayloadItem::is_eof) {
            self.payload_decoder.take();
        }
        item.map(Message::Payload)
    }
}

impl<L: StartLine> Decoder for MessageDecoder<L> {
    type Item = Message<MessageHead<L>>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            return Ok(self.on_payload(item));
        }

        let message = match self.header_decoder.decode(src)? {
            Some(head) => {
                self.payload_decoder = Some(head.framing.into());
                Some(Message::Header(head))
            }
            None => None,
        };

        Ok(message)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode_eof(src)?;
            return Ok(self.on_payload(item));
        }

        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(ParseError::io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside a message head"))),
        }
    }
}

/// Reads the next head from a decoded message stream; `None` when the stream ended cleanly.
pub async fn read_head<S, L>(stream: &mut S) -> Result<Option<MessageHead<L>>, ParseError>
where
    S: Stream<Item = Result<Message<MessageHead<L>>, ParseError>> + Unpin,
    L: StartLine,
{
    match stream.next().await {
        None => Ok(None),
        Some(Ok(Message::Header(head))) => Ok(Some(head)),
        Some(Ok(Message::Payload(_))) => Err(ParseError::invalid_line("body data where a message head was expected")),
        Some(Err(e)) => Err(e),
    }
}

/// Collects the body that follows `head` and removes its content coding.
///
/// The assembled message's body holds the decoded bytes; `Content-Encoding` is
/// dropped and a present `Content-Length` is rewritten to the decoded length.
pub async fn read_body<S, L>(stream: &mut S, head: MessageHead<L>) -> Result<HttpMessage<L>, ParseError>
where
    S: Stream<Item = Result<Message<MessageHead<L>>, ParseError>> + Unpin,
    L: StartLine,
{
    let MessageHead { line, mut headers, framing } = head;
    let coding = ContentCoding::from_headers(&headers)?;

    let mut body = BytesMut::new();
    loop {
        match stream.next().await {
            Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => body.extend_from_slice(&bytes),
            Some(Ok(Message::Payload(PayloadItem::Eof))) => break,
            Some(Ok(Message::Header(_))) => return Err(ParseError::invalid_line("message head inside a body")),
            Some(Err(e)) => return Err(e),
            None => return Err(ParseError::incomplete_body(0)),
        }
    }

    let raw_len = body.len();
    let body = coding.decode(body.freeze())?;
    coding.strip(&mut headers, Some(body.len() as u64));
    debug!(raw_len, decoded_len = body.len(), ?framing, "read message body");

    Ok(HttpMessage::received(line, headers, Body::from(body), framing))
}

/// Reads one complete message: head, body and content decoding.
pub async fn read_message<S, L>(stream: &mut S) -> Result<Option<HttpMessage<L>>, ParseError>
where
    S: Stream<Item = Result<Message<MessageHead<L>>, ParseError>> + Unpin,
    L: StartLine,
{
    match read_head(stream).await? {
        Some(head) => Ok(Some(read_body(stream, head).await?)),
        None => Ok(None),
    }
}
