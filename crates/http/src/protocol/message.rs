use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use http::Version;

use crate::protocol::{Body, Headers, ParseError};

/// The first line of a message: a request line or a status line.
pub trait StartLine: fmt::Debug + Send + Sized + 'static {
    fn parse(line: &str) -> Result<Self, ParseError>;

    fn encode(&self, dst: &mut BytesMut);

    fn version(&self) -> Version;

    /// True when a message with this start line never carries a body.
    fn forbids_body(&self) -> bool;

    /// Framing used when neither `Content-Length` nor `Transfer-Encoding` is present.
    fn implicit_framing(&self) -> BodyFraming;
}

/// Where a message body ends on the wire.
///
/// Chosen once per message from its headers and never changed afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all
    NoBody,
    /// Exactly this many bytes
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Everything up to the end of the connection
    UntilClose,
}

impl BodyFraming {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, BodyFraming::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, BodyFraming::NoBody | BodyFraming::Length(0))
    }

    #[inline]
    pub fn is_until_close(&self) -> bool {
        matches!(self, BodyFraming::UntilClose)
    }
}

/// One item of a message travelling through a codec: the head, or a piece of the body.
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

impl<T> Message<T> {
    #[inline]
    pub fn is_payload(&self) -> bool {
        matches!(self, Message::Payload(_))
    }

    #[inline]
    pub fn is_header(&self) -> bool {
        matches!(self, Message::Header(_))
    }
}

impl<T> From<Bytes> for Message<T> {
    fn from(bytes: Bytes) -> Self {
        Self::Payload(PayloadItem::Chunk(bytes))
    }
}

/// A decoded piece of body, or the end of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}

/// A complete HTTP message: start line, ordered headers and a body.
///
/// The message owns its body. Replacing it with [`HttpMessage::set_body`] disposes
/// the previous one first.
pub struct HttpMessage<L> {
    line: L,
    headers: Headers,
    body: Body,
    framing: Option<BodyFraming>,
}

impl<L: StartLine> HttpMessage<L> {
    pub fn new(line: L, headers: Headers, body: Body) -> Self {
        Self { line, headers, body, framing: None }
    }

    pub(crate) fn received(line: L, headers: Headers, body: Body, framing: BodyFraming) -> Self {
        Self { line, headers, body, framing: Some(framing) }
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn set_body(&mut self, body: Body) {
        self.body.dispose();
        self.body = body;
    }

    /// Moves the body out, leaving an empty one behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::empty())
    }

    /// How the body was framed on the wire, for messages that were read from a peer.
    pub fn framing(&self) -> Option<BodyFraming> {
        self.framing
    }

    pub(crate) fn parts_mut(&mut self) -> (&L, &mut Headers, &mut Body) {
        (&self.line, &mut self.headers, &mut self.body)
    }

    pub fn into_parts(self) -> (L, Headers, Body) {
        (self.line, self.headers, self.body)
    }
}

impl<L: fmt::Debug> fmt::Debug for HttpMessage<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMessage")
            .field("line", &self.line)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("framing", &self.framing)
            .finish()
    }
}

pub(crate) fn parse_version(version: &str) -> Option<Version> {
    match version {
        "HTTP/1.1" => Some(Version::HTTP_11),
        "HTTP/1.0" => Some(Version::HTTP_10),
        _ => None,
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
}
