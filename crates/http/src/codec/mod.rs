//! Streaming HTTP/1.x codecs.
//!
//! Messages travel through the codecs as a
//! [`Message::Header`](crate::protocol::Message::Header) carrying a
//! [`MessageHead`], followed by payload items that end with
//! [`PayloadItem::Eof`](crate::protocol::PayloadItem::Eof). Every decoder is a
//! resumable state machine: one `decode` call is one step, resumed when more
//! bytes arrive.
//!
//! - [`MessageDecoder`] / [`MessageEncoder`]: whole messages, used with
//!   `FramedRead` / `FramedWrite`
//! - [`header`]: start line and header block
//! - [`body`]: `Content-Length`, chunked and until-close bodies
//! - [`ContentCoding`]: transparent gzip and deflate decoding
//!
//! # Example
//!
//! ```
//! use sockkit_http::codec::{RequestDecoder, read_message};
//! use tokio_util::codec::FramedRead;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let wire: &[u8] = b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
//! let mut framed = FramedRead::new(wire, RequestDecoder::new());
//!
//! let mut request = read_message(&mut framed).await.unwrap().unwrap();
//! assert_eq!(request.body_mut().text().unwrap(), "Wikipedia");
//! # });
//! ```

use std::io;

use bytes::{BufMut, BytesMut};

use crate::protocol::{BodyFraming, Headers, RequestLine, StatusLine};

pub mod body;
mod content;
pub(crate) mod framing;
pub mod header;
mod message_decoder;
mod message_encoder;

pub use content::ContentCoding;
pub use message_decoder::{MessageDecoder, read_body, read_head, read_message};
pub use message_encoder::MessageEncoder;

pub type RequestDecoder = MessageDecoder<RequestLine>;
pub type ResponseDecoder = MessageDecoder<StatusLine>;

/// The head of a message as it passes through the codecs.
#[derive(Debug)]
pub struct MessageHead<L> {
    pub line: L,
    pub headers: Headers,
    pub framing: BodyFraming,
}

/// `io::Write` straight into a `BytesMut`, for `write!` formatting.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl io::Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
