use std::io::{self, Cursor, Read, Write};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;
use tracing::debug;

use crate::codec::body::PayloadEncoder;
use crate::codec::framing;
use crate::codec::header::{encode_head, set_framing_headers};
use crate::protocol::{BodyFraming, HttpMessage, PayloadItem, SendError, StartLine};

/// Largest streaming body buffered to compute a `Content-Length`.
pub const UNSTREAM_LIMIT: usize = 4000;

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Writes messages to a blocking byte stream.
///
/// The framing of each message follows its headers. When they leave it open,
/// in-memory bodies get a `Content-Length`, and a streaming body of a response is
/// either unstreamed or delimited by closing the connection. A streaming request
/// body is sent chunked.
#[derive(Debug)]
pub struct MessageWriter<W> {
    writer: W,
    buffer: BytesMut,
    unstreaming: bool,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(writer: W, buffer_size: usize) -> Self {
        Self { writer, buffer: BytesMut::with_capacity(buffer_size), unstreaming: true }
    }

    /// Whether a streaming body of up to [`UNSTREAM_LIMIT`] bytes is buffered and
    /// sent with a `Content-Length` instead of closing the connection after it.
    pub fn unstreaming(mut self, enabled: bool) -> Self {
        self.unstreaming = enabled;
        self
    }

    #[inline]
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Writes and flushes a whole message, consuming its body.
    ///
    /// Returns the framing used; after [`BodyFraming::UntilClose`] the connection
    /// must be closed to end the body. A failed write leaves nothing buffered for
    /// the next one.
    pub fn write<L: StartLine>(&mut self, message: &mut HttpMessage<L>) -> Result<BodyFraming, SendError> {
        let result = self.write_message(message);
        self.discard_on_error(result)
    }

    /// Writes the head a full write would produce but no body; for responses to `HEAD`.
    pub fn write_head_only<L: StartLine>(&mut self, message: &mut HttpMessage<L>) -> Result<BodyFraming, SendError> {
        let result = self.write_head(message);
        self.discard_on_error(result)
    }

    fn discard_on_error<T>(&mut self, result: Result<T, SendError>) -> Result<T, SendError> {
        if result.is_err() && !self.buffer.is_empty() {
            debug!(discarded = self.buffer.len(), "dropped buffered output of a failed write");
            self.buffer.clear();
        }
        result
    }

    fn write_message<L: StartLine>(&mut self, message: &mut HttpMessage<L>) -> Result<BodyFraming, SendError> {
        let (line, headers, body) = message.parts_mut();

        let (framing, body) = match framing::outgoing(line, headers, body.len())? {
            Some(BodyFraming::NoBody) => {
                body.dispose();
                (BodyFraming::NoBody, None)
            }
            Some(framing) => (framing, Some(body.stream().map_err(SendError::from)?)),
            None if line.implicit_framing() == BodyFraming::NoBody => (BodyFraming::Chunked, Some(body.stream().map_err(SendError::from)?)),
            None if self.unstreaming => {
                let mut stream = body.stream().map_err(SendError::from)?;
                let mut prefix = Vec::with_capacity(UNSTREAM_LIMIT + 1);
                (&mut stream).take(UNSTREAM_LIMIT as u64 + 1).read_to_end(&mut prefix).map_err(SendError::io)?;

                if prefix.len() <= UNSTREAM_LIMIT {
                    debug!(len = prefix.len(), "unstreamed body");
                    let len = prefix.len() as u64;
                    (BodyFraming::Length(len), Some(Box::new(Cursor::new(prefix)) as Box<dyn Read + Send>))
                } else {
                    headers.set("Connection", "close");
                    (BodyFraming::UntilClose, Some(Box::new(Cursor::new(prefix).chain(stream)) as Box<dyn Read + Send>))
                }
            }
            None => {
                headers.set("Connection", "close");
                (BodyFraming::UntilClose, Some(body.stream().map_err(SendError::from)?))
            }
        };

        set_framing_headers(headers, framing);
        encode_head(line, headers, &mut self.buffer);

        let written = match body {
            Some(stream) => self.write_body(framing, stream)?,
            None => 0,
        };
        self.flush()?;

        debug!(?framing, body_len = written, "wrote message");
        Ok(framing)
    }

    fn write_head<L: StartLine>(&mut self, message: &mut HttpMessage<L>) -> Result<BodyFraming, SendError> {
        let (line, headers, body) = message.parts_mut();
        let framing = framing::outgoing(line, headers, body.len())?.unwrap_or(BodyFraming::UntilClose);
        body.dispose();

        encode_head(line, headers, &mut self.buffer);
        self.flush()?;
        Ok(framing)
    }

    fn write_body(&mut self, framing: BodyFraming, stream: Box<dyn Read + Send>) -> Result<u64, SendError> {
        let mut encoder = PayloadEncoder::from(framing);
        let mut stream = match framing {
            // one byte more than announced so an overlong body is caught
            BodyFraming::Length(n) => Box::new(stream.take(n.saturating_add(1))) as Box<dyn Read + Send>,
            _ => stream,
        };

        let mut chunk = vec![0u8; DEFAULT_BUFFER_SIZE];
        let mut written = 0;
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SendError::io(e)),
            };
            if n == 0 {
                encoder.encode(PayloadItem::<Bytes>::Eof, &mut self.buffer)?;
                return Ok(written);
            }

            encoder.encode(PayloadItem::Chunk(Bytes::copy_from_slice(&chunk[..n])), &mut self.buffer)?;
            written += n as u64;
            if self.buffer.len() >= DEFAULT_BUFFER_SIZE {
                self.write_buffer()?;
            }
        }
    }

    fn write_buffer(&mut self) -> Result<(), SendError> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), SendError> {
        self.write_buffer()?;
        Ok(self.writer.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::MessageReader;
    use crate::protocol::{Body, Headers, Request, RequestLine, Response};
    use http::{Method, StatusCode};

    fn written(message: &mut Response, unstreaming: bool) -> (BodyFraming, String) {
        let mut writer = MessageWriter::new(Vec::new()).unstreaming(unstreaming);
        let framing = writer.write(message).unwrap();
        (framing, String::from_utf8(writer.into_inner()).unwrap())
    }

    #[test]
    fn in_memory_body_gets_length() {
        let mut response = Response::with_status(StatusCode::OK).with_body("hello");
        let (framing, wire) = written(&mut response, true);
        assert_eq!(framing, BodyFraming::Length(5));
        assert_eq!(wire, "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        assert!(response.body_ref().is_consumed());
    }

    #[test]
    fn unstreamed_round_trip() {
        let text = "x".repeat(UNSTREAM_LIMIT);
        let mut response = Response::with_status(StatusCode::OK).with_body(Body::from_reader(Cursor::new(text.clone().into_bytes())));

        let mut writer = MessageWriter::new(Vec::new());
        assert_eq!(writer.write(&mut response).unwrap(), BodyFraming::Length(UNSTREAM_LIMIT as u64));

        let mut reader = MessageReader::new(Cursor::new(writer.into_inner()));
        let mut back = reader.read_response().unwrap().unwrap();
        assert_eq!(back.headers().get("content-length"), Some("4000"));
        assert!(!back.headers().contains("connection"));
        assert_eq!(back.body_mut().text().unwrap(), text);
    }

    #[test]
    fn large_stream_closes_connection() {
        let text = "y".repeat(UNSTREAM_LIMIT + 1);
        let mut response = Response::with_status(StatusCode::OK).with_body(Body::from_reader(Cursor::new(text.clone().into_bytes())));

        let (framing, wire) = written(&mut response, true);
        assert_eq!(framing, BodyFraming::UntilClose);
        assert_eq!(wire, format!("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{text}"));

        let mut response = Response::with_status(StatusCode::OK).with_body(Body::from_reader(Cursor::new(b"tiny".to_vec())));
        let (framing, wire) = written(&mut response, false);
        assert_eq!(framing, BodyFraming::UntilClose);
        assert!(wire.ends_with("\r\n\r\ntiny"));
    }

    #[test]
    fn explicit_framing_headers() {
        let mut response = Response::with_status(StatusCode::OK)
            .with_header("Transfer-Encoding", "chunked")
            .with_body(Body::from_reader(Cursor::new(b"Wikipedia".to_vec())));
        let (_, wire) = written(&mut response, true);
        assert!(wire.ends_with("\r\n\r\n9\r\nWikipedia\r\n0\r\n\r\n"));

        let mut response = Response::with_status(StatusCode::OK)
            .with_header("Content-Length", "10")
            .with_body(Body::from_reader(Cursor::new(b"short".to_vec())));
        let mut writer = MessageWriter::new(Vec::new());
        assert!(matches!(writer.write(&mut response), Err(SendError::InvalidBody { .. })));

        let mut response = Response::with_status(StatusCode::OK)
            .with_header("Content-Length", "2")
            .with_body(Body::from_reader(Cursor::new(b"too long".to_vec())));
        assert!(matches!(writer.write(&mut response), Err(SendError::InvalidBody { .. })));
    }

    #[test]
    fn failed_write_leaves_nothing_for_the_next() {
        let mut writer = MessageWriter::new(Vec::new());
        let mut short = Response::with_status(StatusCode::OK)
            .with_header("Content-Length", "10")
            .with_body(Body::from_reader(Cursor::new(b"short".to_vec())));
        assert!(matches!(writer.write(&mut short), Err(SendError::InvalidBody { .. })));

        let mut next = Response::with_status(StatusCode::NO_CONTENT);
        writer.write(&mut next).unwrap();
        assert_eq!(writer.into_inner(), b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[test]
    fn bodyless_statuses_and_head() {
        let mut response = Response::with_status(StatusCode::NO_CONTENT).with_body("ignored");
        let (framing, wire) = written(&mut response, true);
        assert_eq!(framing, BodyFraming::NoBody);
        assert_eq!(wire, "HTTP/1.1 204 No Content\r\n\r\n");

        let mut response = Response::with_status(StatusCode::OK).with_body("abc");
        let mut writer = MessageWriter::new(Vec::new());
        writer.write_head_only(&mut response).unwrap();
        assert_eq!(writer.into_inner(), b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n");
    }

    #[test]
    fn streaming_request_is_chunked() {
        let mut request = Request::new(
            RequestLine::new(Method::POST, "/upload"),
            Headers::new(),
            Body::from_reader(Cursor::new(b"data".to_vec())),
        );
        let mut writer = MessageWriter::new(Vec::new());
        assert_eq!(writer.write(&mut request).unwrap(), BodyFraming::Chunked);
        assert_eq!(writer.into_inner(), b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ndata\r\n0\r\n\r\n");

        let mut get = Request::get("/");
        let mut writer = MessageWriter::new(Vec::new());
        assert_eq!(writer.write(&mut get).unwrap(), BodyFraming::NoBody);
        assert_eq!(writer.into_inner(), b"GET / HTTP/1.1\r\n\r\n");
    }
}
