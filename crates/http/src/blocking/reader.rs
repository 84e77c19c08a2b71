use std::fmt;
use std::io::{self, BufRead, Read};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::framing;
use crate::codec::header::{MAX_HEADER_BYTES, parse_head};
use crate::codec::ContentCoding;
use crate::protocol::{Body, BodyFraming, HttpMessage, ParseError, Request, Response, StartLine};

/// Longest chunk size line accepted, extensions included.
const MAX_CHUNK_LINE: u64 = 4 * 1024;

/// Reads messages from a blocking byte stream.
///
/// The body of a returned message is a stream over the connection itself and
/// is decoded on demand. Reading the next message first skips whatever is left
/// of the previous body, and bodies of earlier messages stop working.
pub struct MessageReader<R> {
    wire: Arc<Mutex<Wire<R>>>,
}

struct Wire<R> {
    reader: R,
    body: RawBody,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawBody {
    Done,
    Length(u64),
    /// Bytes left in the current chunk; zero means a size line comes next
    Chunked(u64),
    UntilClose,
}

impl From<BodyFraming> for RawBody {
    fn from(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::NoBody | BodyFraming::Length(0) => RawBody::Done,
            BodyFraming::Length(n) => RawBody::Length(n),
            BodyFraming::Chunked => RawBody::Chunked(0),
            BodyFraming::UntilClose => RawBody::UntilClose,
        }
    }
}

impl<R> MessageReader<R>
where
    R: BufRead + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self { wire: Arc::new(Mutex::new(Wire { reader, body: RawBody::Done, generation: 0 })) }
    }

    /// The next request, or `None` when the peer closed before sending a byte of it.
    pub fn read_request(&mut self) -> Result<Option<Request>, ParseError> {
        self.read_message()
    }

    /// The next response, or `None` when the peer closed before sending a byte of it.
    pub fn read_response(&mut self) -> Result<Option<Response>, ParseError> {
        self.read_message()
    }

    pub fn read_message<L: StartLine>(&mut self) -> Result<Option<HttpMessage<L>>, ParseError> {
        let mut wire = self.wire.lock();
        wire.skip()?;
        wire.generation += 1;

        let Some(head) = wire.read_head()? else {
            return Ok(None);
        };

        let (line, mut headers) = parse_head::<L>(&head)?;
        let framing = framing::incoming(&line, &headers)?;
        let coding = ContentCoding::from_headers(&headers)?;
        wire.body = RawBody::from(framing);
        let pending = wire.body != RawBody::Done;
        let generation = wire.generation;
        trace!(head_len = head.len(), ?framing, ?coding, "read message head");
        // decoders may read from the body while being built
        drop(wire);

        let body = if pending {
            let raw = BodyReader { wire: Arc::clone(&self.wire), generation };
            coding.strip(&mut headers, None);
            Body::from_reader(coding.reader(raw))
        } else {
            Body::empty()
        };

        Ok(Some(HttpMessage::received(line, headers, body, framing)))
    }

    /// Discards the unread rest of the current body, returning how many raw bytes were dropped.
    pub fn skip_body(&mut self) -> Result<u64, ParseError> {
        self.wire.lock().skip()
    }
}

impl<R> fmt::Debug for MessageReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let wire = self.wire.lock();
        f.debug_struct("MessageReader").field("body", &wire.body).field("generation", &wire.generation).finish()
    }
}

impl<R: BufRead> Wire<R> {
    /// Reads up to and including the blank line that ends a head.
    fn read_head(&mut self) -> Result<Option<Vec<u8>>, ParseError> {
        let mut head = Vec::with_capacity(1024);
        loop {
            let budget = (MAX_HEADER_BYTES - head.len()) as u64;
            let start = head.len();
            let n = (&mut self.reader).take(budget).read_until(b'\n', &mut head)?;

            if n == 0 || !head.ends_with(b"\n") {
                if head.is_empty() {
                    return Ok(None);
                }
                if head.len() >= MAX_HEADER_BYTES {
                    return Err(ParseError::too_large_header(head.len(), MAX_HEADER_BYTES));
                }
                return Err(ParseError::io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed inside a message head")));
            }

            check_line_ending(&head[start..])?;
            if head.len() - start == 2 {
                return Ok(Some(head));
            }
        }
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, ParseError> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.body {
            RawBody::Done => Ok(0),
            RawBody::Length(remaining) => {
                let max = remaining.min(buf.len() as u64) as usize;
                let n = self.reader.read(&mut buf[..max])?;
                if n == 0 {
                    return Err(ParseError::incomplete_body(remaining));
                }
                self.body = if remaining == n as u64 { RawBody::Done } else { RawBody::Length(remaining - n as u64) };
                Ok(n)
            }
            RawBody::Chunked(0) => {
                let size = self.read_chunk_size()?;
                if size == 0 {
                    self.read_trailers()?;
                    self.body = RawBody::Done;
                    return Ok(0);
                }
                self.body = RawBody::Chunked(size);
                self.read_body(buf)
            }
            RawBody::Chunked(remaining) => {
                let max = remaining.min(buf.len() as u64) as usize;
                let n = self.reader.read(&mut buf[..max])?;
                if n == 0 {
                    return Err(ParseError::incomplete_body(remaining));
                }
                if remaining == n as u64 {
                    let mut crlf = [0u8; 2];
                    self.reader.read_exact(&mut crlf)?;
                    if &crlf != b"\r\n" {
                        return Err(ParseError::invalid_line("chunk data not followed by CRLF"));
                    }
                }
                self.body = RawBody::Chunked(remaining - n as u64);
                Ok(n)
            }
            RawBody::UntilClose => {
                let n = self.reader.read(buf)?;
                if n == 0 {
                    self.body = RawBody::Done;
                }
                Ok(n)
            }
        }
    }

    fn read_chunk_size(&mut self) -> Result<u64, ParseError> {
        let line = self.read_line(MAX_CHUNK_LINE)?;
        match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => Ok(size),
            Ok(httparse::Status::Partial) | Err(_) => {
                Err(ParseError::invalid_chunk_size(format!("{:?}", String::from_utf8_lossy(&line))))
            }
        }
    }

    /// Trailer fields after the last chunk are read and dropped.
    fn read_trailers(&mut self) -> Result<(), ParseError> {
        let mut total = 0;
        loop {
            let line = self.read_line(MAX_HEADER_BYTES as u64)?;
            total += line.len();
            if line.len() == 2 {
                return Ok(());
            }
            if total > MAX_HEADER_BYTES {
                return Err(ParseError::too_large_header(total, MAX_HEADER_BYTES));
            }
        }
    }

    /// One CRLF terminated line, terminator included.
    fn read_line(&mut self, limit: u64) -> Result<Vec<u8>, ParseError> {
        let mut line = Vec::new();
        (&mut self.reader).take(limit).read_until(b'\n', &mut line)?;
        if !line.ends_with(b"\n") {
            if line.len() as u64 >= limit {
                return Err(ParseError::invalid_line("line too long"));
            }
            return Err(ParseError::incomplete_body(0));
        }
        check_line_ending(&line)?;
        Ok(line)
    }

    fn skip(&mut self) -> Result<u64, ParseError> {
        let mut skipped = 0;
        let mut scratch = [0u8; 8 * 1024];
        loop {
            match self.read_body(&mut scratch)? {
                0 if self.body == RawBody::Done => break,
                n => skipped += n as u64,
            }
        }
        if skipped > 0 {
            debug!(skipped, "skipped unread body bytes");
        }
        Ok(skipped)
    }
}

/// A line read with `read_until(b'\n')` must end in CRLF and hold no other CR.
fn check_line_ending(line: &[u8]) -> Result<(), ParseError> {
    let Some(content) = line.strip_suffix(b"\r\n") else {
        return Err(ParseError::invalid_line("LF without preceding CR"));
    };
    if content.contains(&b'\r') {
        return Err(ParseError::invalid_line("CR not followed by LF"));
    }
    Ok(())
}

/// The raw body of one message, read straight from the connection.
struct BodyReader<R> {
    wire: Arc<Mutex<Wire<R>>>,
    generation: u64,
}

impl<R: BufRead> Read for BodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.wire.lock();
        if wire.generation != self.generation {
            return Err(io::Error::other("body belongs to an earlier message"));
        }
        wire.read_body(buf).map_err(|e| match e {
            ParseError::Io { source } => source,
            e => io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }
}
