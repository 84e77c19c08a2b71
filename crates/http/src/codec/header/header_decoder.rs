//! Message head decoding: start line, header block and framing selection.
//!
//! Every line of a head must end with CRLF. A CR that is not followed by LF, or
//! an LF that is not preceded by CR, is fatal. A line starting with SP or HTAB
//! continues the previous header (obs-fold); the pieces are joined with CRLF so the
//! value can be written back unchanged.
//!
//! # Limits
//!
//! - Maximum header block size: 64 KiB
//! - Maximum number of headers: 128

use std::marker::PhantomData;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::{MessageHead, framing};
use crate::ensure;
use crate::protocol::{Headers, ParseError, StartLine};

/// Maximum number of headers allowed in a message
pub(crate) const MAX_HEADER_NUM: usize = 128;

/// Maximum size in bytes allowed for the entire head, blank line included
pub(crate) const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Decoder for message heads.
///
/// Never consumes bytes past the blank line that ends the head; whatever follows
/// stays in the buffer for the body decoder.
#[derive(Debug)]
pub struct HeaderDecoder<L> {
    scanner: HeadScanner,
    _line: PhantomData<fn() -> L>,
}

impl<L> Default for HeaderDecoder<L> {
    fn default() -> Self {
        Self { scanner: HeadScanner::default(), _line: PhantomData }
    }
}

impl<L: StartLine> Decoder for HeaderDecoder<L> {
    type Item = MessageHead<L>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(head_len) = self.scanner.scan(src)? else {
            return Ok(None);
        };

        let head = src.split_to(head_len);
        let (line, headers) = parse_head::<L>(&head)?;
        let framing = framing::incoming(&line, &headers)?;

        trace!(head_len, headers = headers.len(), ?framing, "decoded message head");
        Ok(Some(MessageHead { line, headers, framing }))
    }
}

/// Incremental search for the end of a head.
///
/// Remembers how far the buffer was already checked so each call only looks at
/// bytes that arrived since the previous one.
#[derive(Debug, Default)]
struct HeadScanner {
    pos: usize,
    line_start: usize,
}

impl HeadScanner {
    /// Returns the length of the head, blank line included, once it is complete.
    fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, ParseError> {
        while self.pos < buf.len() {
            match buf[self.pos] {
                b'\n' => return Err(ParseError::invalid_line("LF without preceding CR")),
                b'\r' => match buf.get(self.pos + 1) {
                    None => break,
                    Some(b'\n') => {
                        let blank = self.pos == self.line_start;
                        self.pos += 2;
                        self.line_start = self.pos;
                        if blank {
                            let head_len = self.pos;
                            *self = Self::default();
                            ensure!(head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(head_len, MAX_HEADER_BYTES));
                            return Ok(Some(head_len));
                        }
                        continue;
                    }
                    Some(_) => return Err(ParseError::invalid_line("CR not followed by LF")),
                },
                _ => {}
            }
            self.pos += 1;
        }

        ensure!(buf.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(buf.len(), MAX_HEADER_BYTES));
        Ok(None)
    }
}

/// Parses a complete head: the start line, then the header block up to the blank line.
pub(crate) fn parse_head<L: StartLine>(head: &[u8]) -> Result<(L, Headers), ParseError> {
    let mut lines = head.split(|b| *b == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let start = lines.next().unwrap_or_default();
    let start = std::str::from_utf8(start).map_err(|_| ParseError::invalid_start_line(String::from_utf8_lossy(start)))?;
    let line = L::parse(start)?;

    let mut headers = Headers::with_capacity(16);
    let mut pending: Option<String> = None;

    for raw in lines {
        if raw.is_empty() {
            break;
        }
        check_field_bytes(raw)?;
        let text = std::str::from_utf8(raw).map_err(|_| ParseError::invalid_header("header line is not valid utf-8"))?;

        if raw[0] == b' ' || raw[0] == b'\t' {
            let Some(field) = pending.as_mut() else {
                return Err(ParseError::invalid_header("continuation line before the first header"));
            };
            field.push_str("\r\n");
            field.push_str(text);
            continue;
        }

        if let Some(field) = pending.replace(text.to_owned()) {
            push_field(&mut headers, &field)?;
        }
    }

    if let Some(field) = pending {
        push_field(&mut headers, &field)?;
    }

    Ok((line, headers))
}

fn push_field(headers: &mut Headers, field: &str) -> Result<(), ParseError> {
    let (name, value) = split_field(field)?;
    ensure!(headers.len() < MAX_HEADER_NUM, ParseError::too_many_headers(MAX_HEADER_NUM));
    headers.append(name, value);
    Ok(())
}

/// Checks `token ":" value`, tolerating whitespace before the colon.
fn split_field(field: &str) -> Result<(&str, &str), ParseError> {
    let Some((name, value)) = field.split_once(':') else {
        return Err(ParseError::invalid_header(format!("missing colon in {field:?}")));
    };

    let name = name.trim_end_matches([' ', '\t']);
    ensure!(!name.is_empty() && name.bytes().all(is_tchar), ParseError::invalid_header(format!("invalid header name {name:?}")));

    Ok((name, value.trim_matches([' ', '\t'])))
}

fn check_field_bytes(raw: &[u8]) -> Result<(), ParseError> {
    match raw.iter().find(|b| (**b < b' ' && **b != b'\t') || **b == 0x7f) {
        Some(b) => Err(ParseError::invalid_header(format!("control character 0x{b:02x} in header line"))),
        None => Ok(()),
    }
}

/// `tchar` of RFC 7230 section 3.2.6.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
