//! `Transfer-Encoding: chunked` body decoding, RFC 7230 section 4.1.
//!
//! Every call to [`ChunkedDecoder::decode`] advances a small state machine one
//! byte (or one run of payload bytes) at a time, so the decoder can be resumed
//! wherever the previous read left off. Chunk extensions and trailer fields are
//! read and discarded.

use std::task::Poll;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};
use ChunkedState::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining: u64,
    digits: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: Size, remaining: 0, digits: 0 }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunked data");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                return Ok(None);
            }

            let mut chunk = None;
            self.state = match self.step(src, &mut chunk) {
                Poll::Pending => return Ok(None),
                Poll::Ready(state) => state?,
            };

            if let Some(bytes) = chunk {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => Err(ParseError::incomplete_body(self.remaining)),
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.is_empty() {
            return Poll::Pending;
        }
        $src.get_u8()
    }};
}

macro_rules! expect_byte {
    ($src:ident, $byte:literal, $next:expr, $what:literal) => {{
        match try_next_byte!($src) {
            $byte => Poll::Ready(Ok($next)),
            _ => Poll::Ready(Err(ParseError::invalid_line(concat!("expected ", $what)))),
        }
    }};
}

impl ChunkedDecoder {
    fn step(&mut self, src: &mut BytesMut, chunk: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        match self.state {
            Size => self.read_size(src),
            SizeLws => match try_next_byte!(src) {
                b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
                b';' => Poll::Ready(Ok(Extension)),
                b'\r' => Poll::Ready(Ok(SizeLf)),
                b => Poll::Ready(Err(ParseError::invalid_chunk_size(format!("unexpected byte 0x{b:02x} after size")))),
            },
            // extensions end at CRLF, a bare LF inside one is rejected
            Extension => match try_next_byte!(src) {
                b'\r' => Poll::Ready(Ok(SizeLf)),
                b'\n' => Poll::Ready(Err(ParseError::invalid_line("chunk extension contains LF"))),
                _ => Poll::Ready(Ok(Extension)),
            },
            SizeLf => {
                let next = if self.remaining == 0 { EndCr } else { Body };
                self.digits = 0;
                expect_byte!(src, b'\n', next, "LF after chunk size")
            }
            Body => Poll::Ready(Ok(self.read_body(src, chunk))),
            BodyCr => expect_byte!(src, b'\r', BodyLf, "CR after chunk data"),
            BodyLf => expect_byte!(src, b'\n', Size, "LF after chunk data"),
            Trailer => match try_next_byte!(src) {
                b'\r' => Poll::Ready(Ok(TrailerLf)),
                b'\n' => Poll::Ready(Err(ParseError::invalid_line("trailer contains LF without CR"))),
                _ => Poll::Ready(Ok(Trailer)),
            },
            TrailerLf => expect_byte!(src, b'\n', EndCr, "LF after trailer"),
            EndCr => match try_next_byte!(src) {
                b'\r' => Poll::Ready(Ok(EndLf)),
                _ => Poll::Ready(Ok(Trailer)),
            },
            EndLf => expect_byte!(src, b'\n', End, "LF after last chunk"),
            End => Poll::Ready(Ok(End)),
        }
    }

    fn read_size(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b + 10 - b'a',
            b'A'..=b'F' => b + 10 - b'A',
            _ if self.digits == 0 => {
                return Poll::Ready(Err(ParseError::invalid_chunk_size(format!("expected hex digit, found 0x{b:02x}"))));
            }
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' => return Poll::Ready(Ok(Extension)),
            b'\r' => return Poll::Ready(Ok(SizeLf)),
            _ => return Poll::Ready(Err(ParseError::invalid_chunk_size(format!("unexpected byte 0x{b:02x} in size")))),
        };

        self.digits += 1;
        self.remaining = match self.remaining.checked_mul(16).and_then(|size| size.checked_add(digit as u64)) {
            Some(size) => size,
            None => return Poll::Ready(Err(ParseError::invalid_chunk_size("chunk size overflows u64"))),
        };
        Poll::Ready(Ok(Size))
    }

    fn read_body(&mut self, src: &mut BytesMut, chunk: &mut Option<Bytes>) -> ChunkedState {
        let len = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(src.len());
        self.remaining -= len as u64;
        *chunk = Some(src.split_to(len).freeze());

        if self.remaining > 0 { Body } else { BodyCr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<(Vec<u8>, BytesMut), ParseError> {
        let mut buffer = BytesMut::from(input);
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        loop {
            match decoder.decode(&mut buffer)? {
                Some(PayloadItem::Chunk(bytes)) => body.extend_from_slice(&bytes),
                Some(PayloadItem::Eof) => return Ok((body, buffer)),
                None => panic!("decoder wants more input"),
            }
        }
    }

    #[test]
    fn wikipedia() {
        let (body, rest) = decode_all(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"Wikipedia");
        assert!(rest.is_empty());
    }

    #[test]
    fn chunks_in_order() {
        let (body, _) = decode_all(b"10\r\n1234567890abcdef\r\n5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n").unwrap();
        assert_eq!(body, b"1234567890abcdefhello, world");
    }

    #[test]
    fn extensions_and_trailers_ignored() {
        let (body, rest) = decode_all(b"5;chunk-ext=value\r\nhello\r\n0\r\nTrailer: value\r\n\r\nNEXT").unwrap();
        assert_eq!(body, b"hello");
        assert_eq!(&rest[..], b"NEXT");
    }

    #[test]
    fn resumes_across_reads() {
        let mut buffer = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = ChunkedDecoder::new();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"hel"));
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"lo\r\n0\r");
        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::from_static(b"lo"));
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"\n\r\n");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn invalid_size_lines() {
        for input in [&b"xyz\r\n"[..], b"\r\n", b";ext\r\n", b"5 6\r\n", b"fffffffffffffffff\r\n"] {
            let err = decode_all(input).unwrap_err();
            assert!(matches!(err, ParseError::InvalidChunkSize { .. }), "{input:?}: {err}");
        }
    }

    #[test]
    fn missing_crlf_after_data() {
        let mut buffer = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = ChunkedDecoder::new();

        decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(matches!(decoder.decode(&mut buffer), Err(ParseError::InvalidLine { .. })));
    }

    #[test]
    fn eof_mid_body() {
        let mut buffer = BytesMut::from(&b"a\r\nabc"[..]);
        let mut decoder = ChunkedDecoder::new();

        decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(matches!(decoder.decode_eof(&mut buffer), Err(ParseError::IncompleteBody { remaining: 7 })));
    }

    #[test]
    fn large_chunk() {
        let size = 1024 * 1024;
        let mut data = format!("{size:x}\r\n").into_bytes();
        data.extend(vec![b'A'; size]);
        data.extend(b"\r\n0\r\n\r\n");

        let (body, _) = decode_all(&data).unwrap();
        assert_eq!(body.len(), size);
        assert!(body.iter().all(|&b| b == b'A'));
    }
}
