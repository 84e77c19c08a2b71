//! Transparent `Content-Encoding` removal.

use std::io::{self, Read};

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use tracing::debug;

use crate::codec::framing;
use crate::protocol::{Headers, ParseError};

/// The content coding of a received body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    /// `gzip` and `x-gzip`
    Gzip,
    /// `deflate`, which is the zlib format
    Deflate,
}

impl ContentCoding {
    /// Reads `Content-Encoding`. Stacked or unknown codings are rejected.
    pub fn from_headers(headers: &Headers) -> Result<Self, ParseError> {
        let mut coding = ContentCoding::Identity;
        for name in framing::content_codings(headers) {
            let next = match name.to_ascii_lowercase().as_str() {
                "identity" => continue,
                "gzip" | "x-gzip" => ContentCoding::Gzip,
                "deflate" => ContentCoding::Deflate,
                _ => return Err(ParseError::unsupported_content_encoding(name)),
            };
            if coding != ContentCoding::Identity {
                return Err(ParseError::unsupported_content_encoding(name));
            }
            coding = next;
        }
        Ok(coding)
    }

    pub fn is_identity(&self) -> bool {
        *self == ContentCoding::Identity
    }

    /// Decodes a complete body.
    pub fn decode(&self, body: Bytes) -> Result<Bytes, ParseError> {
        if self.is_identity() {
            return Ok(body);
        }

        let mut decoded = Vec::with_capacity(body.len() * 2);
        self.reader(io::Cursor::new(body)).read_to_end(&mut decoded)?;
        Ok(Bytes::from(decoded))
    }

    /// Wraps a body stream in a decompression filter.
    pub fn reader<R: Read + Send + 'static>(&self, inner: R) -> Box<dyn Read + Send> {
        match self {
            ContentCoding::Identity => Box::new(inner),
            ContentCoding::Gzip => Box::new(GzDecoder::new(inner)),
            ContentCoding::Deflate => Box::new(ZlibDecoder::new(inner)),
        }
    }

    /// Removes `Content-Encoding` once the body has been decoded.
    ///
    /// `decoded_len` replaces a present `Content-Length`; without it the header is
    /// dropped since the decoded length is not known up front.
    pub fn strip(&self, headers: &mut Headers, decoded_len: Option<u64>) {
        headers.remove("content-encoding");
        if self.is_identity() || !headers.contains("content-length") {
            return;
        }

        match decoded_len {
            Some(len) => headers.set("Content-Length", len.to_string()),
            None => {
                headers.remove("content-length");
            }
        }
        debug!(coding = ?self, decoded_len, "removed content encoding");
    }
}
