//! Status line and response helpers.

use bytes::{BufMut, BytesMut};
use http::{StatusCode, Version};

use crate::protocol::message::{BodyFraming, HttpMessage, StartLine, parse_version, version_str};
use crate::protocol::{Body, Headers, ParseError};

/// `HTTP-version SP status-code SP reason-phrase`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: Version,
    status: StatusCode,
    reason: String,
}

impl StatusLine {
    /// An HTTP/1.1 status line with the canonical reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Self { version: Version::HTTP_11, status, reason: status.canonical_reason().unwrap_or_default().to_owned() }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl StartLine for StatusLine {
    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.splitn(3, ' ');
        let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
            return Err(ParseError::invalid_start_line(line));
        };

        let version = parse_version(version).ok_or_else(|| ParseError::invalid_start_line(line))?;
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::invalid_start_line(line));
        }
        let status = StatusCode::from_bytes(code.as_bytes()).map_err(|_| ParseError::invalid_start_line(line))?;
        let reason = parts.next().unwrap_or_default().to_owned();

        Ok(Self { version, status, reason })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(version_str(self.version).as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.reason.as_bytes());
        dst.put_slice(b"\r\n");
    }

    fn version(&self) -> Version {
        self.version
    }

    fn forbids_body(&self) -> bool {
        self.status.is_informational() || self.status == StatusCode::NO_CONTENT || self.status == StatusCode::NOT_MODIFIED
    }

    fn implicit_framing(&self) -> BodyFraming {
        if self.forbids_body() { BodyFraming::NoBody } else { BodyFraming::UntilClose }
    }
}

pub type Response = HttpMessage<StatusLine>;

impl Response {
    pub fn with_status(status: StatusCode) -> Self {
        Self::new(StatusLine::new(status), Headers::new(), Body::empty())
    }

    pub fn status(&self) -> StatusCode {
        self.line().status
    }

    pub fn is_provisional(&self) -> bool {
        self.status().is_informational()
    }

    /// Adds a header, builder style.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers_mut().append(name, value);
        self
    }

    /// Replaces the body, builder style.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.set_body(body.into());
        self
    }

    /// A plain text response used for errors raised by the server itself.
    pub fn error(status: StatusCode) -> Self {
        let text = status.canonical_reason().unwrap_or("Error");
        Self::with_status(status).with_header("Content-Type", "text/plain; charset=utf-8").with_body(format!("{text}\r\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_line() {
        let line = StatusLine::parse("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(line.status(), StatusCode::NOT_FOUND);
        assert_eq!(line.reason(), "Not Found");

        let line = StatusLine::parse("HTTP/1.0 200").unwrap();
        assert_eq!(line.version(), Version::HTTP_10);
        assert_eq!(line.reason(), "");

        let line = StatusLine::parse("HTTP/1.1 599 Custom Reason Phrase").unwrap();
        assert_eq!(line.status().as_u16(), 599);
        assert_eq!(line.reason(), "Custom Reason Phrase");
    }

    #[test]
    fn reject_malformed_status_line() {
        for line in ["HTTP/1.1", "HTTP/1.1 20 OK", "HTTP/1.1 2000 OK", "HTTP/1.1 2x0 OK", "HTTP/3 200 OK"] {
            assert!(matches!(StatusLine::parse(line), Err(ParseError::InvalidStartLine { .. })), "{line:?}");
        }
    }

    #[test]
    fn bodyless_statuses() {
        assert_eq!(StatusLine::new(StatusCode::CONTINUE).implicit_framing(), BodyFraming::NoBody);
        assert_eq!(StatusLine::new(StatusCode::NO_CONTENT).implicit_framing(), BodyFraming::NoBody);
        assert_eq!(StatusLine::new(StatusCode::NOT_MODIFIED).implicit_framing(), BodyFraming::NoBody);
        assert_eq!(StatusLine::new(StatusCode::OK).implicit_framing(), BodyFraming::UntilClose);
    }

    #[test]
    fn encode_status_line() {
        let mut dst = BytesMut::new();
        StatusLine::new(StatusCode::OK).encode(&mut dst);
        assert_eq!(&dst[..], b"HTTP/1.1 200 OK\r\n");
    }
}
