//! Request line and request helpers.

use bytes::{BufMut, BytesMut};
use http::{Method, Version};

use crate::protocol::message::{BodyFraming, HttpMessage, StartLine, parse_version, version_str};
use crate::protocol::{Body, Headers, ParseError};

/// `method SP request-target SP HTTP-version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    target: String,
    version: Version,
}

impl RequestLine {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self { method, target: target.into(), version: Version::HTTP_11 }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The target without its query string.
    pub fn path(&self) -> &str {
        self.target.split_once('?').map_or(self.target.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, query)| query)
    }
}

impl StartLine for RequestLine {
    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(ParseError::invalid_start_line(line));
        };

        if target.is_empty() {
            return Err(ParseError::invalid_start_line(line));
        }
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::invalid_start_line(line))?;
        let version = parse_version(version).ok_or_else(|| ParseError::invalid_start_line(line))?;

        Ok(Self { method, target: target.to_owned(), version })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(self.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.target.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(version_str(self.version).as_bytes());
        dst.put_slice(b"\r\n");
    }

    fn version(&self) -> Version {
        self.version
    }

    fn forbids_body(&self) -> bool {
        false
    }

    /// A request without `Content-Length` or `Transfer-Encoding` has no body; only
    /// responses are delimited by closing the connection.
    fn implicit_framing(&self) -> BodyFraming {
        BodyFraming::NoBody
    }
}

pub type Request = HttpMessage<RequestLine>;

impl Request {
    pub fn get(target: impl Into<String>) -> Self {
        Self::new(RequestLine::new(Method::GET, target), Headers::new(), Body::empty())
    }

    pub fn method(&self) -> &Method {
        self.line().method()
    }

    pub fn target(&self) -> &str {
        self.line().target()
    }

    pub fn version(&self) -> Version {
        self.line().version
    }

    /// Whether the client is willing to send another request on this connection.
    pub fn wants_keep_alive(&self) -> bool {
        let headers = self.headers();
        if headers.has_token("connection", "close") {
            return false;
        }
        self.version() != Version::HTTP_10 || headers.has_token("connection", "keep-alive")
    }

    /// `Expect: 100-continue` was sent.
    pub fn expects_continue(&self) -> bool {
        expects_continue(self.headers())
    }
}

pub(crate) fn expects_continue(headers: &Headers) -> bool {
    headers.get("expect").is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
}
