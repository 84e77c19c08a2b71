//! Selection of a message's [`BodyFraming`] from its start line and headers.

use crate::protocol::{BodyFraming, Headers, ParseError, SendError, StartLine};

/// Framing of a message read from a peer.
///
/// `Content-Length` wins over `Transfer-Encoding`. The `identity` transfer coding
/// is ignored, `chunked` alone is supported, anything else is rejected.
pub(crate) fn incoming<L: StartLine>(line: &L, headers: &Headers) -> Result<BodyFraming, ParseError> {
    if line.forbids_body() {
        return Ok(BodyFraming::NoBody);
    }

    if let Some(length) = content_length(headers).map_err(ParseError::invalid_content_length)? {
        return Ok(BodyFraming::Length(length));
    }

    let mut chunked = false;
    for coding in codings(headers, "transfer-encoding") {
        match coding {
            c if c.eq_ignore_ascii_case("identity") => {}
            c if c.eq_ignore_ascii_case("chunked") && !chunked => chunked = true,
            c => return Err(ParseError::unsupported_transfer_encoding(c)),
        }
    }

    Ok(if chunked { BodyFraming::Chunked } else { line.implicit_framing() })
}

/// Framing of a message about to be written.
///
/// `known_len` is the body length when it is known without reading the body.
/// Returns `None` when the headers do not decide and the body is a stream of unknown
/// length; the writer then picks a framing itself. `Content-Length` is added when
/// the length is known and no other framing was requested.
pub(crate) fn outgoing<L: StartLine>(
    line: &L,
    headers: &mut Headers,
    known_len: Option<u64>,
) -> Result<Option<BodyFraming>, SendError> {
    if line.forbids_body() {
        return Ok(Some(BodyFraming::NoBody));
    }

    if let Some(length) = content_length(headers).map_err(SendError::invalid_body)? {
        if let Some(known) = known_len.filter(|known| *known != length) {
            return Err(SendError::invalid_body(format!("Content-Length is {length} but the body has {known} bytes")));
        }
        return Ok(Some(BodyFraming::Length(length)));
    }

    if headers.contains("transfer-encoding") {
        if headers.has_token("transfer-encoding", "chunked") {
            return Ok(Some(BodyFraming::Chunked));
        }
        return Err(SendError::invalid_body("only chunked transfer-encoding can be written"));
    }

    match known_len {
        Some(0) if line.implicit_framing() == BodyFraming::NoBody => Ok(Some(BodyFraming::NoBody)),
        Some(length) => {
            headers.set("Content-Length", length.to_string());
            Ok(Some(BodyFraming::Length(length)))
        }
        None => Ok(None),
    }
}

/// The value of `Content-Length`; repeated headers or list values must all agree.
fn content_length(headers: &Headers) -> Result<Option<u64>, String> {
    let mut length = None;
    for value in headers.get_all("content-length").flat_map(|value| value.split(',')) {
        let value = value.trim();
        let parsed = match value.parse::<u64>() {
            Ok(n) if value.bytes().all(|b| b.is_ascii_digit()) => n,
            _ => return Err(format!("{value:?} is not a length")),
        };
        match length {
            Some(previous) if previous != parsed => return Err(format!("conflicting lengths {previous} and {parsed}")),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

fn codings<'a>(headers: &'a Headers, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers.get_all(name).flat_map(|value| value.split(',')).map(str::trim).filter(|coding| !coding.is_empty())
}

pub(crate) fn content_codings<'a>(headers: &'a Headers) -> impl Iterator<Item = &'a str> + 'a {
    codings(headers, "content-encoding")
}
