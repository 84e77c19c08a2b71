use bytes::{BufMut, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::MessageHead;
use crate::protocol::{BodyFraming, Headers, SendError, StartLine};

const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Writes a start line, the headers and the blank line.
///
/// The framing headers are brought in line with the head's [`BodyFraming`]:
/// `Content-Length` for a known length, `Transfer-Encoding: chunked` for chunked
/// bodies. Other headers are written exactly as given, folded values included.
#[derive(Debug, Default)]
pub struct HeaderEncoder;

impl<L: StartLine> Encoder<MessageHead<L>> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: MessageHead<L>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let MessageHead { line, mut headers, framing } = item;
        set_framing_headers(&mut headers, framing);
        encode_head(&line, &headers, dst);
        Ok(())
    }
}

pub(crate) fn set_framing_headers(headers: &mut Headers, framing: BodyFraming) {
    match framing {
        BodyFraming::Length(n) => headers.set("Content-Length", n.to_string()),
        BodyFraming::Chunked if !headers.has_token("transfer-encoding", "chunked") => {
            headers.append("Transfer-Encoding", "chunked");
        }
        _ => {}
    }
}

pub(crate) fn encode_head<L: StartLine>(line: &L, headers: &Headers, dst: &mut BytesMut) {
    dst.reserve(INIT_HEADER_SIZE);
    line.encode(dst);
    for (name, value) in headers {
        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}
