//! Message head codecs: start line, header block, framing headers.

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_encoder::HeaderEncoder;

pub(crate) use header_decoder::{MAX_HEADER_BYTES, parse_head};
pub(crate) use header_encoder::{encode_head, set_framing_headers};
