//! Body framing codecs.
//!
//! [`PayloadDecoder`] and [`PayloadEncoder`] wrap one strategy each, chosen from
//! the message's [`BodyFraming`](crate::protocol::BodyFraming):
//!
//! - `Content-Length`: [`LengthDecoder`] / [`LengthEncoder`]
//! - `Transfer-Encoding: chunked`: [`ChunkedDecoder`] / [`ChunkedEncoder`]
//! - until the connection closes: [`CloseDecoder`] / raw passthrough

mod chunked_decoder;
mod chunked_encoder;
mod close_decoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use chunked_decoder::ChunkedDecoder;
pub use chunked_encoder::ChunkedEncoder;
pub use close_decoder::CloseDecoder;
pub use length_decoder::LengthDecoder;
pub use length_encoder::LengthEncoder;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
