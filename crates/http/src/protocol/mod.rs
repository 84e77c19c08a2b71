//! HTTP/1.x message model.
//!
//! - [`HttpMessage`] with the [`Request`] and [`Response`] aliases: start line,
//!   ordered [`Headers`] and a consume-once [`Body`].
//! - [`BodyFraming`]: how a body is delimited on the wire.
//! - [`Message`] and [`PayloadItem`]: the pieces a message is split into while it
//!   travels through the codecs.
//! - Error types for parsing, sending, body access and handlers.

mod message;
pub use message::BodyFraming;
pub use message::HttpMessage;
pub use message::Message;
pub use message::PayloadItem;
pub use message::StartLine;

mod headers;
pub use headers::Headers;

mod request;
pub use request::Request;
pub use request::RequestLine;
pub(crate) use request::expects_continue;

mod response;
pub use response::Response;
pub use response::StatusLine;

mod error;
pub use error::BodyError;
pub use error::HandlerError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;

mod body;
pub use body::Body;
