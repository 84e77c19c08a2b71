//! Blocking message framing over `std::io`.
//!
//! The same framing rules as the [`codec`](crate::codec) module, for
//! thread-per-connection use: [`MessageReader`] hands out messages whose bodies
//! stream straight from the connection, [`MessageWriter`] serializes messages
//! and picks a framing for bodies that do not declare one.

mod reader;
mod trace;
mod writer;

pub use reader::MessageReader;
pub(crate) use trace::log_bytes;
pub use trace::{TraceReader, TraceWriter};
pub use writer::{MessageWriter, UNSTREAM_LIMIT};
