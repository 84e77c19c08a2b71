//! Connection drivers.
//!
//! A driver owns one connection and runs its request loop: read a request,
//! dispatch it through the [`HandlerChain`](crate::handler::HandlerChain), write
//! the provisional and final responses, then decide whether the connection stays
//! open.
//!
//! - [`HttpConnection`]: async, over tokio `AsyncRead`/`AsyncWrite` halves.
//! - [`BlockingConnection`]: over `std::io` streams, one worker thread per connection.
//! - [`ConnectionTracker`]: the live connections of a server, stopped together.
//!
//! A connection is closed after the response when the request or the response
//! says `Connection: close`, when an HTTP/1.0 client did not ask for keep-alive,
//! or when the response body is delimited by closing the connection. A malformed
//! request is answered with `400 Bad Request` and closes the connection.

mod blocking_connection;
mod http_connection;
mod tracker;

pub use blocking_connection::BlockingConnection;
pub use http_connection::HttpConnection;
pub use tracker::{ConnectionTracker, Tracked};
