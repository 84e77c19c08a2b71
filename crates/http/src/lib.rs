//! HTTP/1.x framing and connection drivers for sockkit servers.
//!
//! Requests arrive through a [`sockkit_reactor::Acceptor`] and are served either
//! as tokio tasks or on a bounded worker pool. Both paths share the same message
//! model and framing rules.
//!
//! # Example
//!
//! ```no_run
//! use http::StatusCode;
//! use sockkit_http::handler::make_handler;
//! use sockkit_http::protocol::{BodyError, Request, Response};
//! use sockkit_http::server::HttpServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = HttpServer::builder()
//!         .address("127.0.0.1:8080")
//!         .handler(make_handler(|request: &mut Request| {
//!             let body = request.body_mut().text()?;
//!             Ok::<_, BodyError>(Some(Response::with_status(StatusCode::OK).with_body(format!("echo: {body}"))))
//!         }))
//!         .build()?;
//!
//!     server.start()?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`protocol`]: messages, headers, bodies and error types
//! - [`codec`]: tokio-util decoders and encoders for heads and bodies
//! - [`blocking`]: the same framing over `std::io`
//! - [`handler`]: request handlers and the handler chain
//! - [`connection`]: per-connection request loops
//! - [`server`]: acceptor wiring and configuration
//!
//! # Limitations
//!
//! - HTTP/1.x only
//! - No TLS
//! - Maximum header block size: 64 KiB
//! - Maximum number of headers: 128

pub mod blocking;
pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;
