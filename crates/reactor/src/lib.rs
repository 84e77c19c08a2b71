//! Readiness reactor and acceptor for socket servers.
//!
//! This crate is the I/O foundation of sockkit:
//!
//! - [`Reactor`]: an edge-triggered `mio` poller with a table of one-shot
//!   continuations per `(channel, interest)`. Several threads may drive it.
//! - [`Acceptor`]: binds listening sockets on a reactor and hands every accepted
//!   [`Connection`] to a [`ConnectionHandler`].
//! - [`Stoppable`]: the per-connection cancellation handle.
//! - [`WorkerPool`]: a bounded pool for connections served by blocking code.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write;
//! use std::sync::Arc;
//! use sockkit_reactor::{Acceptor, Connection};
//!
//! let acceptor = Acceptor::new()?;
//! let address = acceptor.add_server(
//!     "127.0.0.1:0".parse().unwrap(),
//!     128,
//!     Arc::new(|connection: Connection| {
//!         if let Ok(mut stream) = connection.into_blocking() {
//!             let _ = stream.write_all(b"bye\n");
//!         }
//!     }),
//! )?;
//! println!("listening on {address}");
//! acceptor.start(1)?;
//! acceptor.join();
//! # Ok::<(), std::io::Error>(())
//! ```

mod acceptor;
mod connection;
mod error;
mod pool;
mod reactor;

pub use acceptor::{Acceptor, ConnectionHandler};
pub use connection::{Connection, Stoppable};
pub use error::{ReactorError, RejectedError};
pub use pool::{PoolConfig, WorkerPool};
pub use reactor::{Channel, Continuation, Interest, Reactor, Selectable};
