//! Server wiring: an [`Acceptor`] feeding accepted connections to a driver.
//!
//! ```no_run
//! use http::StatusCode;
//! use sockkit_http::handler::make_handler;
//! use sockkit_http::protocol::{HandlerError, Response};
//! use sockkit_http::server::HttpServer;
//!
//! let server = HttpServer::builder()
//!     .address("127.0.0.1:8080")
//!     .handler(make_handler(|_request| Ok::<_, HandlerError>(Some(Response::with_status(StatusCode::OK).with_body("hi")))))
//!     .blocking()
//!     .build()
//!     .unwrap();
//!
//! let address = server.start().unwrap();
//! println!("listening on {address}");
//! server.join();
//! ```

use std::env;
use std::fmt;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use sockkit_reactor::{Acceptor, Connection, ConnectionHandler, PoolConfig, WorkerPool};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::io::{InspectReader, InspectWriter};
use tracing::{Instrument, error, info, info_span, warn};

use crate::blocking::{TraceReader, TraceWriter, log_bytes};
use crate::connection::{BlockingConnection, ConnectionTracker, HttpConnection};
use crate::handler::{HandlerChain, RequestHandler};

/// Environment variable holding the default listen address.
pub const LISTEN_ENV: &str = "SOCKKIT_LISTEN";

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: Option<SocketAddr>,
    pub backlog: i32,
    pub reactor_threads: usize,
    /// Worker pool of blocking mode.
    pub pool: PoolConfig,
    pub unstreaming: bool,
    /// Logs every byte read and written.
    pub verbose: bool,
    pub read_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: None,
            backlog: 128,
            reactor_threads: 1,
            pool: PoolConfig::default(),
            unstreaming: true,
            verbose: false,
            read_buffer: 8 * 1024,
        }
    }
}

impl ServerConfig {
    /// Defaults, listening on `SOCKKIT_LISTEN` or `127.0.0.1:8080`.
    pub fn from_env() -> Result<Self, ServerBuildError> {
        let address = env::var(LISTEN_ENV).unwrap_or_else(|_| DEFAULT_LISTEN.to_owned());
        Ok(Self { address: Some(resolve(&address)?), ..Self::default() })
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("address must be set")]
    MissingAddress,
    #[error("at least one handler must be set")]
    MissingHandler,
    #[error("invalid address {address}: {source}")]
    InvalidAddress { address: String, source: io::Error },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

fn resolve<A: ToSocketAddrs + ToString>(address: A) -> Result<SocketAddr, ServerBuildError> {
    let invalid = |source| ServerBuildError::InvalidAddress { address: address.to_string(), source };
    address
        .to_socket_addrs()
        .map_err(invalid)?
        .next()
        .ok_or_else(|| invalid(io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")))
}

/// Where accepted connections run.
#[derive(Debug, Clone)]
pub enum Mode {
    /// One tokio task per connection.
    Async(Handle),
    /// One pool job per connection; a rejected job closes the connection.
    Blocking(WorkerPool),
}

/// Hands every accepted connection to a driver running the handler chain.
#[derive(Debug)]
pub struct HttpConnectionHandler {
    mode: Mode,
    chain: Arc<HandlerChain>,
    tracker: Arc<ConnectionTracker>,
    unstreaming: bool,
    verbose: bool,
    read_buffer: usize,
}

impl HttpConnectionHandler {
    pub fn new(mode: Mode, chain: Arc<HandlerChain>) -> Self {
        let config = ServerConfig::default();
        Self {
            mode,
            tracker: Arc::new(ConnectionTracker::new(Arc::clone(&chain))),
            chain,
            unstreaming: config.unstreaming,
            verbose: config.verbose,
            read_buffer: config.read_buffer,
        }
    }

    fn configured(mut self, config: &ServerConfig) -> Self {
        self.unstreaming = config.unstreaming;
        self.verbose = config.verbose;
        self.read_buffer = config.read_buffer;
        self
    }

    pub fn chain(&self) -> &Arc<HandlerChain> {
        &self.chain
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    fn spawn_async(&self, handle: &Handle, connection: Connection) {
        let remote = connection.remote_addr();
        let (stream, stoppable) = connection.into_parts();
        let tracked = self.tracker.track(stoppable);
        let chain = Arc::clone(&self.chain);
        let (unstreaming, verbose, read_buffer) = (self.unstreaming, self.verbose, self.read_buffer);

        let task = async move {
            let _tracked = tracked;
            let stream = match tokio::net::TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(cause = %e, "can't register connection with the runtime");
                    return;
                }
            };

            let (reader, writer) = stream.into_split();
            let result = if verbose {
                let reader = InspectReader::new(reader, |bytes: &[u8]| log_bytes("connection", "read", bytes));
                let writer = InspectWriter::new(writer, |bytes: &[u8]| log_bytes("connection", "write", bytes));
                HttpConnection::with_capacity(reader, writer, read_buffer).unstreaming(unstreaming).process(&chain).await
            } else {
                HttpConnection::with_capacity(reader, writer, read_buffer).unstreaming(unstreaming).process(&chain).await
            };

            match result {
                Ok(_) => info!("finished process, connection shutdown"),
                Err(e) => error!(cause = %e, "service has error, connection shutdown"),
            }
        };
        handle.spawn(task.instrument(info_span!("connection", %remote)));
    }

    fn submit_blocking(&self, pool: &WorkerPool, connection: Connection) {
        let remote = connection.remote_addr();
        let stoppable = connection.stoppable().clone();
        let stream = match connection.into_blocking() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%remote, cause = %e, "can't switch connection to blocking mode");
                return;
            }
        };

        let tracked = self.tracker.track(stoppable);
        let chain = Arc::clone(&self.chain);
        let (unstreaming, verbose, read_buffer) = (self.unstreaming, self.verbose, self.read_buffer);

        let job = move || {
            let _tracked = tracked;
            let _span = info_span!("connection", %remote).entered();
            match serve_blocking(stream, &chain, unstreaming, verbose, read_buffer) {
                Ok(_) => info!("finished process, connection shutdown"),
                Err(e) => error!(cause = %e, "service has error, connection shutdown"),
            }
        };

        if let Err(e) = pool.execute(job) {
            warn!(%remote, cause = %e, "connection rejected");
        }
    }
}

fn serve_blocking(
    stream: TcpStream,
    chain: &HandlerChain,
    unstreaming: bool,
    verbose: bool,
    read_buffer: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let reader = BufReader::with_capacity(read_buffer, stream.try_clone()?);
    if verbose {
        let reader = TraceReader::new(reader, "connection");
        let writer = TraceWriter::new(stream, "connection");
        BlockingConnection::new(reader, writer).unstreaming(unstreaming).process(chain)?;
    } else {
        BlockingConnection::new(reader, stream).unstreaming(unstreaming).process(chain)?;
    }
    Ok(())
}

impl ConnectionHandler for HttpConnectionHandler {
    fn handle_connection(&self, connection: Connection) {
        match &self.mode {
            Mode::Async(handle) => self.spawn_async(handle, connection),
            Mode::Blocking(pool) => self.submit_blocking(pool, connection),
        }
    }
}

pub struct ServerBuilder {
    config: ServerConfig,
    address: Option<Result<SocketAddr, ServerBuildError>>,
    handlers: Vec<Arc<dyn RequestHandler>>,
    runtime: Option<Handle>,
    blocking: bool,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("address", &self.address)
            .field("handlers", &self.handlers.len())
            .field("runtime", &self.runtime)
            .field("blocking", &self.blocking)
            .finish()
    }
}

impl ServerBuilder {
    fn new() -> Self {
        Self { config: ServerConfig::default(), address: None, handlers: Vec::new(), runtime: None, blocking: false }
    }

    pub fn address<A: ToSocketAddrs + ToString>(mut self, address: A) -> Self {
        self.address = Some(resolve(address));
        self
    }

    /// Appends a handler to the chain.
    pub fn handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Serves connections as tasks on `handle`.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self.blocking = false;
        self
    }

    /// Serves connections on the worker pool described by the config.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Replaces the config; an address set through [`ServerBuilder::address`] still wins.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Without an explicit mode, connections run on the current tokio runtime if
    /// there is one and on a worker pool otherwise.
    pub fn build(self) -> Result<HttpServer, ServerBuildError> {
        let mut config = self.config;
        if let Some(address) = self.address {
            config.address = Some(address?);
        }
        let address = config.address.ok_or(ServerBuildError::MissingAddress)?;
        if self.handlers.is_empty() {
            return Err(ServerBuildError::MissingHandler);
        }

        let mode = match (self.blocking, self.runtime) {
            (false, Some(handle)) => Mode::Async(handle),
            (false, None) => match Handle::try_current() {
                Ok(handle) => Mode::Async(handle),
                Err(_) => Mode::Blocking(WorkerPool::new(config.pool.clone())),
            },
            (true, _) => Mode::Blocking(WorkerPool::new(config.pool.clone())),
        };

        let chain = Arc::new(HandlerChain::new());
        chain.replace(self.handlers);
        let handler = Arc::new(HttpConnectionHandler::new(mode, chain).configured(&config));

        Ok(HttpServer { acceptor: Acceptor::new()?, address, config, handler, local_addr: Mutex::new(None) })
    }
}

/// An HTTP server on its own reactor.
#[derive(Debug)]
pub struct HttpServer {
    acceptor: Acceptor,
    address: SocketAddr,
    config: ServerConfig,
    handler: Arc<HttpConnectionHandler>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the listener and starts the reactor threads; returns the bound address.
    pub fn start(&self) -> io::Result<SocketAddr> {
        let handler: Arc<dyn ConnectionHandler> = Arc::clone(&self.handler) as Arc<dyn ConnectionHandler>;
        let bound = self.acceptor.add_server(self.address, self.config.backlog, handler)?;
        self.acceptor.start(self.config.reactor_threads)?;
        *self.local_addr.lock() = Some(bound);
        info!(address = %bound, threads = self.config.reactor_threads, "server started");
        Ok(bound)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<HandlerChain> {
        self.handler.chain()
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        self.handler.connections()
    }

    /// Stops accepting, stops every live connection and shuts the worker pool down.
    pub fn stop(&self) {
        self.acceptor.stop();
        self.handler.connections().stop();
        if let Mode::Blocking(pool) = self.handler.mode() {
            pool.shutdown();
        }
        info!("server stopped");
    }

    /// Waits for the reactor threads to finish.
    pub fn join(&self) {
        self.acceptor.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::make_handler;
    use crate::protocol::{Request, Response};
    use http::StatusCode;
    use std::convert::Infallible;

    fn ok() -> impl RequestHandler {
        make_handler(|_: &mut Request| Ok::<_, Infallible>(Some(Response::with_status(StatusCode::OK))))
    }

    #[test]
    fn build_requires_address_and_handler() {
        assert!(matches!(HttpServer::builder().handler(ok()).build(), Err(ServerBuildError::MissingAddress)));
        assert!(matches!(HttpServer::builder().address("127.0.0.1:0").build(), Err(ServerBuildError::MissingHandler)));
        assert!(matches!(
            HttpServer::builder().address("not an address").handler(ok()).build(),
            Err(ServerBuildError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn builder_debug_counts_handlers() {
        let builder = HttpServer::builder().address("127.0.0.1:0").handler(ok()).handler(ok()).blocking();
        let debug = format!("{builder:?}");
        assert!(debug.starts_with("ServerBuilder {"), "{debug}");
        assert!(debug.contains("handlers: 2"), "{debug}");
        assert!(debug.contains("blocking: true"), "{debug}");
    }

    #[test]
    fn mode_follows_builder() {
        let server = HttpServer::builder().address("127.0.0.1:0").handler(ok()).handler(ok()).build().unwrap();
        assert!(matches!(server.handler.mode(), Mode::Blocking(_)));
        assert_eq!(server.chain().len(), 2);
        assert_eq!(server.config().backlog, 128);

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let server = HttpServer::builder().address("127.0.0.1:0").handler(ok()).runtime(runtime.handle().clone()).build().unwrap();
        assert!(matches!(server.handler.mode(), Mode::Async(_)));
    }
}
