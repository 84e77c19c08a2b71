//! Listening sockets driven by the [`Reactor`].
//!
//! [`Acceptor::add_server`] binds a non-blocking listener and registers an
//! "acceptable" continuation. Every time it fires, all pending connections are
//! accepted and handed to the server's [`ConnectionHandler`], then the continuation
//! registers itself again.
//!
//! Handlers run on a reactor thread. They must either finish quickly or hand the
//! connection over (to a task runtime or a bounded [`WorkerPool`](crate::WorkerPool))
//! so the thread can get back to accepting.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::error::ReactorError;
use crate::reactor::{Channel, Interest, Reactor};

/// Receives every connection accepted by an [`Acceptor`] server.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle_connection(&self, connection: Connection);
}

impl<F> ConnectionHandler for F
where
    F: Fn(Connection) + Send + Sync + 'static,
{
    fn handle_connection(&self, connection: Connection) {
        self(connection);
    }
}

pub struct Acceptor {
    reactor: Reactor,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor").field("reactor", &self.reactor).field("workers", &self.workers.lock().len()).finish()
    }
}

impl Acceptor {
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_reactor(Reactor::new()?))
    }

    pub fn with_reactor(reactor: Reactor) -> Self {
        Self { reactor, workers: Mutex::new(Vec::new()) }
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Binds `endpoint` and starts accepting on it.
    ///
    /// Port 0 binds an ephemeral port; the address actually bound is returned.
    pub fn add_server(&self, endpoint: SocketAddr, backlog: i32, handler: Arc<dyn ConnectionHandler>) -> io::Result<SocketAddr> {
        let listener = bind_listener(endpoint, backlog)?;
        let bound = listener.local_addr()?;
        let channel = self.reactor.attach(listener)?;

        register_accept(&self.reactor, channel, handler).map_err(io::Error::other)?;
        info!(address = %bound, backlog, "listening");
        Ok(bound)
    }

    /// Spawns `threads` threads running the reactor loop.
    pub fn start(&self, threads: usize) -> io::Result<()> {
        let mut workers = self.workers.lock();
        for index in 0..threads {
            let reactor = self.reactor.clone();
            let handle = thread::Builder::new().name(format!("sockkit-reactor-{index}")).spawn(move || {
                if let Err(e) = reactor.run() {
                    error!(cause = %e, "reactor loop terminated");
                }
            })?;
            workers.push(handle);
        }
        debug!(threads, "reactor threads started");
        Ok(())
    }

    pub fn stop(&self) {
        self.reactor.stop();
    }

    /// Waits for the threads spawned by [`Acceptor::start`] to return.
    pub fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }
}

fn bind_listener(endpoint: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(endpoint), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&endpoint.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn register_accept(reactor: &Reactor, listener: Channel<TcpListener>, handler: Arc<dyn ConnectionHandler>) -> Result<(), ReactorError> {
    let registered = listener.clone();
    reactor.register(&registered, Interest::Acceptable, move |reactor| {
        accept_pending(reactor, &listener, handler.as_ref());
        register_accept(reactor, listener, handler).map_err(io::Error::other)
    })
}

fn accept_pending(reactor: &Reactor, listener: &Channel<TcpListener>, handler: &dyn ConnectionHandler) {
    loop {
        let (stream, remote_addr) = match listener.source().accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                return;
            }
        };

        let connection = match Connection::accepted(stream, remote_addr, reactor.clone()) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(remote = %remote_addr, cause = %e, "failed to set up accepted connection");
                continue;
            }
        };

        debug!(remote = %remote_addr, "accepted connection");
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle_connection(connection))).is_err() {
            error!(remote = %remote_addr, "connection handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn accepts_and_forwards_connections() {
        let acceptor = Acceptor::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let handler = move |connection: Connection| {
            let remote = connection.remote_addr();
            let mut stream = connection.into_blocking().unwrap();
            stream.write_all(b"hello").unwrap();
            tx.lock().send(remote).unwrap();
        };

        let bound = acceptor.add_server("127.0.0.1:0".parse().unwrap(), 16, Arc::new(handler)).unwrap();
        assert_ne!(bound.port(), 0);
        acceptor.start(2).unwrap();

        for _ in 0..3 {
            let mut client = TcpStream::connect(bound).unwrap();
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 5];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");

            let remote = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(remote, client.local_addr().unwrap());
        }

        acceptor.stop();
        acceptor.join();
    }

    #[test]
    fn panicking_handler_keeps_listener_alive() {
        let acceptor = Acceptor::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let handler = move |connection: Connection| {
            tx.lock().send(connection.remote_addr()).unwrap();
            panic!("handler failure");
        };
        let bound = acceptor.add_server("127.0.0.1:0".parse().unwrap(), 16, Arc::new(handler)).unwrap();
        acceptor.start(1).unwrap();

        let _first = TcpStream::connect(bound).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let _second = TcpStream::connect(bound).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        acceptor.stop();
        acceptor.join();
    }
}
