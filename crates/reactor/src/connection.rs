//! Per-connection context handed from the [`Acceptor`](crate::Acceptor) to a
//! [`ConnectionHandler`](crate::ConnectionHandler).

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::reactor::{Channel, Reactor};

static NEXT_STOPPABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Cancellation handle for one connection.
///
/// Stopping is idempotent. Clones share the same state and id.
#[derive(Clone)]
pub struct Stoppable {
    inner: Arc<StoppableInner>,
}

struct StoppableInner {
    id: u64,
    stopped: AtomicBool,
    action: Box<dyn Fn() + Send + Sync>,
}

impl Stoppable {
    /// A handle that shuts `stream` down in both directions when stopped.
    pub fn for_stream(stream: TcpStream) -> Self {
        Self::from_fn(move || match stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => debug!(cause = %e, "failed to shut down stopped connection"),
        })
    }

    /// A handle that runs `action` the first time it is stopped.
    pub fn from_fn<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = NEXT_STOPPABLE_ID.fetch_add(1, Ordering::Relaxed);
        Self { inner: Arc::new(StoppableInner { id, stopped: AtomicBool::new(false), action: Box::new(action) }) }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(id = self.inner.id, "stopping connection");
        (self.inner.action)();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Stoppable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stoppable").field("id", &self.inner.id).field("stopped", &self.is_stopped()).finish()
    }
}

/// An accepted connection: the socket, both addresses, the reactor that accepted it
/// and the handle that cancels it.
///
/// The socket is non-blocking as accepted. Thread-per-connection consumers use
/// [`Connection::into_blocking`], reactor consumers use [`Connection::into_channel`].
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    reactor: Reactor,
    stoppable: Stoppable,
}

impl Connection {
    pub fn new(stream: TcpStream, reactor: Reactor) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let stoppable = Stoppable::for_stream(stream.try_clone()?);
        Ok(Self { stream, local_addr, remote_addr, reactor, stoppable })
    }

    pub(crate) fn accepted(stream: mio::net::TcpStream, remote_addr: SocketAddr, reactor: Reactor) -> io::Result<Self> {
        let stream = TcpStream::from(stream);
        let local_addr = stream.local_addr()?;
        let stoppable = Stoppable::for_stream(stream.try_clone()?);
        Ok(Self { stream, local_addr, remote_addr, reactor, stoppable })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn stoppable(&self) -> &Stoppable {
        &self.stoppable
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Gives up the context and returns the socket, still non-blocking.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Returns the socket switched to blocking mode.
    pub fn into_blocking(self) -> io::Result<TcpStream> {
        self.stream.set_nonblocking(false)?;
        Ok(self.stream)
    }

    /// Splits off the socket and the cancellation handle.
    pub fn into_parts(self) -> (TcpStream, Stoppable) {
        (self.stream, self.stoppable)
    }

    /// Attaches the socket to the connection's reactor for continuation-driven I/O.
    pub fn into_channel(self) -> io::Result<Channel<mio::net::TcpStream>> {
        self.stream.set_nonblocking(true)?;
        self.reactor.attach(mio::net::TcpStream::from_std(self.stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_runs_action_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let stoppable = Stoppable::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clone = stoppable.clone();
        stoppable.stop();
        clone.stop();

        assert!(clone.is_stopped());
        assert_eq!(clone.id(), stoppable.id());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ids_are_unique() {
        let a = Stoppable::from_fn(|| {});
        let b = Stoppable::from_fn(|| {});
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn stopping_shuts_the_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let connection = Connection::new(server, Reactor::new().unwrap()).unwrap();
        assert_eq!(connection.remote_addr(), client.local_addr().unwrap());
        connection.stoppable().stop();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
