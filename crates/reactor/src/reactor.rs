//! Readiness reactor built on `mio`.
//!
//! The reactor keeps a table of `(channel, interest) -> continuation` registrations.
//! [`Reactor::run`] waits for readiness and, for every ready registration, removes it
//! and invokes the continuation exactly once on the calling thread. A continuation
//! that wants further notifications registers itself again.
//!
//! # Readiness cache
//!
//! Channels are registered with `mio` edge-triggered, for both directions.
//! Readiness that arrives while no continuation is registered for that direction is
//! remembered in the channel's slot, and the next registration for that direction is
//! queued for dispatch instead of waiting for an edge that already happened.
//! A registration that has to wait re-arms the channel with the poller, which then
//! reports readiness that is still current, such as bytes a previous continuation
//! left unread.
//! Continuations must therefore tolerate spurious readiness: an I/O call returning
//! `WouldBlock` simply means "register again".
//!
//! # Threads
//!
//! Any number of threads may call [`Reactor::run`] on clones of the same reactor.
//! One of them waits on the poller at a time; dispatch happens after the poller lock
//! is released, so continuations of different channels run in parallel while a
//! single `(channel, interest)` registration is never dispatched twice.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use mio::event::{Event, Source};
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::ReactorError;

const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

const BOTH: mio::Interest = mio::Interest::READABLE.add(mio::Interest::WRITABLE);

/// The readiness a continuation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// A listening socket has a pending connection.
    Acceptable,
    /// The channel has bytes (or end of input) to read.
    Readable,
    /// The channel can accept more output.
    Writable,
}

impl Interest {
    fn is_read_side(self) -> bool {
        !matches!(self, Interest::Writable)
    }
}

/// What to do when a channel becomes ready.
///
/// Returning an error closes the channel the continuation was registered on.
pub type Continuation = Box<dyn FnOnce(&Reactor) -> io::Result<()> + Send + 'static>;

/// An I/O source that can be attached to a [`Reactor`].
pub trait Selectable: Source + AsRawFd + Send + Sync + 'static {
    /// Shuts the underlying socket down so pending and future I/O fails.
    fn shutdown(&self) -> io::Result<()>;
}

impl Selectable for mio::net::TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

impl Selectable for mio::net::TcpListener {
    fn shutdown(&self) -> io::Result<()> {
        // a listener can't be shut down, dropping its registrations is enough
        Ok(())
    }
}

/// A shared readiness multiplexer.
///
/// Cloning is cheap; every clone drives the same poller and registration table.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    table: DashMap<Token, Mutex<Slot>>,
    ready_queue: Mutex<VecDeque<Fired>>,
    next_token: AtomicUsize,
    stopped: AtomicBool,
}

type Fired = (Token, Interest, Continuation);

#[derive(Default)]
struct Slot {
    acceptable: Option<Continuation>,
    readable: Option<Continuation>,
    writable: Option<Continuation>,
    read_ready: bool,
    write_ready: bool,
    channel: Option<Weak<dyn Close>>,
}

impl Slot {
    fn continuation_mut(&mut self, interest: Interest) -> &mut Option<Continuation> {
        match interest {
            Interest::Acceptable => &mut self.acceptable,
            Interest::Readable => &mut self.readable,
            Interest::Writable => &mut self.writable,
        }
    }

    /// Stores `continuation`, returning the one it replaced and, when readiness for
    /// its direction was already observed, the continuation itself to dispatch.
    fn store(&mut self, interest: Interest, continuation: Continuation) -> (Option<Continuation>, Option<Continuation>) {
        let cached = if interest.is_read_side() { &mut self.read_ready } else { &mut self.write_ready };
        if *cached {
            *cached = false;
            let replaced = self.continuation_mut(interest).take();
            return (replaced, Some(continuation));
        }

        (self.continuation_mut(interest).replace(continuation), None)
    }

    fn pending(&self) -> usize {
        [self.acceptable.is_some(), self.readable.is_some(), self.writable.is_some()].into_iter().filter(|b| *b).count()
    }
}

trait Close: Send + Sync {
    fn close(&self);
}

/// A handle to an I/O source attached to a [`Reactor`].
///
/// Clones refer to the same attachment. When the last clone is dropped the source is
/// deregistered and its pending registrations are discarded.
pub struct Channel<S: Selectable> {
    inner: Arc<ChannelInner<S>>,
}

struct ChannelInner<S: Selectable> {
    token: Token,
    source: S,
    closed: AtomicBool,
    reactor: Weak<Shared>,
}

impl<S: Selectable> Close for ChannelInner<S> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        match self.source.shutdown() {
            Ok(()) => trace!(token = self.token.0, "channel closed"),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => debug!(token = self.token.0, cause = %e, "shutdown failed while closing channel"),
        }
    }
}

impl<S: Selectable> Drop for ChannelInner<S> {
    fn drop(&mut self) {
        let Some(shared) = self.reactor.upgrade() else {
            return;
        };

        if let Err(e) = shared.registry.deregister(&mut self.source) {
            trace!(token = self.token.0, cause = %e, "deregister failed");
        }
        // the slot is removed before it is dropped, so no table guard is held here
        let slot = shared.table.remove(&self.token);
        drop(slot);
    }
}

impl<S: Selectable> Channel<S> {
    pub fn token(&self) -> usize {
        self.inner.token.0
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl<S: Selectable> Clone for Channel<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Selectable> fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("token", &self.inner.token.0).field("closed", &self.is_closed()).finish()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("channels", &self.shared.table.len())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            shared: Arc::new(Shared {
                poll: Mutex::new(poll),
                registry,
                waker,
                table: DashMap::new(),
                ready_queue: Mutex::new(VecDeque::new()),
                next_token: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Attaches `source` to this reactor.
    ///
    /// The source is registered with the poller once, for both directions; interest
    /// in a particular readiness is expressed afterwards with [`Reactor::register`].
    pub fn attach<S: Selectable>(&self, mut source: S) -> io::Result<Channel<S>> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));

        // the slot must exist before the first event for this token can arrive
        self.shared.table.insert(token, Mutex::new(Slot::default()));
        if let Err(e) = self.shared.registry.register(&mut source, token, BOTH) {
            self.shared.table.remove(&token);
            return Err(e);
        }

        let inner = Arc::new(ChannelInner { token, source, closed: AtomicBool::new(false), reactor: Arc::downgrade(&self.shared) });
        let close: Arc<dyn Close> = Arc::clone(&inner) as Arc<dyn Close>;
        if let Some(slot) = self.shared.table.get(&token) {
            slot.lock().channel = Some(Arc::downgrade(&close));
        }

        trace!(token = token.0, "channel attached");
        Ok(Channel { inner })
    }

    /// Records `continuation` to run once `channel` is ready for `interest`.
    ///
    /// No I/O is performed here. Registering again for the same `(channel, interest)`
    /// replaces the previous continuation, which is dropped without running.
    pub fn register<S, F>(&self, channel: &Channel<S>, interest: Interest, continuation: F) -> Result<(), ReactorError>
    where
        S: Selectable,
        F: FnOnce(&Reactor) -> io::Result<()> + Send + 'static,
    {
        let token = channel.inner.token;
        if channel.is_closed() {
            return Err(ReactorError::closed(token.0));
        }

        let continuation: Continuation = Box::new(continuation);
        let (replaced, fire) = match self.shared.table.get(&token) {
            Some(slot) => slot.lock().store(interest, continuation),
            None => return Err(ReactorError::closed(token.0)),
        };
        // dropped outside the table guard, it may own the last handle to a channel
        drop(replaced);

        match fire {
            Some(continuation) => {
                trace!(token = token.0, ?interest, "readiness already observed, queueing continuation");
                self.shared.ready_queue.lock().push_back((token, interest, continuation));
                self.wake();
            }
            None => {
                let fd = channel.inner.source.as_raw_fd();
                if let Err(e) = self.shared.registry.reregister(&mut SourceFd(&fd), token, BOTH) {
                    debug!(token = token.0, cause = %e, "re-arming channel failed");
                }
            }
        }

        Ok(())
    }

    /// Shuts `channel` down and discards its pending continuations.
    pub fn close<S: Selectable>(&self, channel: &Channel<S>) {
        channel.inner.close();
        self.close_token(channel.inner.token);
    }

    /// Number of continuations waiting for readiness or queued for dispatch.
    pub fn registrations(&self) -> usize {
        let waiting: usize = self.shared.table.iter().map(|slot| slot.lock().pending()).sum();
        waiting + self.shared.ready_queue.lock().len()
    }

    /// Dispatches ready continuations on the calling thread until [`Reactor::stop`] is called.
    pub fn run(&self) -> Result<(), ReactorError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut fired: Vec<Fired> = Vec::new();

        debug!("reactor loop started");
        loop {
            if self.is_stopped() {
                debug!("reactor loop stopped");
                return Ok(());
            }

            fired.extend(self.shared.ready_queue.lock().drain(..));

            if fired.is_empty() {
                let mut poll = self.shared.poll.lock();
                if self.is_stopped() {
                    continue;
                }
                // a registration may have been served from the readiness cache while we
                // waited for the poller
                if !self.shared.ready_queue.lock().is_empty() {
                    continue;
                }

                match poll.poll(&mut events, None) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(cause = %e, "readiness poll failed");
                        return Err(ReactorError::poll(e));
                    }
                }
                drop(poll);

                for event in &events {
                    if event.token() != WAKER_TOKEN {
                        self.collect(event, &mut fired);
                    }
                }
            }

            for (token, interest, continuation) in fired.drain(..) {
                self.dispatch(token, interest, continuation);
            }
        }
    }

    /// Makes every thread blocked in [`Reactor::run`] return. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            debug!("stopping reactor");
        }
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(cause = %e, "failed to wake reactor");
        }
    }

    fn collect(&self, event: &Event, fired: &mut Vec<Fired>) {
        let token = event.token();
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let writable = event.is_writable() || event.is_write_closed() || event.is_error();

        let Some(entry) = self.shared.table.get(&token) else {
            trace!(token = token.0, "event for detached channel");
            return;
        };
        let mut slot = entry.lock();

        if readable {
            let before = fired.len();
            if let Some(continuation) = slot.acceptable.take() {
                fired.push((token, Interest::Acceptable, continuation));
            }
            if let Some(continuation) = slot.readable.take() {
                fired.push((token, Interest::Readable, continuation));
            }
            slot.read_ready = fired.len() == before;
        }

        if writable {
            match slot.writable.take() {
                Some(continuation) => {
                    fired.push((token, Interest::Writable, continuation));
                    slot.write_ready = false;
                }
                None => slot.write_ready = true,
            }
        }
    }

    fn dispatch(&self, token: Token, interest: Interest, continuation: Continuation) {
        trace!(token = token.0, ?interest, "dispatching continuation");
        match panic::catch_unwind(AssertUnwindSafe(|| continuation(self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(token = token.0, ?interest, cause = %e, "continuation failed, closing channel");
                self.close_token(token);
            }
            Err(_) => {
                error!(token = token.0, ?interest, "continuation panicked, closing channel");
                self.close_token(token);
            }
        }
    }

    fn close_token(&self, token: Token) {
        let Some((_, slot)) = self.shared.table.remove(&token) else {
            return;
        };
        let slot = slot.into_inner();

        if let Some(channel) = slot.channel.as_ref().and_then(Weak::upgrade) {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn connected_pair() -> (std::net::TcpStream, mio::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, mio::net::TcpStream::from_std(server))
    }

    fn spawn_run(reactor: &Reactor) -> thread::JoinHandle<Result<(), ReactorError>> {
        let reactor = reactor.clone();
        thread::spawn(move || reactor.run())
    }

    type Received = mpsc::Sender<(usize, u8)>;

    /// Reads one byte per dispatch and registers again, counting dispatches that
    /// overlap another one of the same channel.
    fn read_bytewise(
        reactor: &Reactor,
        channel: Channel<mio::net::TcpStream>,
        id: usize,
        busy: Arc<AtomicBool>,
        overlaps: Arc<AtomicUsize>,
        tx: Received,
    ) -> Result<(), ReactorError> {
        let handle = channel.clone();
        reactor.register(&channel, Interest::Readable, move |reactor| {
            if busy.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let mut byte = [0u8; 1];
            let read = (&*handle.source()).read(&mut byte);
            thread::sleep(Duration::from_millis(1));
            busy.store(false, Ordering::SeqCst);

            match read {
                Ok(0) => return Ok(()),
                Ok(_) => tx.send((id, byte[0])).unwrap(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            read_bytewise(reactor, handle, id, busy, overlaps, tx).map_err(io::Error::other)
        })
    }

    #[test]
    fn partial_reads_are_dispatched_again() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        let channel = reactor.attach(server).unwrap();
        let runner = spawn_run(&reactor);

        let (tx, rx) = mpsc::channel();
        let overlaps = Arc::new(AtomicUsize::new(0));
        read_bytewise(&reactor, channel, 0, Arc::new(AtomicBool::new(false)), Arc::clone(&overlaps), tx).unwrap();

        client.write_all(b"abc").unwrap();
        let received: Vec<u8> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().1).collect();
        assert_eq!(received, b"abc");

        reactor.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn channels_are_served_in_parallel_without_overlap() {
        const CHANNELS: usize = 4;
        const PAYLOAD: &[u8] = b"0123456789";

        let reactor = Reactor::new().unwrap();
        let runners: Vec<_> = (0..4).map(|_| spawn_run(&reactor)).collect();

        let (tx, rx) = mpsc::channel();
        let overlaps = Arc::new(AtomicUsize::new(0));
        let mut clients = Vec::new();
        for id in 0..CHANNELS {
            let (client, server) = connected_pair();
            let channel = reactor.attach(server).unwrap();
            read_bytewise(&reactor, channel, id, Arc::new(AtomicBool::new(false)), Arc::clone(&overlaps), tx.clone())
                .unwrap();
            clients.push(client);
        }
        for client in &mut clients {
            client.write_all(PAYLOAD).unwrap();
        }

        let mut received = vec![Vec::new(); CHANNELS];
        for _ in 0..CHANNELS * PAYLOAD.len() {
            let (id, byte) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            received[id].push(byte);
        }
        for bytes in received {
            assert_eq!(bytes, PAYLOAD);
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);

        reactor.stop();
        for runner in runners {
            runner.join().unwrap().unwrap();
        }
    }

    #[test]
    fn fires_once_per_registration() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        let channel = reactor.attach(server).unwrap();
        let runner = spawn_run(&reactor);

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        let register = |tx: mpsc::Sender<usize>| {
            let calls = Arc::clone(&calls);
            let channel_ref = channel.clone();
            reactor
                .register(&channel, Interest::Readable, move |_| {
                    let mut buf = [0u8; 16];
                    let n = match (&*channel_ref.source()).read(&mut buf) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                        Err(e) => return Err(e),
                    };
                    calls.fetch_add(1, Ordering::SeqCst);
                    tx.send(n).unwrap();
                    Ok(())
                })
                .unwrap();
        };

        register(tx.clone());
        client.write_all(b"ping").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
        assert_eq!(reactor.registrations(), 0);

        // readiness without a registration must not invoke anything
        client.write_all(b"more").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // registering again picks up the readiness observed in between
        register(tx);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        reactor.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn register_replaces_previous_continuation() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        let channel = reactor.attach(server).unwrap();

        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        reactor
            .register(&channel, Interest::Readable, move |_| {
                first.send("first").unwrap();
                Ok(())
            })
            .unwrap();
        reactor
            .register(&channel, Interest::Readable, move |reactor| {
                tx.send("second").unwrap();
                reactor.stop();
                Ok(())
            })
            .unwrap();
        assert_eq!(reactor.registrations(), 1);

        client.write_all(b"x").unwrap();
        reactor.run().unwrap();

        assert_eq!(rx.try_recv().unwrap(), "second");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failing_continuation_closes_channel() {
        let reactor = Reactor::new().unwrap();
        let (mut client, server) = connected_pair();
        let channel = reactor.attach(server).unwrap();
        let runner = spawn_run(&reactor);

        let (tx, rx) = mpsc::channel();
        reactor
            .register(&channel, Interest::Readable, move |_| {
                tx.send(()).unwrap();
                Err(io::Error::other("boom"))
            })
            .unwrap();

        client.write_all(b"x").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // the loop survives and the channel is gone
        for _ in 0..50 {
            if channel.is_closed() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(channel.is_closed());
        assert!(matches!(reactor.register(&channel, Interest::Readable, |_| Ok(())), Err(ReactorError::Closed { .. })));

        let mut buf = [0u8; 1];
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        reactor.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn stop_wakes_every_runner() {
        let reactor = Reactor::new().unwrap();
        let runners: Vec<_> = (0..3).map(|_| spawn_run(&reactor)).collect();

        thread::sleep(Duration::from_millis(50));
        reactor.stop();
        reactor.stop();

        for runner in runners {
            runner.join().unwrap().unwrap();
        }
        assert!(reactor.is_stopped());
    }

    #[test]
    fn dropping_channel_discards_registrations() {
        let reactor = Reactor::new().unwrap();
        let (_client, server) = connected_pair();
        let channel = reactor.attach(server).unwrap();

        reactor.register(&channel, Interest::Writable, |_| Ok(())).unwrap();
        drop(channel);

        assert_eq!(reactor.registrations(), 0);
    }
}
