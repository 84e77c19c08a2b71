use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use sockkit_reactor::Stoppable;
use tracing::{debug, info};

use crate::handler::HandlerChain;

/// The set of live connections served by one handler chain.
///
/// When the last tracked connection ends the chain's handlers are closed.
pub struct ConnectionTracker {
    live: Mutex<HashMap<u64, Stoppable>>,
    chain: Arc<HandlerChain>,
}

impl ConnectionTracker {
    pub fn new(chain: Arc<HandlerChain>) -> Self {
        Self { live: Mutex::new(HashMap::new()), chain }
    }

    /// Tracks a connection until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, stoppable: Stoppable) -> Tracked {
        let id = stoppable.id();
        let live = {
            let mut connections = self.live.lock();
            connections.insert(id, stoppable);
            connections.len()
        };
        debug!(id, live, "connection tracked");
        Tracked { tracker: Arc::clone(self), id }
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every tracked connection.
    pub fn stop(&self) {
        let connections: Vec<Stoppable> = self.live.lock().values().cloned().collect();
        info!(connections = connections.len(), "stopping live connections");
        for stoppable in connections {
            stoppable.stop();
        }
    }

    fn release(&self, id: u64) {
        let now_empty = {
            let mut connections = self.live.lock();
            connections.remove(&id).is_some() && connections.is_empty()
        };
        debug!(id, "connection released");
        if now_empty {
            self.chain.close();
        }
    }
}

impl fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTracker").field("live", &self.len()).finish()
    }
}

/// Removes its connection from the tracker when dropped, on every exit path.
#[derive(Debug)]
pub struct Tracked {
    tracker: Arc<ConnectionTracker>,
    id: u64,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.tracker.release(self.id);
    }
}
