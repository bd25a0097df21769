//! Backend contract
//!
//! A [`RemoteConnectionManager`] is a named upstream strategy created once at startup. It
//! hands out [`RemoteConnection`]s, each owning at most one or two live upstream transports,
//! and takes them back into a bounded idle pool when a session is done with them.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::transport::Transport;
use crate::error::Result;
use crate::models::{Event, SessionConnection};

/// One upstream connection slot, exclusively owned by one in-flight request
#[async_trait]
pub trait RemoteConnection: Send {
    /// Dial (or reuse) the upstream and serve one unit of work.
    ///
    /// For plain sessions that is one request/response cycle, for tunnel sessions the whole
    /// tunnel lifetime. Session end is reported through `session.state`; an `Err` means the
    /// session cannot continue.
    async fn request(
        &mut self,
        session: &mut SessionConnection,
        event: &Event,
    ) -> Result<Option<Event>>;

    /// Drop every held transport. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Name of the manager this connection belongs to
    fn connection_manager(&self) -> &str;

    /// Whether any upstream transport is currently held
    fn is_connected(&self) -> bool;
}

/// A named strategy that creates and recycles [`RemoteConnection`]s
pub trait RemoteConnectionManager: Send + Sync {
    fn name(&self) -> &str;

    /// Configuration argument the manager was built from (dial target, host, ...)
    fn arg(&self) -> &str;

    /// Pop an idle connection or allocate a fresh one. The result is always closed.
    fn get_remote_connection(&self, event: &Event) -> Result<Box<dyn RemoteConnection>>;

    /// Offer a connection back to the idle pool, dropping it if the pool is full
    fn recycle_remote_connection(&self, conn: Box<dyn RemoteConnection>);
}

/// Bounded queue of idle connections. Never blocks on push or pop.
pub struct IdlePool<T> {
    slots: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> IdlePool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.slots.lock().pop_front()
    }

    /// Returns `false` when the pool was full and `item` got dropped
    pub fn push(&self, item: T) -> bool {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity {
            return false;
        }
        slots.push_back(item);
        true
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The dial side of a backend connection, as seen by the write-with-resync helper
#[async_trait]
pub(crate) trait UpstreamDial: Send {
    /// Make sure a transport toward `host` is held, reusing the cached one when it matches
    async fn dial_or_reuse(&mut self, host: &str);

    /// Transport plain requests are written to, if one is held
    fn transport_mut(&mut self) -> Option<&mut Transport>;

    /// Whether requests go out in absolute form to a chained proxy
    fn proxy_form(&self) -> bool;

    /// Forget the transport plain requests go through
    fn drop_transport(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded_and_fifo() {
        let pool = IdlePool::new(2);
        assert!(pool.is_empty());
        assert!(pool.push(1));
        assert!(pool.push(2));
        assert!(!pool.push(3));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);

        assert_eq!(pool.pop(), Some(1));
        assert_eq!(pool.pop(), Some(2));
        assert_eq!(pool.pop(), None);
    }

    #[test]
    fn zero_capacity_pool_drops_everything() {
        let pool = IdlePool::new(0);
        assert!(!pool.push("conn"));
        assert!(pool.pop().is_none());
    }
}
