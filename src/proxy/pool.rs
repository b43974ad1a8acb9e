//! Bounded idle-connection pool
//!
//! One pool per upstream transport. `get` hands out an idle connection when
//! one is parked; the caller dials otherwise. `put` parks the connection or
//! drops it when the pool is full or closed (dropping a socket closes it).
//! After `close`, `get` errors and `put` drops.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::DnsProxyError;

struct PoolInner<C> {
    idle: VecDeque<C>,
    closed: bool,
}

/// Bounded pool of idle upstream connections.
pub struct ConnPool<C> {
    capacity: usize,
    inner: Mutex<PoolInner<C>>,
}

impl<C> ConnPool<C> {
    /// Pool holding at most `capacity` idle connections.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::with_capacity(capacity),
                closed: false,
            }),
        }
    }

    /// Take an idle connection, or `None` when the caller should dial.
    ///
    /// # Errors
    ///
    /// [`DnsProxyError::PoolClosed`] after [`ConnPool::close`].
    pub fn get(&self) -> Result<Option<C>, DnsProxyError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DnsProxyError::PoolClosed);
        }
        Ok(inner.idle.pop_front())
    }

    /// Return a connection to the pool; dropped when full or closed.
    pub fn put(&self, conn: C) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.idle.len() >= self.capacity {
            drop(inner);
            drop(conn);
            return;
        }
        inner.idle.push_back(conn);
    }

    /// Close the pool and drop every idle connection.
    pub fn close(&self) {
        let drained: Vec<C> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.idle.drain(..).collect()
        };
        drop(drained);
    }

    /// Number of idle connections currently parked.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Connection stand-in that counts drops.
    struct TrackedConn {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for TrackedConn {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(drops: &Arc<AtomicUsize>) -> TrackedConn {
        TrackedConn {
            drops: drops.clone(),
        }
    }

    #[test]
    fn test_get_empty_pool_returns_none() {
        let pool: ConnPool<TrackedConn> = ConnPool::new(2);
        assert!(pool.get().unwrap().is_none());
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(2);
        pool.put(tracked(&drops));
        assert_eq!(pool.idle_len(), 1);
        assert!(pool.get().unwrap().is_some());
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_put_into_full_pool_closes_conn() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(1);
        pool.put(tracked(&drops));
        pool.put(tracked(&drops));
        assert_eq!(pool.idle_len(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_drains_idle_conns() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(4);
        pool.put(tracked(&drops));
        pool.put(tracked(&drops));
        pool.close();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(pool.is_closed());
    }

    #[test]
    fn test_get_after_close_errors() {
        let pool: ConnPool<TrackedConn> = ConnPool::new(2);
        pool.close();
        assert!(matches!(pool.get(), Err(DnsProxyError::PoolClosed)));
    }

    #[test]
    fn test_put_after_close_closes_conn() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = ConnPool::new(2);
        pool.close();
        pool.put(tracked(&drops));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_len(), 0);
    }
}
