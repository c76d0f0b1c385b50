//! Bounded connection pool
//!
//! Reuses a small set of handles opened by a [`Connector`]. At most `max`
//! handles exist at once (idle + lent); when all are lent, `acquire` fails
//! immediately with `PoolExhausted` rather than queueing. `acquire_within`
//! instead waits a bounded time for a handle to come back.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, SmcError};

/// Opens pooled handles and judges whether an idle one is still usable.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    fn is_healthy(&self, _conn: &Self::Conn) -> bool {
        true
    }
}

struct IdleEntry<T> {
    conn: T,
    since: Instant,
}

struct PoolState<T> {
    idle: Vec<IdleEntry<T>>,
    busy: usize,
    opened: u64,
    exhausted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolStats {
    pub max: usize,
    pub busy: usize,
    pub idle: usize,
    /// Handles opened over the pool's lifetime
    pub opened: u64,
    /// Acquires refused because every handle was lent
    pub exhausted: u64,
}

impl PoolStats {
    pub fn utilisation(&self) -> f64 {
        if self.max == 0 {
            0.0
        } else {
            self.busy as f64 / self.max as f64
        }
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    max: usize,
    state: Mutex<PoolState<C::Conn>>,
    released: Notify,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, max: usize) -> Arc<Self> {
        Arc::new(Self {
            connector,
            max: max.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                busy: 0,
                opened: 0,
                exhausted: 0,
            }),
            released: Notify::new(),
        })
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Lend a handle: the most recently returned healthy idle one, else a new
    /// one while under the bound.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<C>> {
        {
            let mut state = self.state.lock();
            while let Some(entry) = state.idle.pop() {
                if self.connector.is_healthy(&entry.conn) {
                    state.busy += 1;
                    trace!("Reusing pooled connection ({} busy)", state.busy);
                    return Ok(self.lend(entry.conn));
                }
                debug!("Dropping unhealthy pooled connection");
            }

            if state.busy >= self.max {
                state.exhausted += 1;
                return Err(SmcError::PoolExhausted { max: self.max });
            }
            // reserve the slot before connecting without the lock
            state.busy += 1;
        }

        match self.connector.connect().await {
            Ok(conn) => {
                let mut state = self.state.lock();
                state.opened += 1;
                debug!("Opened pooled connection ({} busy)", state.busy);
                drop(state);
                Ok(self.lend(conn))
            }
            Err(e) => {
                self.state.lock().busy -= 1;
                self.released.notify_one();
                Err(e)
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but when every handle is lent wait up
    /// to `wait` for one to be returned or discarded.
    pub async fn acquire_within(self: &Arc<Self>, wait: Duration) -> Result<PooledConnection<C>> {
        let deadline = Instant::now() + wait;
        loop {
            // register before trying so a release in between is not missed
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.acquire().await {
                Err(SmcError::PoolExhausted { max }) => {
                    trace!("Pool exhausted, waiting for a returned handle");
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return Err(SmcError::PoolExhausted { max });
                    }
                }
                other => return other,
            }
        }
    }

    fn lend(self: &Arc<Self>, conn: C::Conn) -> PooledConnection<C> {
        PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
        }
    }

    fn release(&self, conn: Option<C::Conn>) {
        let mut state = self.state.lock();
        state.busy = state.busy.saturating_sub(1);
        if let Some(conn) = conn {
            state.idle.push(IdleEntry {
                conn,
                since: Instant::now(),
            });
        }
        drop(state);
        self.released.notify_one();
    }

    /// Close idle handles, keeping the `keep` most recently used.
    /// Returns the number closed.
    pub fn close_idle(&self, keep: usize) -> usize {
        let mut state = self.state.lock();
        if state.idle.len() <= keep {
            return 0;
        }
        state.idle.sort_by_key(|e| e.since);
        let excess = state.idle.len() - keep;
        state.idle.drain(..excess);
        debug!("Closed {} idle pooled connections", excess);
        excess
    }

    /// Drop every idle handle; lent handles are dropped when returned.
    pub fn clear(&self) {
        self.state.lock().idle.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max: self.max,
            busy: state.busy,
            idle: state.idle.len(),
            opened: state.opened,
            exhausted: state.exhausted,
        }
    }
}

/// Read-only view of a pool for the optimizer, independent of the connector.
pub trait PoolMetrics: Send + Sync {
    fn stats(&self) -> PoolStats;
    fn close_idle(&self, keep: usize) -> usize;
}

impl<C: Connector> PoolMetrics for ConnectionPool<C> {
    fn stats(&self) -> PoolStats {
        ConnectionPool::stats(self)
    }

    fn close_idle(&self, keep: usize) -> usize {
        ConnectionPool::close_idle(self, keep)
    }
}

/// A lent handle. Returns to the pool on drop.
pub struct PooledConnection<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    conn: Option<C::Conn>,
}

impl<C: Connector> PooledConnection<C> {
    /// Close the handle instead of returning it, e.g. after an I/O error.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        // Only `discard` (which consumes self) and `drop` take the handle.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        self.pool.release(self.conn.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        opened: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Connector for Counting {
        type Conn = usize;

        async fn connect(&self) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SmcError::ConnectionFailed("refused".into()));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn is_healthy(&self, conn: &usize) -> bool {
            // odd ids go stale
            conn % 2 == 0
        }
    }

    #[tokio::test]
    async fn test_fourth_acquire_is_exhausted() {
        let pool = ConnectionPool::new(Counting::default(), 3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, SmcError::PoolExhausted { max: 3 }));

        let stats = pool.stats();
        assert_eq!(stats.busy, 3);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.utilisation(), 1.0);
        drop((a, b, c));
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_returned_handle_is_reused() {
        let pool = ConnectionPool::new(Counting::default(), 3);
        let first = pool.acquire().await.unwrap();
        assert_eq!(*first, 0);
        drop(first);

        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, 0);
        assert_eq!(pool.stats().opened, 1);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_is_replaced() {
        let pool = ConnectionPool::new(Counting::default(), 3);
        let zero = pool.acquire().await.unwrap();
        let one = pool.acquire().await.unwrap();
        drop(zero);
        drop(one);

        // id 1 is on top of the idle stack but stale
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_discard_frees_slot() {
        let pool = ConnectionPool::new(Counting::default(), 1);
        let conn = pool.acquire().await.unwrap();
        conn.discard();
        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.idle, 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_connect_releases_reservation() {
        let pool = ConnectionPool::new(Counting::default(), 1);
        pool.connector().fail.store(true, Ordering::SeqCst);
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.stats().busy, 0);

        pool.connector().fail.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_gets_returned_handle() {
        let pool = ConnectionPool::new(Counting::default(), 1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_within(Duration::from_secs(5)).await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
        assert_eq!(pool.stats().opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_gives_up_at_deadline() {
        let pool = ConnectionPool::new(Counting::default(), 1);
        let _held = pool.acquire().await.unwrap();

        let started = Instant::now();
        let err = pool.acquire_within(Duration::from_millis(250)).await.err().unwrap();
        assert!(matches!(err, SmcError::PoolExhausted { max: 1 }));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_close_idle_keeps_reserve() {
        let pool = ConnectionPool::new(Counting::default(), 3);
        let held: Vec<_> = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        drop(held);
        assert_eq!(pool.close_idle(1), 2);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.close_idle(1), 0);
    }
}
