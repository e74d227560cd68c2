//! Bounded connection pools.
//!
//! [`SharedPool`] hands out [`BlockingConnection`]s to threads and blocks on
//! a condition variable when `maxconn` connections are out. [`CooperativePool`]
//! hands out async [`Connection`]s and parks waiting tasks on a `Notify`.
//!
//! Both keep `idle` and `in_use` disjoint, never exceed `maxconn` connections
//! in total, and open `minconn` idle connections on `open`.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tracing::{debug, info};

use crate::blocking::BlockingConnection;
use crate::client::Client;
use crate::connection::Connection;
use crate::error::{PoolError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A connection checked out of a pool. Give it back with the pool's `put`.
#[derive(Debug)]
pub struct Pooled<C> {
    pool_id: u64,
    conn_id: u64,
    conn: C,
}

impl<C> Pooled<C> {
    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

#[derive(Debug)]
struct PoolState<C> {
    idle: Vec<(u64, C)>,
    in_use: HashSet<u64>,
    opening: usize,
    next_conn_id: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            in_use: HashSet::new(),
            opening: 0,
            next_conn_id: 1,
            closed: true,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.opening
    }

    fn new_id(&mut self) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }
}

/// What a `get` attempt decided under the lock.
enum Checkout<C> {
    Ready(u64, C),
    Open,
    Full,
}

fn checkout<C>(state: &mut PoolState<C>, maxconn: usize) -> Result<Checkout<C>> {
    if state.closed {
        return Err(PoolError::Closed.into());
    }
    if let Some((id, conn)) = state.idle.pop() {
        state.in_use.insert(id);
        return Ok(Checkout::Ready(id, conn));
    }
    if state.total() < maxconn {
        state.opening += 1;
        return Ok(Checkout::Open);
    }
    Ok(Checkout::Full)
}

fn check_sizes(minconn: usize, maxconn: usize) -> Result<()> {
    if maxconn == 0 || minconn > maxconn {
        return Err(PoolError::InvalidSize { minconn, maxconn }.into());
    }
    Ok(())
}

/// Thread-safe pool of blocking connections.
#[derive(Debug)]
pub struct SharedPool {
    id: u64,
    client: Client,
    minconn: usize,
    maxconn: usize,
    state: Mutex<PoolState<BlockingConnection>>,
    available: Condvar,
}

impl SharedPool {
    pub fn new(client: &Client, minconn: usize, maxconn: usize) -> Result<Self> {
        check_sizes(minconn, maxconn)?;
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            client: client.clone(),
            minconn,
            maxconn,
            state: Mutex::new(PoolState::new()),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<BlockingConnection>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn minconn(&self) -> usize {
        self.minconn
    }

    pub fn maxconn(&self) -> usize {
        self.maxconn
    }

    /// Top the pool up to `minconn` connections and start serving. Opening
    /// an open pool only replaces connections that were discarded.
    pub fn open(&self) -> Result<()> {
        let missing = {
            let mut state = self.lock();
            let missing = self.minconn.saturating_sub(state.total());
            state.opening += missing;
            missing
        };
        let mut opened = Vec::with_capacity(missing);
        let mut failure = None;
        for _ in 0..missing {
            match self.client.connect_blocking(None) {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let mut state = self.lock();
        state.opening -= missing;
        if let Some(err) = failure {
            drop(state);
            self.available.notify_all();
            return Err(err);
        }
        for conn in opened {
            let id = state.new_id();
            state.idle.push((id, conn));
        }
        state.closed = false;
        info!("Opened pool for {} with {} connections (max {})", self.client.url(), state.total(), self.maxconn);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.lock().in_use.len()
    }

    /// Check out a connection, waiting up to `timeout` (forever with `None`)
    /// while `maxconn` connections are in use.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Pooled<BlockingConnection>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        loop {
            match checkout(&mut state, self.maxconn)? {
                Checkout::Ready(conn_id, conn) => {
                    return Ok(Pooled {
                        pool_id: self.id,
                        conn_id,
                        conn,
                    })
                }
                Checkout::Open => {
                    drop(state);
                    return self.open_one();
                }
                Checkout::Full => {}
            }
            state = match deadline {
                None => self.available.wait(state).unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(PoolError::Empty.into());
                    }
                    self.available
                        .wait_timeout(state, left)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    /// Non-blocking `get`: fails with `Empty` when `maxconn` is reached.
    pub fn try_get(&self) -> Result<Pooled<BlockingConnection>> {
        self.get(Some(Duration::ZERO))
    }

    fn open_one(&self) -> Result<Pooled<BlockingConnection>> {
        let opened = self.client.connect_blocking(None);
        let mut state = self.lock();
        state.opening -= 1;
        match opened {
            Ok(conn) if !state.closed => {
                let conn_id = state.new_id();
                state.in_use.insert(conn_id);
                debug!("Pool opened connection #{}", conn_id);
                Ok(Pooled {
                    pool_id: self.id,
                    conn_id,
                    conn,
                })
            }
            Ok(_) => Err(PoolError::Closed.into()),
            Err(err) => {
                self.available.notify_one();
                Err(err)
            }
        }
    }

    /// Return a connection. A closed connection is discarded so the next
    /// `get` opens a fresh one.
    pub fn put(&self, conn: Pooled<BlockingConnection>) -> Result<()> {
        let mut state = self.lock();
        if conn.pool_id != self.id || !state.in_use.remove(&conn.conn_id) {
            return Err(PoolError::Foreign.into());
        }
        let closed = state.closed;
        if !closed && !conn.is_closed() {
            state.idle.push((conn.conn_id, conn.conn));
        } else {
            debug!("Pool discarding connection #{}", conn.conn_id);
        }
        drop(state);
        self.available.notify_one();
        if closed {
            return Err(PoolError::Closed.into());
        }
        Ok(())
    }

    /// Scoped checkout: the connection goes back when the guard drops.
    pub fn spawn(&self, timeout: Option<Duration>) -> Result<PoolGuard<'_>> {
        let conn = self.get(timeout)?;
        Ok(PoolGuard {
            pool: self,
            conn: Some(conn),
        })
    }

    /// Close idle connections and refuse further use. Connections still
    /// checked out are closed when they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.available.notify_all();
        for (_, mut conn) in idle {
            conn.close();
        }
        info!("Closed pool for {}", self.client.url());
    }
}

/// Connection borrowed through [`SharedPool::spawn`].
#[derive(Debug)]
pub struct PoolGuard<'a> {
    pool: &'a SharedPool,
    conn: Option<Pooled<BlockingConnection>>,
}

impl Deref for PoolGuard<'_> {
    type Target = BlockingConnection;

    fn deref(&self) -> &BlockingConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl DerefMut for PoolGuard<'_> {
    fn deref_mut(&mut self) -> &mut BlockingConnection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = self.pool.put(conn) {
                debug!("Returning pooled connection failed: {}", err);
            }
        }
    }
}

/// Pool of async connections for tasks on one runtime.
#[derive(Debug)]
pub struct CooperativePool {
    id: u64,
    client: Client,
    minconn: usize,
    maxconn: usize,
    state: AsyncMutex<PoolState<Connection>>,
    available: Notify,
    returns_tx: mpsc::UnboundedSender<Pooled<Connection>>,
    returns_rx: AsyncMutex<mpsc::UnboundedReceiver<Pooled<Connection>>>,
}

impl CooperativePool {
    pub fn new(client: &Client, minconn: usize, maxconn: usize) -> Result<Self> {
        check_sizes(minconn, maxconn)?;
        let (returns_tx, returns_rx) = mpsc::unbounded_channel();
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            client: client.clone(),
            minconn,
            maxconn,
            state: AsyncMutex::new(PoolState::new()),
            available: Notify::new(),
            returns_tx,
            returns_rx: AsyncMutex::new(returns_rx),
        })
    }

    pub fn minconn(&self) -> usize {
        self.minconn
    }

    pub fn maxconn(&self) -> usize {
        self.maxconn
    }

    pub async fn open(&self) -> Result<()> {
        self.drain_returns().await;
        let missing = {
            let mut state = self.state.lock().await;
            let missing = self.minconn.saturating_sub(state.total());
            state.opening += missing;
            missing
        };
        let mut opened = Vec::with_capacity(missing);
        let mut failure = None;
        for _ in 0..missing {
            match self.client.connect(None).await {
                Ok(conn) => opened.push(conn),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        let mut state = self.state.lock().await;
        state.opening -= missing;
        if let Some(err) = failure {
            drop(state);
            self.available.notify_waiters();
            for mut conn in opened {
                conn.close().await;
            }
            return Err(err);
        }
        for conn in opened {
            let id = state.new_id();
            state.idle.push((id, conn));
        }
        state.closed = false;
        info!("Opened pool for {} with {} connections (max {})", self.client.url(), state.total(), self.maxconn);
        Ok(())
    }

    /// Take back connections released by dropped guards.
    async fn drain_returns(&self) {
        let mut returned = Vec::new();
        {
            let mut rx = self.returns_rx.lock().await;
            while let Ok(conn) = rx.try_recv() {
                returned.push(conn);
            }
        }
        for conn in returned {
            if let Err(err) = self.put(conn).await {
                debug!("Returning pooled connection failed: {}", err);
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn idle_count(&self) -> usize {
        self.drain_returns().await;
        self.state.lock().await.idle.len()
    }

    pub async fn in_use_count(&self) -> usize {
        self.drain_returns().await;
        self.state.lock().await.in_use.len()
    }

    pub async fn get(&self, timeout: Option<Duration>) -> Result<Pooled<Connection>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            self.drain_returns().await;
            let notified = self.available.notified();
            let decision = {
                let mut state = self.state.lock().await;
                checkout(&mut state, self.maxconn)?
            };
            match decision {
                Checkout::Ready(conn_id, conn) => {
                    return Ok(Pooled {
                        pool_id: self.id,
                        conn_id,
                        conn,
                    })
                }
                Checkout::Open => return self.open_one().await,
                Checkout::Full => {}
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Empty.into());
                    }
                }
            }
        }
    }

    pub async fn try_get(&self) -> Result<Pooled<Connection>> {
        self.get(Some(Duration::ZERO)).await
    }

    async fn open_one(&self) -> Result<Pooled<Connection>> {
        let opened = self.client.connect(None).await;
        let mut state = self.state.lock().await;
        state.opening -= 1;
        match opened {
            Ok(conn) if !state.closed => {
                let conn_id = state.new_id();
                state.in_use.insert(conn_id);
                debug!("Pool opened connection #{}", conn_id);
                Ok(Pooled {
                    pool_id: self.id,
                    conn_id,
                    conn,
                })
            }
            Ok(mut conn) => {
                drop(state);
                conn.close().await;
                Err(PoolError::Closed.into())
            }
            Err(err) => {
                self.available.notify_one();
                Err(err)
            }
        }
    }

    pub async fn put(&self, conn: Pooled<Connection>) -> Result<()> {
        let mut state = self.state.lock().await;
        if conn.pool_id != self.id || !state.in_use.remove(&conn.conn_id) {
            return Err(PoolError::Foreign.into());
        }
        let closed = state.closed;
        let Pooled { conn_id, mut conn, .. } = conn;
        if !closed && !conn.is_closed() {
            state.idle.push((conn_id, conn));
            drop(state);
            self.available.notify_one();
            return Ok(());
        }
        drop(state);
        self.available.notify_one();
        debug!("Pool discarding connection #{}", conn_id);
        if !conn.is_closed() {
            conn.close().await;
        }
        if closed {
            return Err(PoolError::Closed.into());
        }
        Ok(())
    }

    /// Scoped checkout. Dropping the guard hands the connection back without
    /// awaiting; the pool takes it on its next operation.
    pub async fn spawn(&self, timeout: Option<Duration>) -> Result<CooperativeGuard<'_>> {
        let conn = self.get(timeout).await?;
        Ok(CooperativeGuard {
            pool: self,
            conn: Some(conn),
        })
    }

    pub async fn close(&self) {
        self.drain_returns().await;
        let idle = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.available.notify_waiters();
        for (_, mut conn) in idle {
            conn.close().await;
        }
        info!("Closed pool for {}", self.client.url());
    }
}

/// Connection borrowed through [`CooperativePool::spawn`].
#[derive(Debug)]
pub struct CooperativeGuard<'a> {
    pool: &'a CooperativePool,
    conn: Option<Pooled<Connection>>,
}

impl CooperativeGuard<'_> {
    /// Give the connection back now instead of on drop.
    pub async fn release(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => self.pool.put(conn).await,
            None => Ok(()),
        }
    }
}

impl Deref for CooperativeGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl DerefMut for CooperativeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for CooperativeGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.pool.returns_tx.send(conn).is_ok() {
                self.pool.available.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LdapError;

    #[test]
    fn test_pool_sizes() {
        assert!(check_sizes(0, 1).is_ok());
        assert!(check_sizes(2, 2).is_ok());
        assert!(matches!(
            check_sizes(3, 2),
            Err(LdapError::Pool(PoolError::InvalidSize { minconn: 3, maxconn: 2 }))
        ));
        assert!(check_sizes(0, 0).is_err());
    }

    #[test]
    fn test_checkout_respects_maxconn() {
        let mut state: PoolState<&str> = PoolState::new();
        assert!(matches!(checkout(&mut state, 2), Err(LdapError::Pool(PoolError::Closed))));
        state.closed = false;
        let id = state.new_id();
        state.idle.push((id, "a"));

        assert!(matches!(checkout(&mut state, 2), Ok(Checkout::Ready(1, "a"))));
        assert!(state.idle.is_empty());
        assert!(state.in_use.contains(&1));
        assert!(matches!(checkout(&mut state, 2), Ok(Checkout::Open)));
        assert_eq!(state.total(), 2);
        assert!(matches!(checkout(&mut state, 2), Ok(Checkout::Full)));
    }

    #[test]
    fn test_new_pool_is_closed_until_opened() {
        let client = Client::new("ldap://127.0.0.1:1").unwrap();
        let pool = SharedPool::new(&client, 0, 2).unwrap();
        assert!(pool.is_closed());
        assert!(matches!(pool.try_get(), Err(LdapError::Pool(PoolError::Closed))));
        pool.open().unwrap();
        assert!(!pool.is_closed());
        assert_eq!(pool.idle_count(), 0);
        pool.close();
        assert!(pool.is_closed());
    }
}
