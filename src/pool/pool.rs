//! Bounded, lease-based connection pool keyed by endpoint
//!
//! Each endpoint gets at most `max_connections` concurrent connections,
//! enforced by a semaphore. Idle connections are retired once they outlive
//! the TTL and are liveness-checked before reuse; the pool grows back
//! lazily after discards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::connector::{Connection, Connector};
use crate::catalog::model::Endpoint;
use crate::error::{ShardError, ShardResult};

struct IdleConn {
    conn: Box<dyn Connection>,
    created_at: Instant,
}

struct EndpointPool {
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConn>>,
    /// Leases currently handed out; the instrumentation behind the pool
    /// bound assertions.
    in_flight: AtomicUsize,
}

impl EndpointPool {
    fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
        }
    }
}

/// A leased connection. Dropping the lease without `release` discards the
/// connection but always frees the pool slot.
pub struct PoolLease {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    endpoint_addr: String,
    entry: Arc<EndpointPool>,
    _permit: OwnedSemaphorePermit,
}

impl PoolLease {
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn
            .as_mut()
            .expect("lease used after release")
            .as_mut()
    }

    pub fn endpoint_addr(&self) -> &str {
        &self.endpoint_addr
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    max_connections: usize,
    connection_ttl: Duration,
    endpoints: DashMap<String, Arc<EndpointPool>>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        max_connections: usize,
        connection_ttl: Duration,
    ) -> Self {
        Self {
            connector,
            max_connections,
            connection_ttl,
            endpoints: DashMap::new(),
        }
    }

    fn entry(&self, addr: &str) -> Arc<EndpointPool> {
        self.endpoints
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(EndpointPool::new(self.max_connections)))
            .clone()
    }

    /// Lease a connection to `endpoint`, waiting at most `timeout` for a
    /// free slot.
    pub async fn acquire(&self, endpoint: &Endpoint, timeout: Duration) -> ShardResult<PoolLease> {
        let addr = endpoint.addr();
        let entry = self.entry(&addr);

        let permit =
            match tokio::time::timeout(timeout, entry.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(ShardError::InternalError(format!(
                        "pool for {} is closed",
                        addr
                    )))
                }
                Err(_) => {
                    // All slots taken for the whole wait
                    return Err(ShardError::PoolExhausted(addr));
                }
            };

        // Prefer an idle connection, retiring expired ones and discarding
        // any that fail the liveness check.
        loop {
            let idle = entry.idle.lock().pop_front();
            match idle {
                Some(idle_conn) => {
                    if idle_conn.created_at.elapsed() >= self.connection_ttl {
                        debug!("retiring idle connection to {} past ttl", addr);
                        continue;
                    }
                    let mut conn = idle_conn.conn;
                    if conn.ping().await.is_err() {
                        debug!("discarding dead idle connection to {}", addr);
                        continue;
                    }
                    entry.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Ok(PoolLease {
                        conn: Some(conn),
                        created_at: idle_conn.created_at,
                        endpoint_addr: addr,
                        entry,
                        _permit: permit,
                    });
                }
                None => break,
            }
        }

        // Grow lazily: open a fresh connection under the held permit
        match self.connector.connect(endpoint).await {
            Ok(conn) => {
                entry.in_flight.fetch_add(1, Ordering::SeqCst);
                Ok(PoolLease {
                    conn: Some(conn),
                    created_at: Instant::now(),
                    endpoint_addr: addr,
                    entry,
                    _permit: permit,
                })
            }
            // The permit drops here, so a failed connect never leaks a slot
            Err(e) => Err(e),
        }
    }

    /// Return a healthy connection to the idle set. Connections past the TTL
    /// are retired instead.
    pub fn release(&self, mut lease: PoolLease) {
        if let Some(conn) = lease.conn.take() {
            if lease.created_at.elapsed() < self.connection_ttl {
                lease.entry.idle.lock().push_back(IdleConn {
                    conn,
                    created_at: lease.created_at,
                });
            }
        }
        // Dropping the lease frees the slot
    }

    /// Drop a connection after an error; the pool shrinks and grows back
    /// lazily.
    pub fn discard(&self, mut lease: PoolLease) {
        lease.conn.take();
    }

    /// Leases currently handed out for `addr`.
    pub fn in_flight(&self, addr: &str) -> usize {
        self.endpoints
            .get(addr)
            .map(|e| e.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Idle connections currently parked for `addr`.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.endpoints.get(addr).map(|e| e.idle.lock().len()).unwrap_or(0)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
