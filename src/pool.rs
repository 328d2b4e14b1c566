//! Pool of reusable broker sender handles.
//!
//! [`ConnectionPool::rent`] hands out exclusive use of one handle wrapped in a
//! [`Rented`] guard. Dropping the guard returns the handle to the pool, so a
//! handle goes back exactly once on every exit path, including early returns
//! and panics unwinding through the caller.
//!
//! Handles are created lazily by a [`ManageConnection`] implementation. A
//! bounded pool (`max_size = Some(n)`) never has more than `n` handles live at
//! once: further renters wait until one is returned. An unbounded pool
//! creates a new handle whenever none is idle. In both cases at most
//! `max_idle` returned handles are retained; extras are dropped.

use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing_error::SpanTrace;

use crate::broker::BrokerAddress;

/// Creates sender handles for a [`ConnectionPool`].
#[async_trait::async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The pooled handle.
    type Connection: Send + 'static;
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// The broker this manager connects to.
    fn broker_address(&self) -> BrokerAddress;

    /// Open a new handle.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of live handles. `None` means unbounded.
    pub max_size: Option<NonZeroUsize>,
    /// Maximum number of idle handles kept for reuse.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            max_idle: 16,
        }
    }
}

impl PoolConfig {
    pub fn bounded(max_size: NonZeroUsize) -> Self {
        Self {
            max_size: Some(max_size),
            max_idle: max_size.get(),
        }
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// Process-wide cache of sender handles.
///
/// Cloning is cheap and yields another handle to the same pool.
pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<M::Connection>>,
    permits: Option<Arc<Semaphore>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                permits: config.max_size.map(|n| Arc::new(Semaphore::new(n.get()))),
                idle: Mutex::new(VecDeque::new()),
                config,
            }),
        }
    }

    pub fn broker_address(&self) -> BrokerAddress {
        self.inner.manager.broker_address()
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Number of handles currently waiting for reuse.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of handles that may still be rented without waiting, or `None`
    /// when the pool is unbounded.
    pub fn available(&self) -> Option<usize> {
        self.inner.permits.as_ref().map(|s| s.available_permits())
    }

    /// Take exclusive use of a handle.
    ///
    /// Reuses an idle handle when there is one, otherwise opens a new one. On a
    /// bounded pool at capacity this waits for a handle to be returned. Failure
    /// to open a handle is reported as a [`ConnectionError`]; the pool does not
    /// retry.
    #[tracing::instrument(skip(self), fields(broker = %self.inner.manager.broker_address()))]
    pub async fn rent(&self) -> Result<Rented<M>, ConnectionError> {
        let permit = match &self.inner.permits {
            Some(permits) => Some(
                Arc::clone(permits)
                    .acquire_owned()
                    .await
                    .map_err(|e| ConnectionError::new(self.broker_address(), Box::new(e)))?,
            ),
            None => None,
        };

        let reused = self.inner.idle.lock().pop_front();
        let connection = match reused {
            Some(connection) => connection,
            None => {
                tracing::debug!("Opening new pooled connection");
                self.inner
                    .manager
                    .connect()
                    .await
                    .map_err(|e| ConnectionError::new(self.broker_address(), e.into()))?
            }
        };

        Ok(Rented {
            connection: Some(connection),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

/// Exclusive use of one pooled handle. Returned to the pool on drop.
pub struct Rented<M: ManageConnection> {
    connection: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    // Released after the handle is back in the idle queue.
    _permit: Option<OwnedSemaphorePermit>,
}

impl<M: ManageConnection> Rented<M> {
    /// Drop the handle instead of returning it, e.g. after the broker closed it.
    pub fn discard(mut self) {
        self.connection.take();
    }
}

impl<M: ManageConnection> Deref for Rented<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection is only taken on drop"))
    }
}

impl<M: ManageConnection> DerefMut for Rented<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection is only taken on drop"))
    }
}

impl<M: ManageConnection> Drop for Rented<M> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.config.max_idle {
            idle.push_back(connection);
        }
    }
}

/// The broker could not be reached while opening a handle or a client.
#[derive(Debug)]
pub struct ConnectionError {
    context: SpanTrace,
    address: BrokerAddress,
    source: tower::BoxError,
}

impl ConnectionError {
    pub fn new(address: BrokerAddress, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            address,
            source,
        }
    }

    pub fn broker_address(&self) -> &BrokerAddress {
        &self.address
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Broker unreachable ({}): {}", self.address, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
