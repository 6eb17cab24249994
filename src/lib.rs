//! An async connection pool built around one lightweight worker task per
//! reusable connection.
//!
//! Most connection pools guard a shared set of idle connections with a
//! mutex: a caller locks the pool, pops a connection off a list, and
//! pushes it back when done. This pool takes a different shape. Each slot
//! in the pool is owned outright by its own worker task, which lazily
//! opens a single physical connection, offers it to callers over a
//! rendezvous channel, and replenishes it when it goes stale or exceeds
//! its maximum lifetime. Callers never see the worker; they only see
//! [`Pool::acquire`] and the [`PooledConnection`] it hands back.
//!
//! Implementors of [`ManageConnection`] provide the database-specific
//! logic to dial a connection; implementors of [`PhysicalConnection`]
//! (usually the connection type itself) provide liveness checks.
#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

mod builder;
mod pool;
mod rendezvous;
mod slot;
mod worker;

pub use builder::Builder;
pub use pool::Pool;
pub use slot::PooledConnection;

/// A trait which provides connection-specific factory logic.
///
/// Implementors supply the driver-specific means of dialing a fresh
/// connection. Health checks live on [`PhysicalConnection`] instead, since
/// they're a property of the connection, not of the thing that creates it.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    /// The connection type this manager deals with.
    type Connection: PhysicalConnection;
    /// The error type returned when a connection attempt fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Attempts to create a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
}

/// A physical connection, as seen by the pool.
///
/// The pool calls these methods only at checkout (`is_valid` or
/// `is_closed`, depending on configuration) and on idle-timeout
/// (`is_valid`). It never calls them while a caller holds the connection.
#[async_trait]
pub trait PhysicalConnection: Send + 'static {
    /// Synchronously determine whether the connection is known to be dead.
    ///
    /// This should be cheap; it's called on every checkout when
    /// `validate_on_checkout` is disabled.
    fn is_closed(&self) -> bool;

    /// Actively probe whether the connection is still usable, waiting at
    /// most `timeout` for the driver to answer.
    async fn is_valid(&mut self, timeout: Duration) -> bool;

    /// Close the underlying transport. Called exactly once per opened
    /// connection, by the worker that owns it.
    async fn close(self);
}

/// This crate's error type.
#[derive(Debug, thiserror::Error)]
pub enum PoolError<E> {
    /// `acquire` was called after the pool was closed.
    #[error("connection pool is closed")]
    Closed,
    /// `connection_timeout` elapsed with no reusable connection available
    /// and overflow connections are disabled.
    #[error("timed out waiting for a connection")]
    AcquireTimeout,
    /// The factory failed to open a connection on the overflow path.
    #[error("connection factory failed: {0}")]
    Factory(#[source] E),
}

/// An event the pool emits for observability.
///
/// Every variant corresponds to one of the log messages this crate's
/// design calls for. These reach both the always-on `tracing` output and
/// whatever [`EventSink`] the caller installed.
#[derive(Debug, Clone)]
pub enum PoolEvent<'a, E> {
    /// A worker is discarding its current slot and creating a replacement.
    ReplenishingConnection {
        /// Index of the worker doing the replenishing.
        worker: usize,
    },
    /// A worker's slot exceeded `max_lifetime` and is being replaced.
    MaxLifetimeExceeded {
        /// Index of the worker.
        worker: usize,
        /// Age of the slot at the moment it was withdrawn.
        age: Duration,
    },
    /// A worker posted its slot onto the rendezvous for callers to take.
    OfferingConnection {
        /// Index of the worker.
        worker: usize,
    },
    /// A worker's offer sat unclaimed past `idle_timeout`; it is checking
    /// whether the connection is still valid before offering it again.
    IdleTimeoutValidityCheck {
        /// Index of the worker.
        worker: usize,
    },
    /// A caller observed a closed or invalid connection at checkout and is
    /// retrying.
    InvalidConnectionRetry {
        /// Index of the worker whose slot was bad.
        worker: usize,
    },
    /// `connection_timeout` elapsed and the pool is opening a non-reusable
    /// overflow connection.
    CreatingOverflowConnection,
    /// The pool is shutting down; workers are being cancelled.
    BreakingRecursion,
    /// A worker was interrupted while waiting to transfer its slot.
    InterruptedWhileTransferring {
        /// Index of the worker.
        worker: usize,
    },
    /// The factory failed to produce a connection.
    FactoryFailure {
        /// The worker that hit the failure, if any (`None` on the overflow
        /// path, which runs outside any worker).
        worker: Option<usize>,
        /// The error the factory returned.
        error: &'a E,
    },
}

/// A sink for [`PoolEvent`]s that aren't tied to any particular caller.
///
/// This is an explicit, programmable hook, independent of (and in
/// addition to) the `tracing` events this crate always emits. Installing a
/// sink doesn't silence `tracing`, and leaving the default no-op sink in
/// place doesn't silence `tracing` either.
pub trait EventSink<E>: fmt::Debug + Send + Sync + 'static {
    /// Receive an event.
    fn sink(&self, event: PoolEvent<'_, E>);

    /// Clone this sink.
    fn boxed_clone(&self) -> Box<dyn EventSink<E>>;
}

/// An [`EventSink`] implementation that does nothing. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopEventSink;

impl<E: Send + Sync + 'static> EventSink<E> for NopEventSink {
    fn sink(&self, _: PoolEvent<'_, E>) {}

    fn boxed_clone(&self) -> Box<dyn EventSink<E>> {
        Box::new(*self)
    }
}

/// Routes an event to both the always-on `tracing` output and the
/// caller-installed [`EventSink`].
pub(crate) fn emit<E: std::error::Error>(sink: &dyn EventSink<E>, event: PoolEvent<'_, E>) {
    trace_event(&event);
    sink.sink(event);
}

pub(crate) fn trace_event<E: std::error::Error>(event: &PoolEvent<'_, E>) {
    match event {
        PoolEvent::ReplenishingConnection { worker } => {
            tracing::debug!(worker, "replenishing connection")
        }
        PoolEvent::MaxLifetimeExceeded { worker, age } => {
            tracing::debug!(worker, age_ms = age.as_millis() as u64, "max lifetime exceeded")
        }
        PoolEvent::OfferingConnection { worker } => {
            tracing::trace!(worker, "offering reusable connection")
        }
        PoolEvent::IdleTimeoutValidityCheck { worker } => {
            tracing::debug!(worker, "idle timeout - checking validity")
        }
        PoolEvent::InvalidConnectionRetry { worker } => {
            tracing::warn!(worker, "got a closed/invalid connection - retrying")
        }
        PoolEvent::CreatingOverflowConnection => {
            tracing::debug!("creating non-reusable connection (slow path)")
        }
        PoolEvent::BreakingRecursion => tracing::debug!("breaking recursion"),
        PoolEvent::InterruptedWhileTransferring { worker } => {
            tracing::debug!(worker, "interrupted while waiting to transfer")
        }
        PoolEvent::FactoryFailure { worker, error } => {
            tracing::warn!(worker, error = %error, "connection factory failed")
        }
    }
}
