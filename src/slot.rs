use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{ManageConnection, PhysicalConnection};

/// The reusable wrapper a worker owns around (at most) one physical
/// connection. The connection itself isn't opened until
/// [`Slot::ensure_open`] is first called, and it lives "at home" in this
/// struct only while the worker holds it. While a caller has it checked
/// out, it travels with the [`PooledConnection`] by value instead of
/// sitting behind a lock, so a caller's `Deref` never needs to touch the
/// worker's synchronization at all.
///
/// Mutual exclusion between the worker and whichever caller currently
/// holds the slot is a single `Semaphore` permit: the worker calls
/// [`Slot::acquire`] to wait for a caller to give it back, and a caller
/// gives it back (directly, or via [`PooledConnection`]'s `Drop`) exactly
/// once per checkout. Neither side keeps a `SemaphorePermit` guard alive
/// across a task boundary, so permits are forgotten and restored by hand,
/// the same `forget`/`add_permits` pattern other pools in this crate's
/// lineage use to let a permit travel between tasks.
pub(crate) struct Slot<C> {
    home: StdMutex<Option<C>>,
    created_at: StdMutex<Option<Instant>>,
    permit: Semaphore,
    /// Set by the owning worker right before it exits. A caller that
    /// releases a connection after this point can't hand it back to a
    /// worker that's no longer reading `home`. Without this flag the
    /// connection would simply sit in `home` forever, unclosed.
    terminated: AtomicBool,
}

/// Outcome of [`Slot::acquire`].
pub(crate) enum AcquireOutcome {
    Acquired,
    Cancelled,
}

impl<C> Slot<C> {
    pub(crate) fn new() -> Self {
        Slot {
            home: StdMutex::new(None),
            created_at: StdMutex::new(None),
            permit: Semaphore::new(1),
            terminated: AtomicBool::new(false),
        }
    }

    /// Blocks until the permit is available or `cancel` fires.
    pub(crate) async fn acquire(&self, cancel: &CancellationToken) -> AcquireOutcome {
        tokio::select! {
            biased;
            () = cancel.cancelled() => AcquireOutcome::Cancelled,
            permit = self.permit.acquire() => {
                permit.expect("slot semaphore is never closed").forget();
                AcquireOutcome::Acquired
            }
        }
    }

    /// Returns the permit without returning a connection. Idempotent: a
    /// redundant release (permit already available) is silently ignored
    /// rather than corrupting the count.
    pub(crate) fn release_permit(&self) {
        if self.permit.available_permits() == 0 {
            self.permit.add_permits(1);
        }
    }

    /// Hands the connection back to its slot (so the worker can inspect or
    /// re-offer it) and returns the permit. If the owning worker has
    /// already terminated (the pool was closed while this connection was
    /// checked out), nobody will ever read `home` again, so the
    /// connection is closed directly instead of being silently stranded.
    pub(crate) fn release(&self, conn: C)
    where
        C: PhysicalConnection,
    {
        if self.terminated.load(Ordering::Acquire) {
            tokio::spawn(async move { conn.close().await });
        } else {
            *self.home.lock().unwrap() = Some(conn);
        }
        self.release_permit();
    }

    /// Worker-only: puts a connection the worker itself withdrew from an
    /// offer back at home, without touching the permit (the worker never
    /// gave the permit to anyone in this path, so there's nothing to
    /// restore).
    pub(crate) fn put_back(&self, conn: C) {
        *self.home.lock().unwrap() = Some(conn);
    }

    /// Worker-only: marks this slot's owner as gone. Must be called before
    /// the worker's final close, so a race with a caller's concurrent
    /// [`Slot::release`] is resolved in favor of closing the connection.
    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    /// Worker-only: materializes the connection if it isn't already home,
    /// stamping `created_at` the first time this happens for this slot.
    pub(crate) async fn ensure_open<M>(&self, manager: &M) -> Result<(), M::Error>
    where
        M: ManageConnection<Connection = C>,
    {
        let needs_open = self.home.lock().unwrap().is_none();
        if !needs_open {
            return Ok(());
        }
        let conn = manager.connect().await?;
        *self.home.lock().unwrap() = Some(conn);
        *self.created_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    /// Age of the connection since it was materialized, or `Duration::ZERO`
    /// if it never has been.
    pub(crate) fn age(&self) -> Duration {
        match *self.created_at.lock().unwrap() {
            Some(t) => t.elapsed(),
            None => Duration::ZERO,
        }
    }

    pub(crate) fn is_closed(&self) -> bool
    where
        C: PhysicalConnection,
    {
        match &*self.home.lock().unwrap() {
            Some(conn) => conn.is_closed(),
            None => false,
        }
    }

    pub(crate) async fn is_valid(&self, timeout: Duration) -> bool
    where
        C: PhysicalConnection,
    {
        let taken = self.home.lock().unwrap().take();
        match taken {
            Some(mut conn) => {
                let ok = conn.is_valid(timeout).await;
                *self.home.lock().unwrap() = Some(conn);
                ok
            }
            None => true,
        }
    }

    /// Closes and drops the materialized connection, if any. Called only
    /// by the worker that owns this slot.
    pub(crate) async fn close(&self)
    where
        C: PhysicalConnection,
    {
        let taken = self.home.lock().unwrap().take();
        if let Some(conn) = taken {
            conn.close().await;
        }
    }

    /// Worker-only: removes the connection from "at home" storage so it
    /// can travel to a caller through the rendezvous. Panics if the
    /// connection isn't home; callers of this function are expected to
    /// have called `ensure_open` first.
    pub(crate) fn take_for_offer(&self) -> C {
        self.home
            .lock()
            .unwrap()
            .take()
            .expect("ensure_open must run before a slot is offered")
    }
}

/// A connection checked out from the pool.
///
/// Dereferences to the underlying connection. Dropping it releases the
/// connection back to the pool for reuse, unless it's an overflow
/// connection (see [`PooledConnection::is_overflow`]). Dropping an
/// overflow connection closes the physical connection directly instead,
/// since overflow connections are never reused.
pub struct PooledConnection<M: ManageConnection> {
    state: State<M>,
}

enum State<M: ManageConnection> {
    Pooled {
        conn: Option<M::Connection>,
        slot: Arc<Slot<M::Connection>>,
    },
    Overflow {
        conn: Option<M::Connection>,
    },
}

impl<M: ManageConnection> PooledConnection<M> {
    pub(crate) fn pooled(conn: M::Connection, slot: Arc<Slot<M::Connection>>) -> Self {
        PooledConnection {
            state: State::Pooled {
                conn: Some(conn),
                slot,
            },
        }
    }

    pub(crate) fn overflow(conn: M::Connection) -> Self {
        PooledConnection {
            state: State::Overflow { conn: Some(conn) },
        }
    }

    /// True if this connection bypassed the pool's reuse machinery (the
    /// `connection_timeout` overflow path). Overflow connections are
    /// closed, not returned, on drop.
    pub fn is_overflow(&self) -> bool {
        matches!(self.state, State::Overflow { .. })
    }

    /// Always true: a `PooledConnection` always wraps exactly one
    /// connection satisfying [`PhysicalConnection`]. Provided for parity
    /// with the driver-style `isWrapperFor` capability check this type's
    /// design is modeled on.
    pub fn is_wrapper_for_physical_connection(&self) -> bool {
        true
    }

    /// Detaches the physical connection from pool bookkeeping and returns
    /// it directly, without closing it. For a pooled connection, the slot
    /// it came from is left empty; the owning worker will see this on its
    /// next cycle and open a fresh replacement rather than finding the
    /// original connection waiting for it.
    pub fn into_inner(mut self) -> M::Connection {
        match &mut self.state {
            State::Pooled { conn, slot } => {
                let conn = conn.take().expect("connection present until drop or into_inner");
                slot.release_permit();
                conn
            }
            State::Overflow { conn } => {
                conn.take().expect("connection present until drop or into_inner")
            }
        }
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        match &self.state {
            State::Pooled { conn, .. } | State::Overflow { conn } => {
                conn.as_ref().expect("connection present until drop or into_inner")
            }
        }
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        match &mut self.state {
            State::Pooled { conn, .. } | State::Overflow { conn } => {
                conn.as_mut().expect("connection present until drop or into_inner")
            }
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        match &mut self.state {
            State::Pooled { conn, slot } => {
                if let Some(conn) = conn.take() {
                    slot.release(conn);
                }
            }
            State::Overflow { conn } => {
                if let Some(conn) = conn.take() {
                    // Best-effort: close on a detached task since `Drop`
                    // can't be async. Overflow connections are the slow
                    // path already, so this doesn't need to be cleverer.
                    tokio::spawn(async move { conn.close().await });
                }
            }
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("is_overflow", &self.is_overflow())
            .finish()
    }
}
