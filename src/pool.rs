use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::builder::{Builder, Options};
use crate::slot::PooledConnection;
use crate::worker::{self, WorkerHandle};
use crate::{emit, ManageConnection, PhysicalConnection, PoolError, PoolEvent};
use crate::rendezvous::Rendezvous;

/// An async connection pool.
///
/// Cheap to clone: clones share the same workers and rendezvous. Dropping
/// the last clone does not close the pool. Shutdown is idempotent and
/// caller-initiated, not tied to drop, so call [`Pool::close`] explicitly.
pub struct Pool<M: ManageConnection> {
    inner: Arc<Inner<M>>,
}

struct Inner<M: ManageConnection> {
    manager: Arc<M>,
    opts: Arc<Options<M::Error>>,
    rendezvous: Arc<Rendezvous<M::Connection>>,
    workers: Vec<WorkerHandle>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<M: ManageConnection> Pool<M> {
    /// Starts building a new pool for the given manager.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    pub(crate) fn new(opts: Options<M::Error>, manager: M) -> Pool<M> {
        let opts = Arc::new(opts);
        let manager = Arc::new(manager);
        let rendezvous = Arc::new(Rendezvous::new());
        let cancel = CancellationToken::new();

        let workers = (0..opts.pool_size)
            .map(|i| {
                worker::spawn(
                    i as usize,
                    manager.clone(),
                    rendezvous.clone(),
                    opts.clone(),
                    cancel.clone(),
                )
            })
            .collect();

        Pool {
            inner: Arc::new(Inner {
                manager,
                opts,
                rendezvous,
                workers,
                cancel,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks out a connection, reusing one of the pool's workers if one
    /// becomes available within `connection_timeout`, or falling back to
    /// a non-reusable overflow connection (or failing) otherwise.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError<M::Error>> {
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }

            let offer = self
                .inner
                .rendezvous
                .take(self.inner.opts.connection_timeout())
                .await;

            let (mut conn, slot, idx) = match offer {
                Some(handoff) => handoff,
                None => {
                    if self.inner.opts.throw_on_connection_timeout {
                        return Err(PoolError::AcquireTimeout);
                    }
                    emit(
                        self.inner.opts.event_sink.as_ref(),
                        PoolEvent::CreatingOverflowConnection,
                    );
                    let conn = self.inner.manager.connect().await.map_err(|error| {
                        emit(
                            self.inner.opts.event_sink.as_ref(),
                            PoolEvent::FactoryFailure {
                                worker: None,
                                error: &error,
                            },
                        );
                        PoolError::Factory(error)
                    })?;
                    return Ok(PooledConnection::overflow(conn));
                }
            };

            let invalid = if self.inner.opts.validate_on_checkout {
                let timeout = std::time::Duration::from_secs(
                    self.inner.opts.validation_timeout_secs(),
                );
                !conn.is_valid(timeout).await
            } else {
                conn.is_closed()
            };

            if invalid {
                emit(
                    self.inner.opts.event_sink.as_ref(),
                    PoolEvent::InvalidConnectionRetry { worker: idx },
                );
                self.inner.workers[idx].request_replenish();
                slot.release(conn);
                continue;
            }

            return Ok(PooledConnection::pooled(conn, slot));
        }
    }

    /// Closes the pool. Idempotent: subsequent calls are no-ops. Already
    /// checked-out connections finish normally; their owning workers close
    /// the physical connection once released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        emit(
            self.inner.opts.event_sink.as_ref(),
            PoolEvent::BreakingRecursion,
        );
        self.inner.cancel.cancel();
    }
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pool_size", &self.inner.workers.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;

    /// Installs a `tracing` subscriber writing to the test harness's
    /// captured output, so `cargo test -- --nocapture` shows the pool's
    /// event log alongside assertion failures. Safe to call from every
    /// test: a subscriber is already installed after the first call, and
    /// `try_init` just reports that rather than panicking.
    fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferrypool=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }

    #[derive(Debug)]
    struct StubConn {
        closed: Arc<AtomicBool>,
        valid: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PhysicalConnection for StubConn {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }

        async fn is_valid(&mut self, _timeout: Duration) -> bool {
            self.valid.load(Ordering::Acquire)
        }

        async fn close(self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("stub factory failure")]
    struct StubError;

    #[derive(Debug)]
    struct StubManager {
        opens: Arc<AtomicU32>,
        valid: Arc<AtomicBool>,
    }

    impl StubManager {
        fn new() -> Self {
            StubManager {
                opens: Arc::new(AtomicU32::new(0)),
                valid: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    #[async_trait]
    impl ManageConnection for StubManager {
        type Connection = StubConn;
        type Error = StubError;

        async fn connect(&self) -> Result<StubConn, StubError> {
            self.opens.fetch_add(1, Ordering::AcqRel);
            Ok(StubConn {
                closed: Arc::new(AtomicBool::new(false)),
                valid: self.valid.clone(),
            })
        }
    }

    #[tokio::test]
    async fn cold_pool_reuses_connections_lazily() {
        let manager = StubManager::new();
        let opens = manager.opens.clone();
        let pool = Pool::builder().pool_size(3).build(manager);

        for _ in 0..10 {
            let conn = pool.acquire().await.expect("acquire should succeed");
            drop(conn);
        }

        assert!(opens.load(Ordering::Acquire) <= 3);
    }

    #[tokio::test]
    async fn pool_size_zero_always_overflows() {
        let manager = StubManager::new();
        let opens = manager.opens.clone();
        let pool = Pool::builder()
            .pool_size(0)
            .connection_timeout(Duration::from_millis(20))
            .throw_on_connection_timeout(false)
            .build(manager);

        let conn = pool.acquire().await.expect("overflow should succeed");
        assert!(conn.is_overflow());
        assert_eq!(opens.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_throw_on_connection_timeout_is_set() {
        let manager = StubManager::new();
        let pool = Pool::builder()
            .pool_size(1)
            .connection_timeout(Duration::from_millis(20))
            .build(manager);

        let held = pool.acquire().await.expect("first acquire succeeds");
        let err = pool.acquire().await.expect_err("second should time out");
        assert!(matches!(err, PoolError::AcquireTimeout));
        drop(held);
    }

    #[tokio::test]
    async fn overflow_path_serves_a_second_caller_while_the_only_slot_is_held() {
        let manager = StubManager::new();
        let opens = manager.opens.clone();
        let pool = Pool::builder()
            .pool_size(1)
            .connection_timeout(Duration::from_millis(50))
            .throw_on_connection_timeout(false)
            .build(manager);

        let held = pool.acquire().await.expect("first acquire holds the only slot");
        let overflow = pool
            .acquire()
            .await
            .expect("second acquire should fall back to overflow");
        assert!(overflow.is_overflow());
        assert_eq!(opens.load(Ordering::Acquire), 2);

        drop(overflow);
        drop(held);
    }

    #[tokio::test]
    async fn dead_connection_at_checkout_is_retried_transparently() {
        let manager = StubManager::new();
        let valid = manager.valid.clone();
        let pool = Pool::builder().pool_size(1).build(manager);

        let first = pool.acquire().await.expect("first acquire");
        drop(first);

        valid.store(false, Ordering::Release);
        // Give the worker a moment to re-offer the now-invalid slot.
        tokio::time::sleep(Duration::from_millis(10)).await;

        valid.store(true, Ordering::Release);
        let second = pool
            .acquire()
            .await
            .expect("acquire should recover from a dead connection");
        assert!(!second.is_overflow());
    }

    #[tokio::test]
    async fn close_then_release_closes_the_physical_connection() {
        let manager = StubManager::new();
        let pool = Pool::builder().pool_size(1).build(manager);

        let conn = pool.acquire().await.expect("acquire");
        pool.close();

        let err = pool.acquire().await.expect_err("closed pool rejects acquire");
        assert!(matches!(err, PoolError::Closed));

        drop(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // No direct handle to the slot here, but a panic-free drop and a
        // rejected subsequent acquire are the externally observable half
        // of this guarantee; the worker-level close is covered in
        // worker::tests::closing_while_connection_is_checked_out_closes_it_on_release.
    }

    #[tokio::test]
    async fn concurrent_load_never_fails_and_opens_at_most_pool_size_plus_replenishments() {
        init_tracing();
        let manager = StubManager::new();
        let opens = manager.opens.clone();
        let pool = Pool::builder().pool_size(5).build(manager);

        let mut callers = Vec::new();
        for i in 0..20u64 {
            let pool = pool.clone();
            callers.push(tokio::spawn(async move {
                for _ in 0..3 {
                    let conn = pool.acquire().await.expect("acquire should never fail");
                    let jitter = Duration::from_millis((i * 7) % 20);
                    tokio::time::sleep(jitter).await;
                    drop(conn);
                }
            }));
        }

        for caller in callers {
            caller.await.expect("caller task should not panic");
        }

        // Every connection was valid and never replenished, so opens should
        // be bounded exactly by the worker count.
        assert!(opens.load(Ordering::Acquire) <= 5);
    }

    #[tokio::test]
    async fn idle_timeout_replaces_a_stale_connection_before_the_next_caller_sees_it() {
        init_tracing();
        let manager = StubManager::new();
        let valid = manager.valid.clone();
        let opens = manager.opens.clone();
        let pool = Pool::builder()
            .pool_size(1)
            .idle_timeout(Duration::from_millis(50))
            .build(manager);

        let first = pool.acquire().await.expect("first acquire");
        drop(first);

        // Mark the idling connection invalid, then let the worker's idle
        // timer fire, run its validity check, and replenish.
        valid.store(false, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(120)).await;

        // The worker should have flagged a replenish; the connection it
        // hands the next caller must be a fresh one, not the stale one.
        valid.store(true, Ordering::Release);
        let second = pool
            .acquire()
            .await
            .expect("acquire should recover from the idle-timeout validity check");
        assert!(!second.is_overflow());
        assert_eq!(opens.load(Ordering::Acquire), 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let manager = StubManager::new();
        let pool = Pool::builder().pool_size(1).build(manager);
        pool.close();
        pool.close();
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            PoolError::Closed
        ));
    }
}
