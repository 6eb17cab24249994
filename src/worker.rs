use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::builder::Options;
use crate::rendezvous::Rendezvous;
use crate::slot::{AcquireOutcome, Slot};
use crate::{emit, ManageConnection, PhysicalConnection, PoolEvent};

/// A pool-held handle to a running worker: everything the pool needs to
/// signal it without touching its internals.
pub(crate) struct WorkerHandle {
    needs_replenish: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Requests that this worker discard its current connection and open
    /// a replacement, the next time its loop checks in. Used by `Pool::acquire`
    /// when a caller observes a dead connection at checkout.
    pub(crate) fn request_replenish(&self) {
        self.needs_replenish.store(true, Ordering::Release);
    }
}

/// Spawns a worker owning slot `index` and returns a handle to it. The
/// worker runs until `cancel` fires. It is not joined by the pool; its own
/// close-on-exit logic is sufficient cleanup.
pub(crate) fn spawn<M: ManageConnection>(
    index: usize,
    manager: Arc<M>,
    rendezvous: Arc<Rendezvous<M::Connection>>,
    opts: Arc<Options<M::Error>>,
    cancel: CancellationToken,
) -> WorkerHandle {
    let needs_replenish = Arc::new(AtomicBool::new(false));
    tokio::spawn(run(
        index,
        manager,
        rendezvous,
        opts,
        needs_replenish.clone(),
        cancel,
    ));
    WorkerHandle { needs_replenish }
}

async fn run<M: ManageConnection>(
    index: usize,
    manager: Arc<M>,
    rendezvous: Arc<Rendezvous<M::Connection>>,
    opts: Arc<Options<M::Error>>,
    needs_replenish: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut current = Arc::new(Slot::new());

    loop {
        // Step 1: cancellation.
        if cancel.is_cancelled() {
            terminate(&current).await;
            return;
        }

        // Step 2: replenish.
        if needs_replenish.swap(false, Ordering::AcqRel) {
            current.close().await;
            emit(
                opts.event_sink.as_ref(),
                PoolEvent::ReplenishingConnection { worker: index },
            );
            current = Arc::new(Slot::new());
            continue;
        }

        // Step 3: acquire (blocks while a caller holds the slot).
        match current.acquire(&cancel).await {
            AcquireOutcome::Cancelled => {
                terminate(&current).await;
                return;
            }
            AcquireOutcome::Acquired => {}
        }

        // Materialize the physical connection if this is its first trip
        // around the loop.
        if let Err(error) = current.ensure_open(manager.as_ref()).await {
            emit(
                opts.event_sink.as_ref(),
                PoolEvent::FactoryFailure {
                    worker: Some(index),
                    error: &error,
                },
            );
            current.release_permit();
            continue;
        }

        // Step 4: lifetime check.
        let age = current.age();
        if age >= opts.max_lifetime {
            emit(
                opts.event_sink.as_ref(),
                PoolEvent::MaxLifetimeExceeded { worker: index, age },
            );
            current.release_permit();
            needs_replenish.store(true, Ordering::Release);
            continue;
        }
        let remaining = opts.max_lifetime - age;

        // Step 5: offer.
        let conn = current.take_for_offer();
        emit(
            opts.event_sink.as_ref(),
            PoolEvent::OfferingConnection { worker: index },
        );
        let posted = rendezvous.post((conn, current.clone(), index));

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                emit(
                    opts.event_sink.as_ref(),
                    PoolEvent::InterruptedWhileTransferring { worker: index },
                );
                current.mark_terminated();
                if let Some((conn, _, _)) = posted.withdraw() {
                    conn.close().await;
                }
                return;
            }

            () = posted.claimed() => {
                // Transferred: a caller now holds the permit. Loop back to
                // step 1, which will wait on the next `acquire` for release.
            }

            _ = tokio::time::sleep(opts.idle_timeout) => {
                match posted.withdraw() {
                    Some((mut conn, _, _)) => {
                        emit(
                            opts.event_sink.as_ref(),
                            PoolEvent::IdleTimeoutValidityCheck { worker: index },
                        );
                        let valid = conn
                            .is_valid(std::time::Duration::from_secs(opts.validation_timeout_secs()))
                            .await;
                        current.put_back(conn);
                        current.release_permit();
                        if !valid {
                            needs_replenish.store(true, Ordering::Release);
                        }
                    }
                    None => {
                        // A caller claimed it in the narrow race between the
                        // timer firing and withdrawal; treat as transferred.
                    }
                }
            }

            _ = tokio::time::sleep(remaining) => {
                match posted.withdraw() {
                    Some((conn, _, _)) => {
                        emit(
                            opts.event_sink.as_ref(),
                            PoolEvent::MaxLifetimeExceeded {
                                worker: index,
                                age: current.age(),
                            },
                        );
                        current.put_back(conn);
                        current.release_permit();
                        needs_replenish.store(true, Ordering::Release);
                    }
                    None => {
                        // Claimed just as the timer fired; let the caller
                        // use it and recheck its age on the next cycle.
                    }
                }
            }
        }
    }
}

async fn terminate<C: PhysicalConnection>(current: &Slot<C>) {
    current.mark_terminated();
    current.close().await;
}
