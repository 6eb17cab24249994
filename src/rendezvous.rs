use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::slot::Slot;

/// What a producer hands a consumer: the connection itself, the slot it
/// came from (so a caller's release or `into_inner` can reach the right
/// worker's bookkeeping), and the index of the worker offering it, so the
/// consumer can signal that worker directly if the connection turns out to
/// be bad.
pub(crate) type Handoff<C> = (C, Arc<Slot<C>>, usize);

/// A single pending offer: one producer's item, claimable by exactly one
/// consumer. Modeled after `bb8`'s `waiters: VecDeque<oneshot::Sender<_>>`,
/// generalized so the producer side can also wait (and withdraw on
/// timeout) instead of always buffering immediately.
struct PendingOffer<C> {
    item: StdMutex<Option<Handoff<C>>>,
    taken: Notify,
}

/// A handle to a posted-but-not-yet-resolved offer. A worker races
/// [`PostedOffer::claimed`] against whatever timeouts and cancellation it
/// needs, all at once: idle-timeout, its max-lifetime timer, and pool
/// shutdown. It calls [`PostedOffer::withdraw`] on whichever branch loses.
pub(crate) struct PostedOffer<C> {
    pending: Arc<PendingOffer<C>>,
}

impl<C> PostedOffer<C> {
    /// Resolves once a consumer claims the offer. Safe to race against
    /// withdrawal in a `select!`: if the claim already happened, this
    /// resolves immediately (`Notify` stores the wakeup even if nothing
    /// was waiting yet).
    pub(crate) async fn claimed(&self) {
        self.pending.taken.notified().await
    }

    /// Reclaims the item if no consumer has claimed it yet. `None` means
    /// a consumer already has it.
    pub(crate) fn withdraw(&self) -> Option<Handoff<C>> {
        self.pending.item.lock().unwrap().take()
    }
}

/// A blocking, unbuffered handoff between worker producers and caller
/// consumers. An item posted with [`Rendezvous::post`] is visible to
/// [`Rendezvous::take`] only until a consumer claims it or the producer
/// withdraws it on timeout; it is never queued past that point.
pub(crate) struct Rendezvous<C> {
    offers: StdMutex<VecDeque<Arc<PendingOffer<C>>>>,
    offer_available: Notify,
}

impl<C: Send + 'static> Rendezvous<C> {
    pub(crate) fn new() -> Self {
        Rendezvous {
            offers: StdMutex::new(VecDeque::new()),
            offer_available: Notify::new(),
        }
    }

    /// Posts `item` without waiting. The caller races [`PostedOffer::claimed`]
    /// against whatever other timeouts or cancellation it needs, then calls
    /// [`PostedOffer::withdraw`] if it gives up.
    pub(crate) fn post(&self, item: Handoff<C>) -> PostedOffer<C> {
        let pending = Arc::new(PendingOffer {
            item: StdMutex::new(Some(item)),
            taken: Notify::new(),
        });
        self.offers.lock().unwrap().push_back(pending.clone());
        self.offer_available.notify_one();
        PostedOffer { pending }
    }

    /// Waits up to `wait` for a producer to hand over an item directly.
    /// `wait: None` waits forever.
    pub(crate) async fn take(&self, wait: Option<Duration>) -> Option<Handoff<C>> {
        match wait {
            Some(d) => timeout(d, self.take_forever()).await.unwrap_or(None),
            None => self.take_forever().await,
        }
    }

    async fn take_forever(&self) -> Option<Handoff<C>> {
        loop {
            let candidate = self.offers.lock().unwrap().pop_front();
            let Some(pending) = candidate else {
                self.offer_available.notified().await;
                continue;
            };
            let claimed = pending.item.lock().unwrap().take();
            if let Some(handoff) = claimed {
                pending.taken.notify_one();
                return Some(handoff);
            }
            // The producer already withdrew this one; it's disposable, try
            // the next entry without waiting.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Slot;
    use std::time::Duration;

    fn handoff(idx: usize) -> Handoff<()> {
        ((), Arc::new(Slot::new()), idx)
    }

    #[tokio::test]
    async fn transfers_directly() {
        let r: Arc<Rendezvous<()>> = Arc::new(Rendezvous::new());
        let r2 = r.clone();
        let take_task = tokio::spawn(async move { r2.take(Some(Duration::from_secs(1))).await });

        // Give the take a moment to register.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let posted = r.post(handoff(7));
        timeout(Duration::from_secs(1), posted.claimed())
            .await
            .expect("should have been claimed");
        assert!(posted.withdraw().is_none());

        let (_, _, idx) = take_task.await.unwrap().expect("should have received item");
        assert_eq!(idx, 7);
    }

    #[tokio::test]
    async fn offer_times_out_with_no_consumer() {
        let r: Rendezvous<()> = Rendezvous::new();
        let posted = r.post(handoff(0));
        let result = timeout(Duration::from_millis(20), posted.claimed()).await;
        assert!(result.is_err());
        assert!(posted.withdraw().is_some());
    }

    #[tokio::test]
    async fn take_times_out_with_no_producer() {
        let r: Rendezvous<()> = Rendezvous::new();
        let result = r.take(Some(Duration::from_millis(20))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn withdrawn_offer_is_not_delivered_later() {
        let r: Rendezvous<()> = Rendezvous::new();
        let posted = r.post(handoff(1));
        let result = timeout(Duration::from_millis(10), posted.claimed()).await;
        assert!(result.is_err());
        assert!(posted.withdraw().is_some());

        // No producer remains; a later take must not see the withdrawn item.
        let result = r.take(Some(Duration::from_millis(10))).await;
        assert!(result.is_none());
    }
}
