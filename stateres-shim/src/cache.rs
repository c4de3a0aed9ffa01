// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session event cache with coalesced fetches.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{trace, warn};

use stateres_core::{Event, EventId, StoreError};

type Fetch = Shared<BoxFuture<'static, Result<Event, StoreError>>>;

enum Slot {
    Ready(Event),
    InFlight { fetch_id: u64, fetch: Fetch },
}

#[derive(Default)]
struct Slots {
    entries: HashMap<EventId, Slot>,
    next_fetch_id: u64,
}

/// Lazily populated mapping from event id to event.
///
/// Event ids are content-addressed, so cached events never go stale. Concurrent misses for the
/// same id share a single in-flight fetch; failed fetches are not cached and may be retried.
///
/// Every fetch runs on its own task and settles its slot when done, whether or not anyone is
/// still waiting for it.
#[derive(Clone, Default)]
pub struct EventCache {
    slots: Arc<Mutex<Slots>>,
    fetches: TaskTracker,
}

impl EventCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached event, without fetching.
    pub async fn get(&self, event_id: &EventId) -> Option<Event> {
        match self.slots.lock().await.entries.get(event_id) {
            Some(Slot::Ready(event)) => Some(event.clone()),
            _ => None,
        }
    }

    pub async fn insert(&self, event: Event) {
        self.slots
            .lock()
            .await
            .entries
            .insert(event.id().clone(), Slot::Ready(event));
    }

    /// Return the cached event or fetch it with `fetch`.
    ///
    /// `fetch` is only called if no fetch for this id is in flight already, otherwise the caller
    /// joins the in-flight one.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        event_id: &EventId,
        fetch: F,
    ) -> Result<Event, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Event, StoreError>> + Send + 'static,
    {
        let in_flight = {
            let mut slots = self.slots.lock().await;
            match slots.entries.get(event_id) {
                Some(Slot::Ready(event)) => return Ok(event.clone()),
                Some(Slot::InFlight { fetch, .. }) => {
                    trace!(%event_id, "joining in-flight fetch");
                    fetch.clone()
                }
                None => {
                    let fetch_id = slots.next_fetch_id;
                    slots.next_fetch_id += 1;
                    let in_flight = self.spawn_fetch(event_id.clone(), fetch_id, fetch());
                    slots.entries.insert(
                        event_id.clone(),
                        Slot::InFlight {
                            fetch_id,
                            fetch: in_flight.clone(),
                        },
                    );
                    in_flight
                }
            }
        };

        in_flight.await
    }

    fn spawn_fetch<Fut>(&self, event_id: EventId, fetch_id: u64, fetch: Fut) -> Fetch
    where
        Fut: Future<Output = Result<Event, StoreError>> + Send + 'static,
    {
        let slots = self.slots.clone();
        let settled_id = event_id.clone();
        let handle = self.fetches.spawn(async move {
            let result = fetch.await;

            let mut slots = slots.lock().await;
            // Only the fetch still registered for this id settles the slot.
            let current = matches!(
                slots.entries.get(&settled_id),
                Some(Slot::InFlight { fetch_id: registered, .. }) if *registered == fetch_id
            );
            if current {
                match &result {
                    Ok(event) => {
                        slots
                            .entries
                            .insert(settled_id, Slot::Ready(event.clone()));
                    }
                    Err(_) => {
                        slots.entries.remove(&settled_id);
                    }
                }
            }

            result
        });

        async move {
            handle.await.unwrap_or_else(|err| {
                warn!(%err, %event_id, "event fetch task failed");
                Err(StoreError::Cancelled(event_id))
            })
        }
        .boxed()
        .shared()
    }

    /// Number of cached events, in-flight fetches not included.
    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .entries
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of fetches not settled yet, including those nobody waits for anymore.
    pub fn running_fetches(&self) -> usize {
        self.fetches.len()
    }

    /// Drop all cached events and in-flight fetches.
    pub async fn clear(&self) {
        self.slots.lock().await.entries.clear();
    }

    /// Wait until every fetch started so far has settled.
    pub async fn settled(&self) {
        self.fetches.close();
        self.fetches.wait().await;
        self.fetches.reopen();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use futures_util::FutureExt;
    use tokio::sync::oneshot;

    use stateres_core::test_utils::EventBuilder;
    use stateres_core::{Event, EventId, StoreError};

    use super::EventCache;

    fn event(id: &str) -> Event {
        EventBuilder::new("m.room.message", "@alice:example.org").build(id)
    }

    #[tokio::test]
    async fn fetches_once_then_serves_from_cache() {
        let cache = EventCache::new();
        let fetches = Arc::new(AtomicUsize::new(0));
        let event_id = EventId::from("$a");

        for _ in 0..3 {
            let fetches = fetches.clone();
            let result = cache
                .get_or_fetch(&event_id, move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(event("$a"))
                })
                .await;
            assert_eq!(result, Ok(event("$a")));
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&event_id).await, Some(event("$a")));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = EventCache::new();
        let fetches = Arc::new(AtomicUsize::new(0));
        let event_id = EventId::from("$a");
        let (tx, rx) = oneshot::channel::<()>();

        let first = {
            let fetches = fetches.clone();
            cache.get_or_fetch(&event_id, move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                rx.await.ok();
                Ok(event("$a"))
            })
        };
        let second = {
            let fetches = fetches.clone();
            cache.get_or_fetch(&event_id, move || async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(event("$other"))
            })
        };
        let release = async move {
            tokio::task::yield_now().await;
            tx.send(()).ok();
        };

        let (first, second, ()) = tokio::join!(first, second, release);
        assert_eq!(first, Ok(event("$a")));
        assert_eq!(second, Ok(event("$a")));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_fetches_still_settle() {
        let cache = EventCache::new();
        let event_id = EventId::from("$a");
        let (tx, rx) = oneshot::channel::<()>();

        // The only waiter gives up after the fetch started.
        let waiter = cache.get_or_fetch(&event_id, move || async move {
            rx.await.ok();
            Ok(event("$a"))
        });
        assert!(waiter.now_or_never().is_none());
        assert_eq!(cache.running_fetches(), 1);

        tx.send(()).unwrap();
        cache.settled().await;
        assert_eq!(cache.running_fetches(), 0);
        assert_eq!(cache.get(&event_id).await, Some(event("$a")));
    }

    #[tokio::test]
    async fn failed_fetches_are_evicted() {
        let cache = EventCache::new();
        let event_id = EventId::from("$a");

        let result = cache
            .get_or_fetch(&event_id, || async {
                Err(StoreError::Timeout(EventId::from("$a")))
            })
            .await;
        assert_matches!(result, Err(StoreError::Timeout(_)));
        assert!(cache.is_empty().await);

        let result = cache
            .get_or_fetch(&event_id, || async { Ok(event("$a")) })
            .await;
        assert_eq!(result, Ok(event("$a")));
    }
}
