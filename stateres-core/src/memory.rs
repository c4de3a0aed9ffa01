// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory event store.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::event::{Event, EventId};
use crate::traits::{EventStore, StoreError};

/// Event store holding all events in memory.
///
/// Counts every lookup, which makes it useful to observe how often algorithms hit the store.
#[derive(Clone, Debug, Default)]
pub struct MemoryEventStore {
    events: HashMap<EventId, Event>,
    fetches: Arc<AtomicUsize>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event.
    ///
    /// Returns `true` when the insert occurred, or `false` when the event already existed.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.events.contains_key(event.id()) {
            return false;
        }
        self.events.insert(event.id().clone(), event);
        true
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of `get_event` calls since creation or the last reset.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn reset_fetch_count(&self) {
        self.fetches.store(0, Ordering::SeqCst);
    }
}

impl FromIterator<Event> for MemoryEventStore {
    fn from_iter<T: IntoIterator<Item = Event>>(iter: T) -> Self {
        let mut store = Self::new();
        for event in iter {
            store.insert(event);
        }
        store
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get_event(&self, event_id: &EventId) -> Result<Event, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.events
            .get(event_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(event_id.clone()))
    }
}
