// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::auth_chain::{auth_chain, auth_chain_difference};
use crate::event::{Event, EventId};

/// Read access to events of the room DAG.
///
/// Implementors only need to provide [`EventStore::get_event`], which may be served from memory
/// or by fetching the event from a remote peer. The auth chain queries are derived from it.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Get a single event by id.
    async fn get_event(&self, event_id: &EventId) -> Result<Event, StoreError>;

    /// Get a batch of events.
    ///
    /// Events are requested one after another, the first failure aborts the whole batch.
    async fn get_events(
        &self,
        event_ids: &[EventId],
    ) -> Result<HashMap<EventId, Event>, StoreError> {
        let mut events = HashMap::with_capacity(event_ids.len());
        for event_id in event_ids {
            let event = self.get_event(event_id).await?;
            events.insert(event_id.clone(), event);
        }
        Ok(events)
    }

    /// Get the full auth chain of the given events, including the events themselves.
    async fn get_auth_chain(&self, event_ids: &[EventId]) -> Result<HashSet<EventId>, StoreError> {
        auth_chain(self, event_ids.iter().cloned()).await
    }

    /// Get all events which are in some but not all auth chains of the given sets.
    async fn get_auth_chain_difference(
        &self,
        _room_id: &str,
        auth_sets: &[HashSet<EventId>],
    ) -> Result<HashSet<EventId>, StoreError> {
        auth_chain_difference(self, auth_sets).await
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("fetch timeout for event {0}")]
    Timeout(EventId),

    #[error("session closed before event {0} was received")]
    Closed(EventId),

    #[error("fetch of event {0} was cancelled")]
    Cancelled(EventId),

    #[error("remote failed to provide event {0}: {1}")]
    Remote(EventId, String),

    #[error("received invalid event {0}: {1}")]
    InvalidEvent(EventId, String),

    #[error("event {0} not found")]
    NotFound(EventId),

    #[error("could not send request for event {0}: {1}")]
    Send(EventId, String),
}
