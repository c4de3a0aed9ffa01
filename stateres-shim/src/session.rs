// SPDX-License-Identifier: MIT OR Apache-2.0

//! State of one connection to the remote peer.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use stateres_core::event_id::verify_event_id;
use stateres_core::{Event, EventId, EventStore, RoomVersion, StoreError};

use crate::cache::EventCache;
use crate::config::Config;
use crate::correlation::{CorrelationError, CorrelationTable};
use crate::message::{GetEventResponse, MessageError, ResolveStateResponse, WireMessage};

/// Connection session, owning the correlation table, the event cache and the outbound channel.
///
/// Sessions are cheap to clone, all clones share the same state. Closing the session cancels all
/// pending fetches and discards every cached event.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Config,
    requests: Arc<CorrelationTable<WireMessage>>,
    cache: EventCache,
    outbound: mpsc::Sender<WireMessage>,
    token: CancellationToken,
}

impl SessionInner {
    fn requester(&self) -> Requester {
        Requester {
            requests: self.requests.clone(),
            outbound: self.outbound.clone(),
            token: self.token.clone(),
            fetch_timeout: self.config.fetch_timeout,
            verify_event_ids: self.config.verify_event_ids,
        }
    }
}

/// What a single round trip needs from its session.
///
/// Holds no reference to the event cache, in-flight fetches are stored there.
struct Requester {
    requests: Arc<CorrelationTable<WireMessage>>,
    outbound: mpsc::Sender<WireMessage>,
    token: CancellationToken,
    fetch_timeout: Duration,
    verify_event_ids: bool,
}

impl Session {
    pub fn new(
        config: Config,
        outbound: mpsc::Sender<WireMessage>,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                requests: Arc::new(CorrelationTable::new()),
                cache: EventCache::new(),
                outbound,
                token,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Token cancelled when the session closes.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Event store view for resolving state of a room with the given version.
    pub fn store(&self, room_version: RoomVersion) -> SessionStore<'_> {
        SessionStore {
            session: self,
            room_version,
        }
    }

    /// Get an event from the cache, or fetch it from the remote.
    ///
    /// Concurrent calls for the same missing event share a single request.
    pub async fn fetch_event(
        &self,
        event_id: &EventId,
        room_version: RoomVersion,
    ) -> Result<Event, StoreError> {
        let requester = self.inner.requester();
        let requested = event_id.clone();
        self.inner
            .cache
            .get_or_fetch(event_id, move || {
                requester.request_event(requested, room_version)
            })
            .await
    }

    /// Complete an outstanding request with the remote's response.
    pub async fn complete(&self, response: WireMessage) -> Result<(), CorrelationError> {
        let id = response.id.clone();
        self.inner.requests.complete(&id, response).await
    }

    pub async fn send(&self, message: WireMessage) -> Result<(), SessionError> {
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Send the outcome of a `resolve_state` request.
    pub async fn send_result(
        &self,
        id: &str,
        response: &ResolveStateResponse,
    ) -> Result<(), SessionError> {
        let message = WireMessage::resolve_state(id, response)?;
        self.send(message).await
    }

    /// Cancel pending fetches and drop all cached events.
    pub async fn close(&self) {
        self.inner.token.cancel();
        let abandoned = self.inner.requests.clear().await;
        self.inner.cache.clear().await;
        self.inner.cache.settled().await;
        debug!(abandoned, "session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Number of requests waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.requests.len().await
    }

    /// Number of cached events.
    pub async fn cached_events(&self) -> usize {
        self.inner.cache.len().await
    }

    /// Number of round trips not settled yet, including those nobody waits for anymore.
    pub fn running_fetches(&self) -> usize {
        self.inner.cache.running_fetches()
    }
}

impl Requester {
    /// One round trip to the remote for a single event.
    async fn request_event(
        self,
        event_id: EventId,
        room_version: RoomVersion,
    ) -> Result<Event, StoreError> {
        let (request_id, response) = self.requests.issue().await;
        debug!(%event_id, %request_id, "requesting event");

        let request = WireMessage::get_event(request_id.clone(), &event_id);
        let sent = tokio::select! {
            biased;

            _ = self.token.cancelled() => Err(StoreError::Cancelled(event_id.clone())),
            sent = self.outbound.send(request) => {
                sent.map_err(|err| StoreError::Send(event_id.clone(), err.to_string()))
            }
        };

        let response = match sent {
            Ok(()) => tokio::select! {
                biased;

                _ = self.token.cancelled() => Err(StoreError::Cancelled(event_id.clone())),
                response = tokio::time::timeout(self.fetch_timeout, response) => match response {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(_)) => Err(StoreError::Closed(event_id.clone())),
                    Err(_) => Err(StoreError::Timeout(event_id.clone())),
                },
            },
            Err(err) => Err(err),
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                // Free the slot, a late response is dropped as unknown.
                self.requests.cancel(&request_id).await;
                debug!(%event_id, %request_id, %err, "event request failed");
                return Err(err);
            }
        };

        if let Some(error) = &response.error {
            return Err(StoreError::Remote(event_id, error.clone()));
        }

        let GetEventResponse { event } = response
            .data()
            .map_err(|err| StoreError::InvalidEvent(event_id.clone(), err.to_string()))?;

        if self.verify_event_ids {
            if let Value::Object(payload) = &event {
                verify_event_id(room_version, &event_id, payload)
                    .map_err(|err| StoreError::InvalidEvent(event_id.clone(), err.to_string()))?;
            }
        }

        let event = Event::from_json(event_id.clone(), room_version, event)
            .map_err(|err| StoreError::InvalidEvent(event_id.clone(), err.to_string()))?;
        trace!(%event_id, event_type = event.event_type(), "received event");

        Ok(event)
    }
}

/// [`EventStore`] fetching events through a session, parsed with the room version of one request.
#[derive(Clone, Copy)]
pub struct SessionStore<'a> {
    session: &'a Session,
    room_version: RoomVersion,
}

impl SessionStore<'_> {
    pub fn room_version(&self) -> RoomVersion {
        self.room_version
    }
}

#[async_trait]
impl EventStore for SessionStore<'_> {
    async fn get_event(&self, event_id: &EventId) -> Result<Event, StoreError> {
        self.session.fetch_event(event_id, self.room_version).await
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("outbound channel of the session is closed")]
    Closed,

    #[error(transparent)]
    Message(#[from] MessageError),
}
