// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolves the state of one `resolve_state` request and authorizes its proposed event.
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use stateres_core::event_id::reference_event_id;
use stateres_core::{
    AuthChecker, AuthError, Event, EventError, EventId, EventStore, IterativeResolver, Resolver,
    RoomVersion, RuleAuthChecker, StateKey, StateMap, StoreError,
};

use crate::message::{ResolveStateRequest, ResolveStateResponse};
use crate::session::{Session, SessionError, SessionStore};

/// External algorithms a resolution task delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn Resolver>,
    pub auth_checker: Arc<dyn AuthChecker>,
}

impl Collaborators {
    pub fn new(
        resolver: impl Resolver + 'static,
        auth_checker: impl AuthChecker + 'static,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            auth_checker: Arc::new(auth_checker),
        }
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::new(
            IterativeResolver::new(RuleAuthChecker::new()),
            RuleAuthChecker::new(),
        )
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Progress of a resolution task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    FetchingState,
    AuthCheck,
    Responding,
    Done,
}

/// Task answering a single `resolve_state` request.
pub struct ResolutionTask {
    session: Session,
    collaborators: Collaborators,
    id: String,
    request: ResolveStateRequest,
}

impl ResolutionTask {
    pub fn new(
        session: Session,
        collaborators: Collaborators,
        id: String,
        request: ResolveStateRequest,
    ) -> Self {
        debug!(stage = ?Stage::Received, %id, room_id = %request.room_id, "resolve_state request");
        Self {
            session,
            collaborators,
            id,
            request,
        }
    }

    /// Resolve, then send the response to the remote.
    pub async fn run(self) -> Result<(), SessionError> {
        let response = self.respond().await;
        debug!(
            stage = ?Stage::Responding,
            error = %response.error,
            "sending resolve_state response"
        );
        self.session.send_result(&self.id, &response).await?;
        debug!(stage = ?Stage::Done, "resolve_state done");
        Ok(())
    }

    /// Compute the response to the request.
    ///
    /// Never fails: failures are reported through the response's `error` field. Resolution
    /// failures leave the result empty, failed authorization of the proposed event only omits
    /// that event from the result.
    pub async fn respond(&self) -> ResolveStateResponse {
        let room_version = RoomVersion::from_tag_or(
            &self.request.room_version,
            self.session.config().default_room_version,
        );
        let store = self.session.store(room_version);

        debug!(
            stage = ?Stage::FetchingState,
            %room_version,
            state_sets = self.request.state.len(),
            "resolving state"
        );
        let mut result = match self
            .collaborators
            .resolver
            .resolve(
                &self.request.room_id,
                room_version,
                &self.request.state,
                &store,
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(%err, "state resolution failed");
                return ResolveStateResponse {
                    result: StateMap::new(),
                    error: err.to_string(),
                };
            }
        };

        let mut error = String::new();
        if let Some(proposed) = self.proposed_state_event() {
            debug!(stage = ?Stage::AuthCheck, "authorizing proposed event");
            match self
                .authorize(proposed, room_version, &store, &result)
                .await
            {
                Ok((key, event_id)) => {
                    debug!(%event_id, %key, "proposed event passes auth checks");
                    result.insert(key, event_id);
                }
                Err(err) => {
                    warn!(%err, "proposed event failed auth checks");
                    error = err.to_string();
                }
            }
        }

        ResolveStateResponse { result, error }
    }

    /// The proposed event, if it is a state event.
    fn proposed_state_event(&self) -> Option<&Value> {
        self.request
            .event
            .as_ref()
            .filter(|event| event.get("state_key").is_some_and(|key| !key.is_null()))
    }

    /// Run both authorization phases on the proposed event.
    ///
    /// Returns the key and id to insert into the resolved state on success.
    async fn authorize(
        &self,
        proposed: &Value,
        room_version: RoomVersion,
        store: &SessionStore<'_>,
        resolved: &StateMap<EventId>,
    ) -> Result<(StateKey, EventId), ProposedEventError> {
        let event = parse_proposed_event(proposed, room_version)?;
        let key = event.key().ok_or(ProposedEventError::NotState)?;

        let auth_checker = &self.collaborators.auth_checker;
        auth_checker.check_independent(store, &event).await?;

        let current_ids: Vec<EventId> = resolved.values().cloned().collect();
        let current_state: Vec<Event> = store
            .get_events(&current_ids)
            .await?
            .into_values()
            .collect();
        auth_checker.check_dependent(&event, &current_state)?;

        Ok((key, event.id().clone()))
    }
}

/// Build the proposed event, taking its id from the payload or its content hash.
fn parse_proposed_event(
    proposed: &Value,
    room_version: RoomVersion,
) -> Result<Event, ProposedEventError> {
    let Value::Object(payload) = proposed else {
        return Err(EventError::NotAnObject.into());
    };

    let event_id = match payload.get("event_id").and_then(Value::as_str) {
        Some(event_id) => EventId::from(event_id),
        None => reference_event_id(room_version, payload)
            .ok_or(ProposedEventError::NoEventId)?,
    };

    Ok(Event::from_json(event_id, room_version, proposed.clone())?)
}

#[derive(Debug, Error)]
enum ProposedEventError {
    #[error("invalid proposed event: {0}")]
    Invalid(#[from] EventError),

    #[error("proposed event has no event id and none can be derived in this room version")]
    NoEventId,

    #[error("proposed event is not a state event")]
    NotState,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
