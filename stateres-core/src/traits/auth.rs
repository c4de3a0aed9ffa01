// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{Event, EventId};
use crate::traits::store::{EventStore, StoreError};

/// Authorization rules deciding whether a single event is allowed.
#[async_trait]
pub trait AuthChecker: Send + Sync {
    /// Checks which only depend on the event itself and the auth events it references.
    async fn check_independent(
        &self,
        store: &dyn EventStore,
        event: &Event,
    ) -> Result<(), AuthError>;

    /// Checks against the given room state, usually the outcome of state resolution.
    fn check_dependent(&self, event: &Event, state: &[Event]) -> Result<(), AuthError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("event {0} failed auth checks: {1}")]
    Rejected(EventId, String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Returns `true` if the event was rejected by the rules, `false` if the checks could not be
    /// carried out.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::Rejected(_, _))
    }
}
