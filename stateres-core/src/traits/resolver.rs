// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use thiserror::Error;

use crate::event::EventId;
use crate::room_version::RoomVersion;
use crate::state_key::StateMap;
use crate::traits::store::{EventStore, StoreError};

/// Arbitration algorithm picking one consistent state from conflicting state sets.
///
/// Missing events are looked up through `store`, which might fetch them lazily.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        room_id: &str,
        room_version: RoomVersion,
        state_sets: &[StateMap<EventId>],
        store: &dyn EventStore,
    ) -> Result<StateMap<EventId>, ResolveError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("state resolution failed: {0}")]
    Custom(String),
}
