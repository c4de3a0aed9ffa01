// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data-types and graph algorithms for resolving room state against a partial, lazily fetched
//! view of an event DAG.
//!
//! Events are immutable and content-addressed, every event names the events its authorization
//! depends on ("auth events"). Starting from a handful of known event ids, [`auth_chain`] walks
//! these edges through an [`EventStore`](traits::EventStore) which is free to fetch missing events
//! from wherever they live.
pub mod auth;
pub mod auth_chain;
pub mod event;
pub mod event_id;
pub mod memory;
pub mod resolver;
pub mod room_version;
pub mod state_key;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;

pub use auth::RuleAuthChecker;
pub use auth_chain::{auth_chain, auth_chain_difference};
pub use event::{Event, EventError, EventId};
pub use memory::MemoryEventStore;
pub use resolver::IterativeResolver;
pub use room_version::{EventIdFormat, RoomVersion, RoomVersionError};
pub use state_key::{StateKey, StateKeyError, StateMap};
pub use traits::{AuthChecker, AuthError, EventStore, ResolveError, Resolver, StoreError};
