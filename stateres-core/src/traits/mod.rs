// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the collaborators taking part in state resolution.
mod auth;
mod resolver;
mod store;

pub use auth::{AuthChecker, AuthError};
pub use resolver::{ResolveError, Resolver};
pub use store::{EventStore, StoreError};
