// SPDX-License-Identifier: MIT OR Apache-2.0

//! Answers state resolution requests of a remote peer over a single WebSocket connection.
//!
//! The remote owns the event graph. It sends `resolve_state` requests and the shim resolves them,
//! fetching every event it needs back from the remote with correlated `get_event` requests over
//! the same connection. Each connection is served by its own [`Session`](session::Session) which
//! caches fetched events until the connection closes.
//!
//! ## Example
//!
//! ```no_run
//! use stateres_shim::{Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), stateres_shim::ServerError> {
//! let server = Server::bind(Config::default()).await?;
//! server.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
pub mod cache;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod message;
pub mod resolution;
pub mod server;
pub mod session;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use cache::EventCache;
pub use config::Config;
pub use correlation::{CorrelationError, CorrelationTable};
pub use dispatcher::Dispatcher;
pub use message::{MessageError, MessageKind, WireMessage};
pub use resolution::{Collaborators, ResolutionTask, Stage};
pub use server::{Server, ServerError};
pub use session::{Session, SessionError, SessionStore};
