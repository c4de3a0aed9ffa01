// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairs outbound requests with the responses arriving later on the same connection.
use std::collections::HashMap;
use std::collections::hash_map::Entry;

use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::trace;
use uuid::Uuid;

/// Outstanding requests keyed by their correlation id.
///
/// Every entry is a single-assignment slot: it's filled at most once by
/// [`CorrelationTable::complete`] and read at most once by the issuer through the receiver handed
/// out by [`CorrelationTable::issue`]. Ids can be reused after completion.
#[derive(Debug)]
pub struct CorrelationTable<T> {
    pending: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new outstanding request under a freshly generated id.
    pub async fn issue(&self) -> (String, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        loop {
            let id = Uuid::new_v4().to_string();
            if let Entry::Vacant(entry) = pending.entry(id.clone()) {
                entry.insert(tx);
                trace!(%id, "issued correlation id");
                return (id, rx);
            }
        }
    }

    /// Hand the response to whoever waits for the request with this id.
    pub async fn complete(&self, id: &str, value: T) -> Result<(), CorrelationError> {
        let tx = self
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| CorrelationError::UnknownId(id.to_owned()))?;

        tx.send(value)
            .map_err(|_| CorrelationError::Abandoned(id.to_owned()))
    }

    /// Forget a request, its waiter will not receive a response.
    ///
    /// Returns `true` if the id was outstanding.
    pub async fn cancel(&self, id: &str) -> bool {
        self.pending.lock().await.remove(id).is_some()
    }

    /// Forget all outstanding requests, returning how many there were.
    ///
    /// Waiters observe their receiver being closed.
    pub async fn clear(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        pending.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    /// No request with this id is outstanding, it was never issued or already completed.
    #[error("no outstanding request with id {0}")]
    UnknownId(String),

    /// The issuer stopped waiting before the response arrived.
    #[error("request {0} was abandoned by its issuer")]
    Abandoned(String),
}
