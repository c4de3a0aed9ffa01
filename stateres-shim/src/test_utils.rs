// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process remote peer for tests.
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use stateres_core::EventId;

use crate::config::Config;
use crate::message::{GetEventRequest, MessageKind, WireMessage};
use crate::session::Session;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Remote peer serving events from memory.
///
/// Requests for unknown events are recorded but never answered.
#[derive(Clone, Debug, Default)]
pub struct FakeRemote {
    events: HashMap<EventId, Value>,
    failures: HashMap<EventId, String>,
}

impl FakeRemote {
    pub fn new(events: impl IntoIterator<Item = (EventId, Value)>) -> Self {
        Self {
            events: events.into_iter().collect(),
            failures: HashMap::new(),
        }
    }

    /// Answer requests for this event with an error.
    pub fn fail(mut self, event_id: EventId, error: &str) -> Self {
        self.failures.insert(event_id, error.to_owned());
        self
    }

    /// Respond to an event request, `None` if the remote stays silent.
    pub fn respond(&self, request: &WireMessage) -> Option<WireMessage> {
        let GetEventRequest { event_id } = request.data().ok()?;
        if let Some(error) = self.failures.get(&event_id) {
            return Some(
                WireMessage::new(request.id.clone(), MessageKind::GetEvent, json!({}))
                    .with_error(error.clone()),
            );
        }
        let event = self.events.get(&event_id)?;
        Some(WireMessage::new(
            request.id.clone(),
            MessageKind::GetEvent,
            json!({ "event": event }),
        ))
    }

    /// Create a session whose outbound messages are handled by this remote.
    pub fn connect(self, config: Config) -> RemoteHandle {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(config.outbound_buffer);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let session = Session::new(config, outbound_tx, CancellationToken::new());
        let requests = Arc::new(Mutex::new(Vec::new()));

        {
            let session = session.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    if message.kind != MessageKind::GetEvent {
                        results_tx.send(message).ok();
                        continue;
                    }

                    if let Ok(GetEventRequest { event_id }) = message.data() {
                        requests.lock().await.push(event_id);
                    }
                    if let Some(response) = self.respond(&message) {
                        session.complete(response).await.ok();
                    }
                }
            });
        }

        RemoteHandle {
            session,
            requests,
            results: results_rx,
        }
    }
}

/// Session connected to a [`FakeRemote`].
pub struct RemoteHandle {
    pub session: Session,
    requests: Arc<Mutex<Vec<EventId>>>,
    results: mpsc::UnboundedReceiver<WireMessage>,
}

impl RemoteHandle {
    /// Event ids requested so far, in order.
    pub async fn requests(&self) -> Vec<EventId> {
        self.requests.lock().await.clone()
    }

    /// Next non-request message the session sent.
    pub async fn next_message(&mut self) -> Option<WireMessage> {
        self.results.recv().await
    }
}
