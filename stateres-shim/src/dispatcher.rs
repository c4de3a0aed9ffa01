// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demultiplexes inbound messages of one connection.
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::Semaphore;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::message::{MessageKind, ResolveStateRequest, WireMessage};
use crate::resolution::{Collaborators, ResolutionTask};
use crate::session::Session;

/// Receive loop of a connection.
///
/// Responses to our `get_event` requests complete the matching pending fetch, `resolve_state`
/// requests are each handed to a new task. The loop never waits for a resolution task, running
/// tasks are bounded by the configured maximum and later requests wait for a free slot.
pub struct Dispatcher {
    session: Session,
    collaborators: Collaborators,
    admission: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(session: Session, collaborators: Collaborators) -> Self {
        let admission = Arc::new(Semaphore::new(session.config().max_concurrent_resolutions));
        Self {
            session,
            collaborators,
            admission,
            tasks: TaskTracker::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Consume inbound WebSocket frames until the connection closes or the session is cancelled.
    pub async fn run<S>(&self, mut inbound: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let token = self.session.token().clone();
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("dispatcher received shutdown signal");
                    break;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.handle_frame(text).await,
                        Err(err) => warn!(%err, "dropping binary frame which is not utf-8"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("connection closed by remote");
                        break;
                    }
                    // Pings are answered by the protocol implementation.
                    Some(Ok(_)) => (),
                    Some(Err(err)) => {
                        warn!(%err, "failed receiving frame");
                        break;
                    }
                },
            }
        }
    }

    /// Handle a single text frame.
    ///
    /// Malformed messages are logged and dropped, they never stop the loop.
    pub async fn handle_frame(&self, text: &str) {
        match WireMessage::decode(text) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => warn!(%err, "dropping malformed message"),
        }
    }

    pub async fn handle_message(&self, message: WireMessage) {
        debug!(id = %message.id, kind = %message.kind, "received message");
        match message.kind {
            MessageKind::GetEvent => {
                if let Err(err) = self.session.complete(message).await {
                    warn!(%err, "dropping get_event response");
                }
            }
            MessageKind::ResolveState => match message.data::<ResolveStateRequest>() {
                Ok(request) => self.spawn_resolution(message.id, request),
                Err(err) => warn!(id = %message.id, %err, "dropping resolve_state request"),
            },
            MessageKind::Unknown => {
                warn!(id = %message.id, "ignoring message of unknown type");
            }
        }
    }

    fn spawn_resolution(&self, id: String, request: ResolveStateRequest) {
        let span = debug_span!("resolve_state", id = %id, room_id = %request.room_id);
        let task = ResolutionTask::new(
            self.session.clone(),
            self.collaborators.clone(),
            id,
            request,
        );
        let admission = self.admission.clone();
        let token = self.session.token().clone();

        self.tasks.spawn(
            async move {
                let _permit = tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!("session closed before resolution started");
                        return;
                    }
                    permit = admission.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                if let Err(err) = task.run().await {
                    error!(%err, "could not send resolve_state response");
                }
            }
            .instrument(span),
        );
    }

    /// Number of resolution tasks not finished yet.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Close the session and wait for all resolution tasks to finish.
    pub async fn shutdown(self) {
        self.tasks.close();
        self.session.close().await;
        self.tasks.wait().await;
    }
}
