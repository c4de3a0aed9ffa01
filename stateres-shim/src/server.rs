// SPDX-License-Identifier: MIT OR Apache-2.0

//! WebSocket listener serving one session per connection.
use std::io;
use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::message::WireMessage;
use crate::resolution::Collaborators;
use crate::session::Session;

pub struct Server {
    listener: TcpListener,
    config: Config,
    collaborators: Collaborators,
}

impl Server {
    /// Bind the listening socket to the configured address.
    pub async fn bind(config: Config) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|err| ServerError::Bind(config.bind_addr, err))?;

        Ok(Self {
            listener,
            config,
            collaborators: Collaborators::default(),
        })
    }

    /// Use other resolver and auth rules than the built-in ones.
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled, then wait for open connections to wind
    /// down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!(addr = %self.local_addr()?, "listening");
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("server received shutdown signal");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(%err, "failed accepting connection");
                            continue;
                        }
                    };

                    let config = self.config.clone();
                    let collaborators = self.collaborators.clone();
                    let token = shutdown.child_token();
                    connections.spawn(
                        async move {
                            let served = serve_connection(stream, config, collaborators, token);
                            if let Err(err) = served.await {
                                warn!(%err, "connection failed");
                            }
                        }
                        .instrument(info_span!("connection", peer = %peer)),
                    );
                }
            }
        }

        connections.close();
        connections.wait().await;
        info!("server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: Config,
    collaborators: Collaborators,
    token: CancellationToken,
) -> Result<(), ServerError> {
    let websocket = accept_async(stream).await?;
    info!("connection opened");

    let (sink, inbound) = websocket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer);
    let writer = tokio::spawn(write_outbound(sink, outbound_rx).in_current_span());

    let session = Session::new(config, outbound_tx, token);
    let dispatcher = Dispatcher::new(session, collaborators);
    dispatcher.run(inbound).await;
    dispatcher.shutdown().await;

    // All senders are gone once the session is dropped, which ends the writer.
    if let Err(err) = writer.await {
        error!(%err, "outbound writer panicked");
    }
    info!("connection closed");
    Ok(())
}

/// Drain the outbound queue into the WebSocket.
async fn write_outbound(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<WireMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                error!(%err, id = %message.id, "dropping outbound message");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::text(text)).await {
            debug!(%err, "failed sending frame, stopping writer");
            break;
        }
    }
    sink.close().await.ok();
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("could not bind to {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}
