//! WebSocket connection to the signaling relay

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::RelayMessage;
use super::Signaler;
use crate::channels::ReadyState;
use crate::peer::SessionDescription;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Relay socket: the host's [`Signaler`] and source of relay messages
pub struct RelaySocket {
    url: String,
    outgoing: mpsc::UnboundedSender<WsMessage>,
    state: Arc<Mutex<ReadyState>>,
}

impl RelaySocket {
    /// Connect to `url` and start the background send/receive tasks
    ///
    /// Parsed relay messages arrive on the returned receiver, which closes
    /// when the socket does.
    pub async fn connect(url: &str) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<RelayMessage>)> {
        info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling relay");

        let (write, read) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ReadyState::Open));

        tokio::spawn(Self::sender_task(write, outgoing_rx, Arc::clone(&state)));
        tokio::spawn(Self::receiver_task(read, inbox, Arc::clone(&state)));

        let socket = Arc::new(Self {
            url: url.to_string(),
            outgoing,
            state,
        });
        Ok((socket, inbox_rx))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue one relay message
    pub fn send_message(&self, message: &RelayMessage) -> Result<()> {
        let text = message.to_json()?;
        self.enqueue(WsMessage::Text(text))
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == ReadyState::Open
    }

    /// Send a close frame; later calls do nothing
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if matches!(*state, ReadyState::Closing | ReadyState::Closed) {
                return Ok(());
            }
            *state = ReadyState::Closing;
        }
        debug!(url = %self.url, code, "Closing relay socket");
        self.enqueue(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })))
    }

    fn enqueue(&self, message: WsMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| Error::WebSocketError(format!("Relay socket {} is closed", self.url)))
    }

    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, WsMessage>,
        mut rx: mpsc::UnboundedReceiver<WsMessage>,
        state: Arc<Mutex<ReadyState>>,
    ) {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if let Err(e) = write.send(message).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        *state.lock() = ReadyState::Closed;
        debug!("Relay sender task terminated");
    }

    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbox: mpsc::UnboundedSender<RelayMessage>,
        state: Arc<Mutex<ReadyState>>,
    ) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => match RelayMessage::from_json(&text) {
                    Ok(RelayMessage::Unknown) => {
                        warn!("Ignoring unknown relay message: {}", text);
                    }
                    Ok(message) => {
                        if inbox.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to parse relay message: {}", e),
                },
                Ok(WsMessage::Close(_)) => {
                    info!("Relay connection closed");
                    break;
                }
                Err(e) => {
                    error!("Relay WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        *state.lock() = ReadyState::Closed;
        debug!("Relay receiver task terminated");
    }
}

#[async_trait]
impl Signaler for RelaySocket {
    async fn send_answer(&self, peer_id: &str, answer: &SessionDescription) -> Result<()> {
        self.send_message(&RelayMessage::HostAnswer {
            joiner_id: peer_id.to_string(),
            answer: answer.clone(),
        })
    }

    async fn send_ice_candidate(&self, peer_id: &str, candidate: &Value) -> Result<()> {
        self.send_message(&RelayMessage::HostIceCandidate {
            joiner_id: peer_id.to_string(),
            candidate: candidate.clone(),
        })
    }
}
