//! WebSocket signaling client
//!
//! Carries JSON signaling messages between this endpoint and the signaling
//! server. Outbound messages are queued to a dedicated writer task; inbound
//! text frames are decoded and handed to the caller through a channel.

use crate::config::SignalingConfig;
use crate::webrtc::{SignalingChannel, SignalingMessage, WebRTCError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Signaling channel over a client WebSocket connection
pub struct WebSocketSignaling {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WebSocketSignaling {
    /// Connect to the configured signaling server.
    ///
    /// Returns the channel together with the stream of decoded inbound
    /// messages. The stream ends when the server closes the socket.
    pub async fn connect(
        config: &SignalingConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>), WebRTCError> {
        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let connect = tokio_tungstenite::connect_async(config.url.as_str());
        let (ws_stream, _response) = time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                WebRTCError::SignalingError(format!("Timed out connecting to {}", config.url))
            })?
            .map_err(|e| {
                WebRTCError::SignalingError(format!("Failed to connect to {}: {}", config.url, e))
            })?;

        info!("Connected to signaling server {}", config.url);

        let (write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();

        let writer = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let pong_tx = outbound_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            debug!("Received {} for call {}", message.kind(), message.call_id);
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed signaling message: {}", e),
                    },
                    Ok(Message::Ping(ping)) => {
                        let _ = pong_tx.send(Message::Pong(ping));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling socket error: {}", e);
                        break;
                    }
                }
            }
            info!("Signaling connection closed");
        });

        Ok((
            Self {
                outbound: outbound_tx,
                reader,
                writer,
            },
            inbound_rx,
        ))
    }

    /// Send a close frame and stop reading
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn send(&self, message: SignalingMessage) -> Result<(), WebRTCError> {
        let text = message.to_json()?;
        debug!("Sending {} for call {}", message.kind(), message.call_id);
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| WebRTCError::Closed)
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
