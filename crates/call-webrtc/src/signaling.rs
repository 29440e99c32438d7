use std::sync::Mutex;

use async_trait::async_trait;
use call_session::protocol::{ClientMessage, RelayMessage};
use call_session::transport::{SignalingChannel, SignalingError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

/// Relay connection over a WebSocket. A writer task drains outbound
/// messages; a reader task decodes inbound frames for the single subscriber.
pub struct WsSignalingChannel {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
    reader: JoinHandle<()>,
}

impl WsSignalingChannel {
    pub async fn connect(relay_url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(relay_url)
            .map_err(|err| SignalingError::Connect(format!("invalid relay url: {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SignalingError::Connect(format!(
                "relay url must use ws or wss, got {}",
                url.scheme()
            )));
        }
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "webrtc", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayMessage>();

        // Ends once every sender is dropped, after flushing what was queued.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to encode relay message");
                        continue;
                    }
                };
                tracing::trace!(target = "webrtc", event = "ws_out", len = text.len());
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target = "webrtc", "dropping non-utf8 relay frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                        tracing::debug!(target = "webrtc", "relay websocket closed");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", "relay websocket error: {err}");
                        break;
                    }
                };
                tracing::trace!(target = "webrtc", event = "ws_in", len = text.len());
                match RelayMessage::decode(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "dropping relay frame");
                    }
                }
            }
        });

        Ok(Self {
            outbound,
            inbound: Mutex::new(Some(inbound_rx)),
            reader,
        })
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::Closed)
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RelayMessage>, SignalingError> {
        self.inbound
            .lock()
            .map_err(|_| SignalingError::Closed)?
            .take()
            .ok_or(SignalingError::AlreadySubscribed)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
