//! WebSocket transport binding a [`RealtimeChannel`] to a remote
//! authority.
//!
//! Two background tasks per connection: a writer draining the channel's
//! outbound frames into the socket, and a reader decoding authority
//! frames into the stream a [`Reconciler`] pumps. When the socket
//! closes, the inbound stream ends and the pump fails any requests
//! still in flight.
//!
//! [`RealtimeChannel`]: crate::channel::RealtimeChannel
//! [`Reconciler`]: crate::reconcile::Reconciler

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientFrame, ProtocolError, ServerFrame};

/// Connection state of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connected,
}

/// Handle to a live WebSocket connection.
pub struct WsTransport {
    state: Arc<RwLock<ConnState>>,
}

impl WsTransport {
    /// Connect to the authority at `url`.
    ///
    /// Takes the channel's outbound frame stream and returns the inbound
    /// stream to hand to a reconciler pump.
    pub async fn connect(
        url: &str,
        mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerFrame>), ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| {
                log::error!("connect to {url} failed: {e}");
                ProtocolError::ConnectionClosed
            })?;
        log::info!("connected to authority at {url}");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let state = Arc::new(RwLock::new(ConnState::Connected));

        // Writer task: outbound frames to the socket.
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("frame encode failed: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
        });

        // Reader task: socket frames to the inbound stream. Dropping
        // `in_tx` on exit ends the reconciler pump.
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(frame) => {
                                if in_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::error!("bad frame from authority: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnState::Disconnected;
            log::info!("authority connection closed");
        });

        Ok((Self { state }, in_rx))
    }

    pub async fn connection_state(&self) -> ConnState {
        *self.state.read().await
    }
}
