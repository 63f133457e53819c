//! WebSocket Transport
//!
//! Opens the socket and bridges it to a pair of channels, so the connection
//! manager only ever sees text frames in and text frames out.
//!
//! Dropping the link's `outgoing` sender closes the socket. The remote side
//! closing (or a read error) closes `incoming`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Frames buffered in each direction.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An open transport as seen by the connection manager.
#[derive(Debug)]
pub struct TransportLink {
    /// Text frames to write to the socket.
    pub outgoing: mpsc::Sender<String>,
    /// Text frames read from the socket. Yields `None` once the socket is gone.
    pub incoming: mpsc::Receiver<String>,
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket handshake or I/O failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Endpoint refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Something that can open a transport to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link. Each call produces an independent connection.
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError>;
}

/// Connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    channel_capacity: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self { channel_capacity: DEFAULT_CHANNEL_CAPACITY }
    }
}

impl WsConnector {
    /// Connector with a custom per-direction buffer size.
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self { channel_capacity: channel_capacity.max(1) }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, TransportError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(self.channel_capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel::<String>(self.channel_capacity);

        // Reader task
        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if incoming_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Server closed connection: {:?}", frame);
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring {} byte binary frame", data.len());
                    }
                    // Protocol-level ping/pong is answered by tungstenite.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            debug!("Reader task ended");
        });

        // Writer task
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Failed to send frame: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            reader_handle.abort();
            debug!("Writer task ended");
        });

        Ok(TransportLink {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
