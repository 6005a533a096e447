//! WebSocket client for the session server.
//!
//! Frames are decoded on a background reader task and delivered through an
//! mpsc channel; [`SessionClient::next_event`] waits on that channel with a
//! timeout. The channel closes when the server closes the socket.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, CursorMove, JoinShare, ProtocolError, ServerEvent, TextChange, Typing};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection closed")]
    Closed,
}

pub struct SessionClient {
    writer: WsSink,
    events: mpsc::Receiver<ServerEvent>,
    reader: JoinHandle<()>,
}

impl SessionClient {
    /// Connect to a URL such as `ws://127.0.0.1:9090`, or a prepared
    /// request carrying extra headers.
    pub async fn connect<R>(request: R) -> Result<Self, ClientError>
    where
        R: IntoClientRequest + Unpin,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (writer, mut ws_reader) = ws_stream.split();
        let (event_tx, events) = mpsc::channel(256);

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Self { writer, events, reader })
    }

    pub async fn send(&mut self, event: &ClientEvent) -> Result<(), ClientError> {
        let frame = event.encode()?;
        self.send_raw(Message::text(frame)).await
    }

    /// Send a frame as-is.
    pub async fn send_raw(&mut self, message: Message) -> Result<(), ClientError> {
        self.writer.send(message).await.map_err(|_| ClientError::Closed)
    }

    pub async fn join(
        &mut self,
        room_id: &str,
        display_name: Option<&str>,
        secret: Option<&str>,
    ) -> Result<(), ClientError> {
        self.send(&ClientEvent::JoinShare(JoinShare {
            room_id: room_id.to_string(),
            display_name: display_name.map(str::to_string),
            secret: secret.map(str::to_string),
        }))
        .await
    }

    pub async fn send_text(&mut self, room_id: &str, text: &str, language: Option<&str>) -> Result<(), ClientError> {
        self.send(&ClientEvent::TextChange(TextChange {
            room_id: room_id.to_string(),
            text_content: text.to_string(),
            language: language.map(str::to_string),
        }))
        .await
    }

    pub async fn typing(&mut self, room_id: &str, is_typing: bool) -> Result<(), ClientError> {
        self.send(&ClientEvent::Typing(Typing {
            room_id: room_id.to_string(),
            is_typing,
        }))
        .await
    }

    pub async fn cursor(&mut self, room_id: &str, position: Value) -> Result<(), ClientError> {
        self.send(&ClientEvent::CursorMove(CursorMove {
            room_id: room_id.to_string(),
            position,
        }))
        .await
    }

    /// Next server event, or `None` on timeout or once the socket closed.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<ServerEvent> {
        tokio::time::timeout(timeout, self.events.recv()).await.ok().flatten()
    }

    /// Skip events until one matches `pred`.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&ServerEvent) -> bool,
    ) -> Option<ServerEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv()).await.ok()??;
            if pred(&event) {
                return Some(event);
            }
        }
    }

    /// Wait until the server closes the connection. Returns `false` on timeout.
    pub async fn closed(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.writer.send(Message::Close(None)).await;
        let _ = self.writer.close().await;
        self.reader.abort();
    }
}
