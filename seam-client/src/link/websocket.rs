use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::{ABNORMAL_CLOSE, Connector, Link, LinkEvent};
use crate::config::SessionConfig;
use crate::error::{ClientError, ClientResult};
use crate::types::TransportKind;

/// Opens WebSocket links at `<base_url><socket_path>`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    socket_path: String,
}

impl WebSocketConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
        }
    }
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`
pub(crate) fn socket_url(base_url: &str, path: &str) -> String {
    let base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    };
    format!("{}{}", base, path)
}

enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
struct WebSocketLink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(t) => write!(f, "Text({} bytes)", t.len()),
            Self::Close { code, .. } => write!(f, "Close({})", code),
        }
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&self, text: String) -> ClientResult<()> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| ClientError::WebSocket("link closed".to_string()))
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl Connector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn open(
        &self,
        base_url: &str,
    ) -> ClientResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let url = socket_url(base_url, &self.socket_path);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_socket(url, out_rx, event_tx));

        Ok((Arc::new(WebSocketLink { tx: out_tx }), event_rx))
    }
}

async fn run_socket(
    url: String,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let ws = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => match result {
            Ok((ws, _response)) => ws,
            Err(e) => {
                tracing::debug!(url = %url, "WebSocket connect failed: {}", e);
                let _ = events.send(LinkEvent::Error(e.to_string()));
                return;
            }
        },
        // Closed before the handshake finished
        cmd = out_rx.recv() => {
            if let Some(Outgoing::Close { code, reason }) = cmd {
                let _ = events.send(LinkEvent::Close { code, reason });
            }
            return;
        }
    };

    let _ = events.send(LinkEvent::Open);
    let (mut ws_sink, mut ws_stream) = ws.split();

    loop {
        tokio::select! {
            cmd = out_rx.recv() => match cmd {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                        let _ = events.send(LinkEvent::Error(e.to_string()));
                        return;
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = ws_sink.send(Message::Close(Some(frame))).await;
                    let _ = events.send(LinkEvent::Close { code, reason });
                    return;
                }
                None => {
                    let _ = ws_sink.close().await;
                    return;
                }
            },

            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(LinkEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.as_str().to_owned()),
                        None => (ABNORMAL_CLOSE, String::new()),
                    };
                    let _ = events.send(LinkEvent::Close { code, reason });
                    return;
                }
                Some(Err(e)) => {
                    let _ = events.send(LinkEvent::Error(e.to_string()));
                    return;
                }
                None => {
                    let _ = events.send(LinkEvent::Close {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    });
                    return;
                }
                _ => {} // Binary, Pong, Frame
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_scheme_mapping() {
        assert_eq!(
            socket_url("https://api.example.com", "/_seam/ws"),
            "wss://api.example.com/_seam/ws"
        );
        assert_eq!(
            socket_url("http://localhost:8080", "/ws"),
            "ws://localhost:8080/ws"
        );
    }
}
