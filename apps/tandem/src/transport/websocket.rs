use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_bus::{RelayChannel, RelayError, RelayResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

/// Builds `<base>/ws/chat/<room>/`, switching http(s) bases to ws(s).
pub fn room_url(base: &str, room: &str) -> RelayResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|err| RelayError::Transport(format!("invalid relay url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RelayError::Transport(format!(
                "unsupported relay scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RelayError::Transport("invalid websocket scheme".into()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| RelayError::Transport("cannot mutate relay url path".into()))?;
        segments.pop_if_empty();
        segments.push("ws");
        segments.push("chat");
        segments.push(room);
        segments.push("");
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Relay channel over the chat room websocket.
pub struct WebSocketRelay {
    send_tx: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    open: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketRelay {
    pub async fn connect(url: &Url) -> RelayResult<Arc<Self>> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| RelayError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: "tandem::relay", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Bytes>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        let writer_handle = tokio::spawn(async move {
            while let Some(payload) = send_rx.recv().await {
                let text = match String::from_utf8(payload.to_vec()) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target: "tandem::relay", error = %err, "dropping non-utf8 payload");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            let _ = ws_write.close().await;
        });

        let reader_open = Arc::clone(&open);
        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let payload = match msg {
                    Ok(Message::Text(text)) => Bytes::from(text),
                    Ok(Message::Binary(data)) => Bytes::from(data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "tandem::relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "tandem::relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target: "tandem::relay", event = "ws_in", len = payload.len());
                if inbound_tx.send(payload).is_err() {
                    break;
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok(Arc::new(Self {
            send_tx,
            inbound: Mutex::new(Some(inbound_rx)),
            open,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        }))
    }
}

impl RelayChannel for WebSocketRelay {
    fn send(&self, payload: Bytes) -> RelayResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        self.send_tx.send(payload).map_err(|_| RelayError::Closed)
    }

    fn inbound(&self) -> RelayResult<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.lock().take().ok_or(RelayError::InboundTaken)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketRelay {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
