//! Outbound WebSocket connection to the realtime provider.
//!
//! The connection reports upstream activity through a nullable handler
//! slot. `disconnect()` nulls the slot *before* the socket goes down, so an
//! explicit disconnect silences every still-pending callback. That is the
//! entire mechanism distinguishing an explicit close from an unexpected
//! one, and it is why `on_close` never needs a should-reconnect flag.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, warn};

/// Close code reported when the transport dies without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// Callback events delivered to the owning orchestrator.
#[derive(Debug)]
pub enum UpstreamEvent {
    Connected,
    Message(String),
    Error(String),
    Closed { code: u16, reason: String },
}

type HandlerSlot = Arc<Mutex<Option<mpsc::UnboundedSender<UpstreamEvent>>>>;

pub struct UpstreamConnection {
    url: String,
    bearer: String,
    handler: HandlerSlot,
    out_tx: mpsc::UnboundedSender<Message>,
    // Taken by connect(); a second connect on the same instance is a no-op.
    out_rx: Option<mpsc::UnboundedReceiver<Message>>,
    io_task: Option<tokio::task::JoinHandle<()>>,
}

impl UpstreamConnection {
    pub fn new(url: &str, bearer: &str, handler: mpsc::UnboundedSender<UpstreamEvent>) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Self {
            url: url.to_string(),
            bearer: bearer.to_string(),
            handler: Arc::new(Mutex::new(Some(handler))),
            out_tx,
            out_rx: Some(out_rx),
            io_task: None,
        }
    }

    /// Starts the connection attempt. All outcomes are reported through the
    /// handler: a failed connect surfaces as `Error` followed by `Closed`,
    /// so the owner's reconnect path is uniform.
    pub fn connect(&mut self) {
        let Some(out_rx) = self.out_rx.take() else {
            warn!("connect called twice on one upstream connection");
            return;
        };
        let url = self.url.clone();
        let bearer = self.bearer.clone();
        let handler = self.handler.clone();
        self.io_task = Some(tokio::spawn(run_connection(url, bearer, out_rx, handler)));
    }

    /// Queues a frame for the provider. Payloads are already JSON text;
    /// ordering is the channel's FIFO.
    pub fn send(&self, payload: &str) {
        let _ = self.out_tx.send(Message::Text(payload.to_string()));
    }

    /// Nulls the handler, then closes the socket. Idempotent.
    pub fn disconnect(&mut self) {
        self.handler.lock().unwrap().take();
        let _ = self.out_tx.send(Message::Close(None));
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }

    /// A connection with no network behind it; outbound frames land on the
    /// returned receiver. `connect()` on it is a no-op.
    #[cfg(test)]
    pub(crate) fn stub(
        handler: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self {
                url: "ws://stub.invalid".to_string(),
                bearer: String::new(),
                handler: Arc::new(Mutex::new(Some(handler))),
                out_tx,
                out_rx: None,
                io_task: None,
            },
            out_rx,
        )
    }
}

fn emit(handler: &HandlerSlot, event: UpstreamEvent) {
    if let Some(tx) = handler.lock().unwrap().as_ref() {
        let _ = tx.send(event);
    }
}

async fn run_connection(
    url: String,
    bearer: String,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    handler: HandlerSlot,
) {
    let mut request = match url.as_str().into_client_request() {
        Ok(request) => request,
        Err(e) => {
            emit(&handler, UpstreamEvent::Error(format!("bad upstream url: {e}")));
            emit(
                &handler,
                UpstreamEvent::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: "bad upstream url".to_string(),
                },
            );
            return;
        }
    };
    match format!("Bearer {bearer}").parse() {
        Ok(value) => {
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(e) => {
            emit(&handler, UpstreamEvent::Error(format!("bad credential: {e}")));
            emit(
                &handler,
                UpstreamEvent::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: "bad credential".to_string(),
                },
            );
            return;
        }
    }

    let (ws, _response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("upstream connect failed: {e}");
            emit(&handler, UpstreamEvent::Error(e.to_string()));
            emit(
                &handler,
                UpstreamEvent::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: "connect failed".to_string(),
                },
            );
            return;
        }
    };
    emit(&handler, UpstreamEvent::Connected);

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Message::Close(frame)) => {
                    // Explicit disconnect; the handler is already nulled.
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        emit(&handler, UpstreamEvent::Error(e.to_string()));
                        emit(&handler, UpstreamEvent::Closed {
                            code: ABNORMAL_CLOSE,
                            reason: "write failed".to_string(),
                        });
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => emit(&handler, UpstreamEvent::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((ABNORMAL_CLOSE, String::new()));
                    emit(&handler, UpstreamEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(other)) => debug!("ignoring upstream frame: {other:?}"),
                Some(Err(e)) => {
                    emit(&handler, UpstreamEvent::Error(e.to_string()));
                    emit(&handler, UpstreamEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "read failed".to_string(),
                    });
                    break;
                }
                None => {
                    emit(&handler, UpstreamEvent::Closed {
                        code: ABNORMAL_CLOSE,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            }
        }
    }
}
