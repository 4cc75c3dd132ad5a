//! IPC server: the datastore side of the framed Unix-socket protocol.
//!
//! One gateway connection is one framed stream. Frames are handled
//! sequentially per connection: the store has a single writer, and serial
//! handling is also what keeps fire-and-forget events best-effort ordered.
//! Request-lane frames produce exactly one reply carrying the same
//! correlation id; handler failures travel back as a non-empty error string.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{error, info, warn};

use rslive_shared::error::WIRE_INTERNAL_ERROR;
use rslive_shared::frame::{decode_request, encode_response, RequestFrame, IPC_HIGH_WATER};
use rslive_shared::schema::{Lane, MessageType};

use crate::service::DataService;

pub struct IpcServer {
    listener: UnixListener,
    service: Arc<DataService>,
}

impl IpcServer {
    /// Binds the listener, clearing any stale socket file left behind by an
    /// unclean shutdown.
    pub fn bind(socket_path: &Path, service: Arc<DataService>) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        Ok(Self { listener, service })
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            info!("gateway connected");
            let service = self.service.clone();
            tokio::spawn(async move {
                handle_connection(stream, service).await;
                info!("gateway disconnected");
            });
        }
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<DataService>) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = framed.split();

    // Bounded reply lane; a stalled peer sheds replies instead of memory.
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(IPC_HIGH_WATER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if let Err(e) = sink.send(Bytes::from(frame)).await {
                error!("IPC reply write failed: {e}");
                break;
            }
        }
    });

    while let Some(next) = stream.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("IPC read failed: {e}");
                break;
            }
        };
        let Ok(raw) = std::str::from_utf8(&bytes) else {
            warn!("dropping non-UTF-8 frame");
            continue;
        };
        handle_frame(raw, &service, &reply_tx).await;
    }

    drop(reply_tx);
    let _ = writer.await;
}

async fn handle_frame(raw: &str, service: &Arc<DataService>, reply_tx: &mpsc::Sender<String>) {
    let frame = match decode_request(raw) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("dropping undecodable frame: {e}");
            return;
        }
    };

    let service = service.clone();
    match frame.msg_type.lane() {
        Lane::Oneway => {
            let result =
                tokio::task::spawn_blocking(move || dispatch_oneway(&service, &frame)).await;
            if let Err(e) = result {
                error!("oneway handler panicked: {e}");
            }
        }
        Lane::Request => {
            let correlation_id = frame.correlation_id;
            let reply =
                match tokio::task::spawn_blocking(move || dispatch_request(&service, &frame))
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("request handler panicked: {e}");
                        encode_response(correlation_id, WIRE_INTERNAL_ERROR, &[])
                    }
                };
            if reply_tx.try_send(reply).is_err() {
                warn!("IPC reply lane full, dropping response {correlation_id}");
            }
        }
    }
}

fn dispatch_request(service: &DataService, frame: &RequestFrame) -> String {
    match frame.msg_type {
        MessageType::ValidateAndLoad => {
            let outcome = service.validate_and_load(frame.arg(0), frame.arg(1));
            encode_response(
                frame.correlation_id,
                &outcome.error,
                &[
                    &outcome.account_id,
                    &outcome.session_data,
                    &outcome.credits.to_string(),
                ],
            )
        }
        MessageType::GetCredits => match service.get_credits(frame.arg(0)) {
            Ok(credits) => {
                encode_response(frame.correlation_id, "", &[&credits.to_string()])
            }
            Err(e) => {
                error!("get_credits failed: {e:#}");
                encode_response(frame.correlation_id, WIRE_INTERNAL_ERROR, &["0"])
            }
        },
        other => {
            // Lane dispatch keeps oneway types out of here.
            error!("{other} is not a request type");
            encode_response(frame.correlation_id, WIRE_INTERNAL_ERROR, &[])
        }
    }
}

fn dispatch_oneway(service: &DataService, frame: &RequestFrame) {
    match frame.msg_type {
        MessageType::UpdateUsage => service.update_usage(
            frame.arg(0),
            frame.arg(1),
            frame.arg(2),
            frame.num_arg(3),
            frame.num_arg(4),
        ),
        MessageType::SaveSession => {
            service.save_session(frame.arg(0), frame.arg(1), frame.arg(2));
        }
        MessageType::AppendConversation => {
            service.append_conversation(frame.arg(0), frame.arg(1), frame.arg(2));
        }
        other => error!("{other} is not a oneway type"),
    }
}
