//! Client WebSocket accept layer.
//!
//! Authenticates the upgrade request against the datastore, then runs the
//! session: one task owns the orchestrator and drains client frames,
//! upstream events, and credit-refresh completions, which serializes every
//! state mutation for the session.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use rslive_shared::{ErrorKind, MessageType};

use crate::orchestrator::{ClientFrame, Flow, Orchestrator, OrchestratorParams};
use crate::AppState;

/// The only provider the upstream path speaks today.
const SUPPORTED_PROVIDER: &str = "openai";

#[derive(Debug, Deserialize)]
pub struct RealtimeParams {
    rs_key: Option<String>,
    rs_sessid: Option<String>,
    rs_api: Option<String>,
}

pub async fn handle_realtime(
    ws: WebSocketUpgrade,
    Query(params): Query<RealtimeParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(api_key) = params.rs_key.filter(|k| !k.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(session_id) = params.rs_sessid.filter(|s| !s.is_empty()) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if let Some(provider) = params.rs_api.as_deref() {
        if provider != SUPPORTED_PROVIDER {
            warn!("rejecting unsupported provider {provider:?}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    }

    let response = match state
        .ipc
        .request(MessageType::ValidateAndLoad, &[&api_key, &session_id])
        .await
    {
        Ok(response) => response,
        Err(kind) => {
            warn!("datastore unavailable during upgrade: {kind}");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    if !response.is_ok() {
        return match ErrorKind::from_wire(&response.error) {
            ErrorKind::ExternalNoCredits => StatusCode::PAYMENT_REQUIRED,
            _ => StatusCode::FORBIDDEN,
        }
        .into_response();
    }

    let account_id = response.field(0).to_string();
    let session_data = response.field(1).to_string();
    let credits = response.num_field(2);
    info!("session {session_id} authorized for account {account_id} ({credits} credits)");

    ws.on_upgrade(move |socket| {
        run_session(socket, state, account_id, session_id, session_data, credits)
    })
}

async fn run_session(
    socket: WebSocket,
    state: Arc<AppState>,
    account_id: String,
    session_id: String,
    session_data: String,
    credits: i64,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientFrame>();
    let (upstream_events_tx, mut upstream_events_rx) = mpsc::unbounded_channel();
    let (credits_tx, mut credits_rx) = mpsc::unbounded_channel();

    // Upstream-to-client lane; the orchestrator's send side never awaits.
    let forwarder = tokio::spawn(async move {
        while let Some(frame) = client_rx.recv().await {
            let message = match frame {
                ClientFrame::Text(text) => WsMessage::Text(text),
                ClientFrame::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                })),
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut orchestrator = Orchestrator::new(OrchestratorParams {
        account_id,
        session_id: session_id.clone(),
        session_data,
        credits,
        upstream_url: state.upstream_url.clone(),
        upstream_bearer: state.openai_api_key.clone(),
        client_tx,
        upstream_events_tx,
        credits_tx,
        ipc: state.ipc.clone(),
    });
    orchestrator.connect();

    let failure: Option<ErrorKind> = loop {
        tokio::select! {
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Err(kind) = orchestrator.send(text) {
                        break Some(kind);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("client stream error on {session_id}: {e}");
                    break None;
                }
            },
            Some(event) = upstream_events_rx.recv() => {
                match orchestrator.handle_upstream_event(event) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::ClientGone) => break None,
                    Err(kind) => break Some(kind),
                }
            },
            Some(refreshed) = credits_rx.recv() => {
                orchestrator.apply_credits_refresh(refreshed);
            },
        }
    };

    if let Some(kind) = failure {
        info!("closing session {session_id}: {kind}");
        orchestrator.notify_client_closed(kind);
    }
    orchestrator.cleanup();
    drop(orchestrator);
    let _ = forwarder.await;
    info!("session {session_id} finished");
}
