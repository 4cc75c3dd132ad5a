//! The per-session state machine.
//!
//! One orchestrator owns one client stream, one upstream connection, the
//! usage and checkpoint handlers, and the session's credit balance. All of
//! its state is mutated from the single session task that drains the event
//! channels, which is what makes the synchronous-looking methods safe: no
//! call here ever awaits, and long-latency work is scheduled fire-and-
//! forget.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{info, warn};

use rslive_shared::{ErrorKind, MessageType};

use crate::checkpoint::CheckpointHandler;
use crate::ipc::IpcClient;
use crate::upstream::{UpstreamConnection, UpstreamEvent};
use crate::usage::UsageHandler;

/// Client messages held while the upstream is still connecting.
pub const MESSAGE_BUFFER_CAPACITY: usize = 10_000;

/// Upstream completions between credit refreshes.
pub const CREDITS_CHECK_CADENCE: u32 = 50;

const SESSION_UPDATED_MARKER: &str = "\"type\":\"session.updated\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Preconnect,
    Connecting,
    Connected,
    Draining,
    Terminated,
}

/// What the session loop should do after handling an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The client stream is gone; cleanup already ran.
    ClientGone,
}

/// Frames the orchestrator pushes toward the client stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close { code: u16, reason: String },
}

pub struct OrchestratorParams {
    pub account_id: String,
    pub session_id: String,
    /// Preloaded session-update payload; empty for a fresh session.
    pub session_data: String,
    pub credits: i64,
    pub upstream_url: String,
    pub upstream_bearer: String,
    pub client_tx: mpsc::UnboundedSender<ClientFrame>,
    /// Handler slot contents for every upstream connection this session
    /// creates (including reconnects).
    pub upstream_events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    /// Completion lane for the cadence-based credit refresh.
    pub credits_tx: mpsc::UnboundedSender<Option<i64>>,
    pub ipc: IpcClient,
}

pub struct Orchestrator {
    account_id: String,
    session_id: String,
    session_data: String,
    credits: i64,
    skip_session_save: bool,
    state: SessionState,
    buffer: VecDeque<String>,
    response_count: u32,
    credits_check_in_flight: bool,
    upstream: Option<UpstreamConnection>,
    upstream_url: String,
    upstream_bearer: String,
    client_tx: mpsc::UnboundedSender<ClientFrame>,
    upstream_events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    credits_tx: mpsc::UnboundedSender<Option<i64>>,
    ipc: IpcClient,
    usage: UsageHandler,
    checkpoint: CheckpointHandler,
}

impl Orchestrator {
    pub fn new(params: OrchestratorParams) -> Self {
        let usage = UsageHandler::new(&params.account_id, &params.session_id, params.ipc.clone());
        let checkpoint =
            CheckpointHandler::new(&params.account_id, &params.session_id, params.ipc.clone());
        // A preloaded session means the first session.updated echo from the
        // upstream is replayed state, not something to persist again.
        let skip_session_save = !params.session_data.is_empty();
        Self {
            account_id: params.account_id,
            session_id: params.session_id,
            session_data: params.session_data,
            credits: params.credits,
            skip_session_save,
            state: SessionState::Preconnect,
            buffer: VecDeque::new(),
            response_count: 0,
            credits_check_in_flight: false,
            upstream: None,
            upstream_url: params.upstream_url,
            upstream_bearer: params.upstream_bearer,
            client_tx: params.client_tx,
            upstream_events_tx: params.upstream_events_tx,
            credits_tx: params.credits_tx,
            ipc: params.ipc,
            usage,
            checkpoint,
        }
    }

    /// (Re)establishes the upstream connection. Any prior connection is
    /// explicitly disconnected first so its handler cannot fire again.
    pub fn connect(&mut self) {
        if let Some(mut prior) = self.upstream.take() {
            prior.disconnect();
        }
        let mut connection = UpstreamConnection::new(
            &self.upstream_url,
            &self.upstream_bearer,
            self.upstream_events_tx.clone(),
        );
        connection.connect();
        self.upstream = Some(connection);
        self.state = SessionState::Connecting;
    }

    /// Handles one inbound client frame. Never awaits.
    pub fn send(&mut self, client_msg: String) -> Result<(), ErrorKind> {
        if self.state != SessionState::Connected {
            if self.buffer.len() >= MESSAGE_BUFFER_CAPACITY {
                return Err(ErrorKind::ExternalBufferOverflow);
            }
            self.buffer.push_back(client_msg);
            return Ok(());
        }

        self.check_and_schedule_credits_check();
        if self.credits <= 0 {
            if let Some(upstream) = &mut self.upstream {
                upstream.disconnect();
            }
            return Err(ErrorKind::ExternalNoCredits);
        }

        if let Some(upstream) = &self.upstream {
            upstream.send(&client_msg);
        }
        Ok(())
    }

    pub fn handle_upstream_event(&mut self, event: UpstreamEvent) -> Result<Flow, ErrorKind> {
        match event {
            UpstreamEvent::Connected => {
                self.on_connect();
                Ok(Flow::Continue)
            }
            UpstreamEvent::Message(raw) => self.on_msg_received(raw),
            UpstreamEvent::Error(message) => {
                self.on_error(&message);
                Ok(Flow::Continue)
            }
            UpstreamEvent::Closed { code, reason } => {
                self.on_close(code, &reason);
                Ok(Flow::Continue)
            }
        }
    }

    fn on_connect(&mut self) {
        self.state = SessionState::Connected;
        if let Some(upstream) = &self.upstream {
            // The preloaded session-update must reach the provider before
            // anything the client queued.
            if !self.session_data.is_empty() {
                upstream.send(&self.session_data);
            }
            while let Some(msg) = self.buffer.pop_front() {
                upstream.send(&msg);
            }
        }
    }

    fn on_msg_received(&mut self, raw: String) -> Result<Flow, ErrorKind> {
        // Forward to the client before anything else; every side effect
        // below is secondary to delivery.
        if self
            .client_tx
            .send(ClientFrame::Text(raw.clone()))
            .is_err()
        {
            self.cleanup();
            return Ok(Flow::ClientGone);
        }

        if let Some((input, output)) = self.usage.ingest(&raw) {
            self.credits -= (input + output) as i64;
            self.response_count += 1;
            if self.credits <= 0 {
                if let Some(upstream) = &mut self.upstream {
                    upstream.disconnect();
                }
                return Err(ErrorKind::ExternalNoCredits);
            }
        }

        self.save_session_if_needed(&raw);
        self.checkpoint.ingest(&raw);
        Ok(Flow::Continue)
    }

    fn on_error(&mut self, message: &str) {
        warn!("upstream error on session {}: {message}", self.session_id);
        self.skip_session_save = false;
    }

    /// Only unexpected closes land here: an explicit disconnect nulls the
    /// handler first. Reconnect with the preloaded session.
    fn on_close(&mut self, code: u16, reason: &str) {
        info!(
            "upstream closed session {} (code {code}, {reason:?}), reconnecting",
            self.session_id
        );
        self.state = SessionState::Connecting;
        self.skip_session_save = true;
        self.connect();
    }

    fn save_session_if_needed(&mut self, raw: &str) {
        if !raw.contains(SESSION_UPDATED_MARKER) {
            return;
        }
        if self.skip_session_save {
            // One-shot: the first echo after a preload or reconnect carries
            // the conversation we just replayed into it.
            self.skip_session_save = false;
            return;
        }
        self.ipc.send_oneway(
            MessageType::SaveSession,
            &[&self.account_id, &self.session_id, raw],
        );
    }

    /// Cadence-based refresh of the authoritative balance. Deduplicated by
    /// the in-flight flag, and never awaited on the send path.
    fn check_and_schedule_credits_check(&mut self) {
        if self.credits_check_in_flight || self.response_count < CREDITS_CHECK_CADENCE {
            return;
        }
        self.credits_check_in_flight = true;
        let ipc = self.ipc.clone();
        let account_id = self.account_id.clone();
        let credits_tx = self.credits_tx.clone();
        tokio::spawn(async move {
            let refreshed = match ipc.request(MessageType::GetCredits, &[&account_id]).await {
                Ok(response) if response.is_ok() => Some(response.num_field(0)),
                Ok(response) => {
                    warn!("credit refresh rejected: {}", response.error);
                    None
                }
                Err(kind) => {
                    warn!("credit refresh failed: {kind}");
                    None
                }
            };
            let _ = credits_tx.send(refreshed);
        });
    }

    /// Applies the result of a scheduled refresh. On failure only the
    /// in-flight flag clears, so the next send retries immediately.
    pub fn apply_credits_refresh(&mut self, refreshed: Option<i64>) {
        if let Some(credits) = refreshed {
            self.credits = credits;
            self.response_count = 0;
        }
        self.credits_check_in_flight = false;
    }

    /// Flushes both accumulators, drops the upstream, clears the buffer.
    /// Idempotent; called by the accept layer on client close or error.
    pub fn cleanup(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.state = SessionState::Draining;
        self.usage.flush();
        self.checkpoint.flush();
        if let Some(mut upstream) = self.upstream.take() {
            upstream.disconnect();
        }
        self.buffer.clear();
        self.state = SessionState::Terminated;
    }

    /// Pushes a close frame carrying an external error to the client.
    pub fn notify_client_closed(&self, kind: ErrorKind) {
        let _ = self.client_tx.send(ClientFrame::Close {
            code: 1008,
            reason: kind.as_str().to_string(),
        });
    }

    #[cfg(test)]
    fn attach_upstream_for_tests(
        &mut self,
    ) -> mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::Message> {
        let (connection, out_rx) = UpstreamConnection::stub(self.upstream_events_tx.clone());
        self.upstream = Some(connection);
        self.state = SessionState::Connecting;
        out_rx
    }
}
