//! Per-session usage accumulator.
//!
//! Every upstream completion event carries token counts; sending one IPC
//! frame per event would swamp the socket, so counts batch locally and
//! flush every few completions. Extraction is substring search on the raw
//! frame: a full JSON parse here is roughly an order of magnitude slower
//! on realistic payloads.

use crate::ipc::IpcClient;
use rslive_shared::MessageType;

/// Completion events per UPDATE_USAGE frame.
pub const FLUSH_EVERY_RESPONSES: u32 = 5;

pub const PROVIDER_OPENAI: &str = "OPENAI";

const RESPONSE_DONE_MARKER: &str = "\"type\":\"response.done\"";
const INPUT_TOKENS_MARKER: &str = "\"input_tokens\":";
const OUTPUT_TOKENS_MARKER: &str = "\"output_tokens\":";

pub struct UsageHandler {
    account_id: String,
    session_id: String,
    ipc: IpcClient,
    input_acc: u64,
    output_acc: u64,
    batched: u32,
}

impl UsageHandler {
    pub fn new(account_id: &str, session_id: &str, ipc: IpcClient) -> Self {
        Self {
            account_id: account_id.to_string(),
            session_id: session_id.to_string(),
            ipc,
            input_acc: 0,
            output_acc: 0,
            batched: 0,
        }
    }

    /// Scans a raw upstream frame for a completion event and returns the
    /// extracted token pair, or `None` on the fast negative path.
    pub fn ingest(&mut self, raw: &str) -> Option<(u64, u64)> {
        if !raw.contains(RESPONSE_DONE_MARKER) {
            return None;
        }
        let input = scan_number_after(raw, INPUT_TOKENS_MARKER).unwrap_or(0);
        let output = scan_number_after(raw, OUTPUT_TOKENS_MARKER).unwrap_or(0);

        self.input_acc += input;
        self.output_acc += output;
        self.batched += 1;
        if self.batched >= FLUSH_EVERY_RESPONSES {
            self.flush();
        }
        Some((input, output))
    }

    /// Emits the accumulated batch as one fire-and-forget frame, then zeros
    /// the counters. No-op when nothing has accumulated.
    pub fn flush(&mut self) {
        if self.batched == 0 {
            return;
        }
        let input = self.input_acc.to_string();
        let output = self.output_acc.to_string();
        self.ipc.send_oneway(
            MessageType::UpdateUsage,
            &[
                &self.account_id,
                &self.session_id,
                PROVIDER_OPENAI,
                &input,
                &output,
            ],
        );
        self.input_acc = 0;
        self.output_acc = 0;
        self.batched = 0;
    }
}

/// Parses the contiguous ASCII digit run following `marker`, tolerating
/// whitespace between the marker and the digits.
pub(crate) fn scan_number_after(raw: &str, marker: &str) -> Option<u64> {
    let start = raw.find(marker)? + marker.len();
    let rest = raw[start..].trim_start();
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..digits_end].parse().ok()
}
