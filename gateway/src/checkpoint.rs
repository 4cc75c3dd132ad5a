//! Per-session conversation checkpointing.
//!
//! Transcript deltas stream in fragment by fragment; this accumulates them
//! speaker-tagged and appends a checkpoint to the datastore every couple
//! hundred characters. Like the usage path, frame inspection is bounded
//! substring search, never a JSON parse.

use crate::ipc::IpcClient;
use rslive_shared::MessageType;

/// Accumulated characters that trigger a checkpoint append.
pub const FLUSH_THRESHOLD_CHARS: usize = 200;

const USER_DELTA_MARKER: &str = "\"type\":\"conversation.item.input_audio_transcription.delta\"";
const AGENT_DELTA_MARKER: &str = "\"type\":\"response.output_audio_transcript.delta\"";
const DELTA_KEY_MARKER: &str = "\"delta\":\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speaker {
    None,
    User,
    Agent,
}

impl Speaker {
    fn label(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Agent => "agent",
            Speaker::None => "",
        }
    }
}

pub struct CheckpointHandler {
    account_id: String,
    session_id: String,
    ipc: IpcClient,
    fragments: Vec<String>,
    pending_chars: usize,
    speaker: Speaker,
}

impl CheckpointHandler {
    pub fn new(account_id: &str, session_id: &str, ipc: IpcClient) -> Self {
        Self {
            account_id: account_id.to_string(),
            session_id: session_id.to_string(),
            ipc,
            fragments: Vec::new(),
            pending_chars: 0,
            speaker: Speaker::None,
        }
    }

    pub fn ingest(&mut self, raw: &str) {
        let speaker = if raw.contains(USER_DELTA_MARKER) {
            Speaker::User
        } else if raw.contains(AGENT_DELTA_MARKER) {
            Speaker::Agent
        } else {
            return;
        };
        let Some(delta) = extract_delta(raw) else {
            return;
        };

        self.pending_chars += delta.len();
        if speaker != self.speaker {
            let newline = if self.fragments.is_empty() { "" } else { "\n" };
            self.fragments
                .push(format!("{newline}{}:{delta}", speaker.label()));
            self.speaker = speaker;
        } else {
            self.fragments.push(delta);
        }

        if self.pending_chars >= FLUSH_THRESHOLD_CHARS {
            self.flush();
        }
    }

    /// Snapshots and sends the accumulated text. State is reset *before*
    /// the send goes out: a re-entrant flush racing the fire-and-forget
    /// append must observe empty state, never double-send.
    pub fn flush(&mut self) {
        if self.fragments.is_empty() {
            return;
        }
        let snapshot = std::mem::take(&mut self.fragments).concat();
        self.pending_chars = 0;
        self.speaker = Speaker::None;
        self.ipc.send_oneway(
            MessageType::AppendConversation,
            &[&self.account_id, &self.session_id, &snapshot],
        );
    }
}

/// Extracts and unescapes the `"delta":"..."` value. The closing quote is
/// found by walking the escape sequences, bounding the scan to the value.
pub(crate) fn extract_delta(raw: &str) -> Option<String> {
    let start = raw.find(DELTA_KEY_MARKER)? + DELTA_KEY_MARKER.len();
    let bytes = raw.as_bytes();
    let mut idx = start;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 2,
            b'"' => return Some(unescape_json(&raw[start..idx])),
            _ => idx += 1,
        }
    }
    None
}

/// Unescapes a JSON string body, including `\uXXXX` surrogate pairs.
/// Malformed escapes pass through verbatim rather than dropping text.
pub(crate) fn unescape_json(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('u') => match parse_unicode_escape(&mut chars) {
                Some(decoded) => out.push(decoded),
                None => out.push_str("\\u"),
            },
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_unicode_escape(chars: &mut std::str::Chars<'_>) -> Option<char> {
    let mut read_unit = |chars: &mut std::str::Chars<'_>| -> Option<u32> {
        let mut unit = 0u32;
        for _ in 0..4 {
            unit = unit * 16 + chars.next()?.to_digit(16)?;
        }
        Some(unit)
    };

    let first = read_unit(chars)?;
    if (0xD800..0xDC00).contains(&first) {
        // High surrogate; the low half follows as another \uXXXX.
        let mut rest = chars.clone();
        if rest.next() == Some('\\') && rest.next() == Some('u') {
            if let Some(second) = read_unit(&mut rest) {
                if (0xDC00..0xE000).contains(&second) {
                    *chars = rest;
                    let combined =
                        0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00);
                    return char::from_u32(combined);
                }
            }
        }
        None
    } else {
        char::from_u32(first)
    }
}
