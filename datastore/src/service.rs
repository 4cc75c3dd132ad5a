//! Datastore-side business logic.
//!
//! Everything the IPC surface exposes funnels through [`DataService`]:
//! authenticated session loading with conversation injection, usage
//! recording, session persistence, and conversation checkpoint appends.
//! Fire-and-forget entry points log failures and never raise.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use rslive_shared::error::{WIRE_INTERNAL_ERROR, WIRE_INVALID_AUTH, WIRE_NO_CREDITS};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::db::DbPool;
use crate::repo::{accounts, sessions, usage};
use crate::summarize::Summarizer;

/// Conversation blobs above this size are truncated for the current load
/// and handed to the background summarizer.
pub const THRESHOLD_CHARS: usize = 32_000;

/// Character budget the summarizer is asked to stay under.
pub const SUMMARY_TARGET_CHARS: usize = 24_000;

const CONTINUATION_PREFIX: &str =
    "\n\nHere is the previous conversation that happened which should be continued now:\n";
const OMITTED_MARKER: &str = "[...earlier context omitted...]\n";
const SESSION_UPDATED_TYPE: &str = "session.updated";

/// Result of `validate_and_load`, mirrored 1:1 onto the response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub error: String,
    pub account_id: String,
    pub session_data: String,
    pub credits: i64,
}

impl LoadOutcome {
    fn failed(error: &str, account_id: String, credits: i64) -> Self {
        Self {
            error: error.to_string(),
            account_id,
            session_data: String::new(),
            credits,
        }
    }
}

pub struct DataService {
    pool: DbPool,
    summarizer: Option<Arc<dyn Summarizer>>,
    // Absent in purely synchronous contexts (tests); summarization is then
    // skipped, which is fine because it is best-effort anyway.
    runtime: Option<tokio::runtime::Handle>,
}

impl DataService {
    pub fn new(pool: DbPool, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        Self {
            pool,
            summarizer,
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    /// Authenticates the key, checks credits, and assembles the outbound
    /// session payload, scheduling a summarization when the stored
    /// conversation has outgrown the threshold.
    pub fn validate_and_load(&self, api_key: &str, session_id: &str) -> LoadOutcome {
        match self.try_validate_and_load(api_key, session_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("validate_and_load failed: {e:#}");
                LoadOutcome::failed(WIRE_INTERNAL_ERROR, String::new(), 0)
            }
        }
    }

    fn try_validate_and_load(
        &self,
        api_key: &str,
        session_id: &str,
    ) -> anyhow::Result<LoadOutcome> {
        let mut conn = self.pool.get()?;
        let hits = sessions::load_session_by_key_and_id(&mut conn, api_key, session_id)?;

        let Some(first) = hits.first() else {
            return Ok(LoadOutcome::failed(WIRE_INVALID_AUTH, String::new(), 0));
        };
        let account_id = first.account_id.clone();
        let credits = first.token_remaining + first.topup_remaining;
        if credits <= 0 {
            return Ok(LoadOutcome::failed(WIRE_NO_CREDITS, account_id, credits));
        }

        let mut session_blob = String::new();
        let mut conv_blob = String::new();
        for hit in &hits {
            match (hit.kind.as_deref(), &hit.data) {
                (Some(sessions::KIND_SESSION), Some(data)) => session_blob = data.clone(),
                (Some(sessions::KIND_CONV), Some(data)) => conv_blob = data.clone(),
                _ => {}
            }
        }

        if session_blob.is_empty() && conv_blob.is_empty() {
            return Ok(LoadOutcome {
                error: String::new(),
                account_id,
                session_data: String::new(),
                credits,
            });
        }

        let conv = if conv_blob.chars().count() > THRESHOLD_CHARS {
            self.schedule_summarize(account_id.clone(), session_id.to_string(), conv_blob.clone());
            truncate_recent(&conv_blob)
        } else {
            conv_blob
        };

        let session_data = if session_blob.is_empty() {
            synthesize_session(&conv)
        } else if conv.is_empty() {
            // A stored session with no conversation yet resumes as-is.
            session_blob
        } else {
            inject_conversation(&session_blob, &conv)
        };

        Ok(LoadOutcome {
            error: String::new(),
            account_id,
            session_data,
            credits,
        })
    }

    /// Fire-and-forget usage recording; errors log only.
    pub fn update_usage(
        &self,
        account_id: &str,
        session_id: &str,
        provider: &str,
        input_tokens: i64,
        output_tokens: i64,
    ) {
        let result = self.pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
            usage::insert_usage(
                &mut conn,
                account_id,
                session_id,
                provider,
                input_tokens,
                output_tokens,
            )
            .map_err(anyhow::Error::from)
        });
        if let Err(e) = result {
            warn!("usage insert for account {account_id} dropped: {e:#}");
        }
    }

    /// Fire-and-forget session persistence. A `session.updated` event is
    /// rewritten into the `session.update` form the upstream accepts on
    /// replay; anything else is stored verbatim.
    pub fn save_session(&self, account_id: &str, session_id: &str, raw_event: &str) {
        let envelope = transform_session_event(raw_event);
        let result = self.pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
            sessions::upsert_session(&mut conn, account_id, session_id, &envelope)
                .map_err(anyhow::Error::from)
        });
        if let Err(e) = result {
            warn!("session save for {session_id} dropped: {e:#}");
        }
    }

    /// Fire-and-forget conversation checkpoint append.
    pub fn append_conversation(&self, account_id: &str, session_id: &str, blob: &str) {
        let result = self.pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
            sessions::append_conversation(&mut conn, account_id, session_id, blob)
                .map_err(anyhow::Error::from)
        });
        if let Err(e) = result {
            warn!("conversation append for {session_id} dropped: {e:#}");
        }
    }

    pub fn get_credits(&self, account_id: &str) -> anyhow::Result<i64> {
        let mut conn = self.pool.get()?;
        Ok(accounts::get_credits(&mut conn, account_id)?)
    }

    /// Best-effort: without a summarizer (or a runtime to run it on) the
    /// oversized conversation simply stays as stored.
    fn schedule_summarize(&self, account_id: String, session_id: String, conversation: String) {
        let (Some(summarizer), Some(runtime)) = (self.summarizer.clone(), self.runtime.clone())
        else {
            debug!("no summarizer configured, conversation for {session_id} left as-is");
            return;
        };
        let pool = self.pool.clone();
        runtime.spawn(async move {
            let summary = match summarizer.summarize(&conversation, SUMMARY_TARGET_CHARS).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!("summarization for {session_id} failed, keeping full text: {e:#}");
                    return;
                }
            };
            let write = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
                let mut conn = pool.get()?;
                Ok(sessions::overwrite_conversation(
                    &mut conn,
                    &account_id,
                    &session_id,
                    &summary,
                )?)
            })
            .await;
            match write {
                Ok(Ok(_)) => debug!("conversation summarized"),
                Ok(Err(e)) => warn!("summary write failed: {e:#}"),
                Err(e) => warn!("summary write task failed: {e}"),
            }
        });
    }
}

/// Keeps the most recent `THRESHOLD_CHARS` characters, drops the partial
/// line the cut landed in, and marks the elision.
fn truncate_recent(conversation: &str) -> String {
    let start = conversation
        .char_indices()
        .rev()
        .nth(THRESHOLD_CHARS - 1)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let tail = &conversation[start..];
    let tail = match tail.find('\n') {
        Some(newline) => &tail[newline + 1..],
        None => tail,
    };
    format!("{OMITTED_MARKER}{tail}")
}

fn instructions_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Matches the full "instructions":"..." literal, capture 1 being the
    // (still escaped) value so the splice point is its end.
    RE.get_or_init(|| Regex::new(r#""instructions"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap())
}

/// Splices the continuation header and conversation into the session
/// payload's `instructions` string, escaping for JSON on the way in. When
/// the payload carries no instructions literal there is nothing to splice
/// into, and the payload passes through unchanged.
fn inject_conversation(session_blob: &str, conversation: &str) -> String {
    let addition = escape_json_string(&format!("{CONTINUATION_PREFIX}{conversation}"));
    match instructions_regex()
        .captures(session_blob)
        .and_then(|c| c.get(1))
    {
        Some(value) => {
            let splice_at = value.end();
            format!(
                "{}{}{}",
                &session_blob[..splice_at],
                addition,
                &session_blob[splice_at..]
            )
        }
        None => {
            warn!("session payload has no instructions field, storing conversation for later");
            session_blob.to_string()
        }
    }
}

/// Minimal session-update envelope for a conversation that has no stored
/// session payload.
fn synthesize_session(conversation: &str) -> String {
    format!(
        r#"{{"type":"session.update","session":{{"instructions":"{}"}}}}"#,
        escape_json_string(&format!("{CONTINUATION_PREFIX}{conversation}"))
    )
}

fn escape_json_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Rewrites a `session.updated` server event into the `session.update`
/// request form: server-only fields are stripped and null values removed
/// recursively (the upstream rejects nulls on replay). Non-matching or
/// unparseable events pass through verbatim.
pub(crate) fn transform_session_event(raw_event: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(raw_event) else {
        return raw_event.to_string();
    };
    if value.get("type").and_then(Value::as_str) != Some(SESSION_UPDATED_TYPE) {
        return raw_event.to_string();
    }
    let Some(session) = value.get_mut("session").filter(|s| s.is_object()) else {
        return raw_event.to_string();
    };

    let mut session = session.take();
    if let Some(fields) = session.as_object_mut() {
        fields.remove("object");
        fields.remove("id");
        fields.remove("expires_at");
    }
    strip_nulls(&mut session);

    json!({ "type": "session.update", "session": session }).to_string()
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                strip_nulls(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_nulls(item);
            }
        }
        _ => {}
    }
}
