//! Background conversation summarization.
//!
//! The business service schedules a summarization whenever a conversation
//! blob crosses the size threshold. It is strictly best-effort: a failed
//! call logs and leaves the stored conversation untouched.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Pluggable LLM behind the summarization path.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, conversation: &str, target_chars: usize) -> Result<String>;
}

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GEMINI_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiSummarizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiSummarizer {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: GEMINI_MODEL.to_string(),
        }
    }

    fn build_prompt(conversation: &str, target_chars: usize) -> String {
        format!(
            "Condense the following voice conversation so it can seed a \
             continuation of the same session. Preserve the speaker tags \
             (user:/agent:), names, decisions, and open tasks. Keep the \
             result under {target_chars} characters.\n\n{conversation}"
        )
    }
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    async fn summarize(&self, conversation: &str, target_chars: usize) -> Result<String> {
        let url = format!(
            "{GEMINI_BASE_URL}/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = json!({
            "contents": [{
                "parts": [{ "text": Self::build_prompt(conversation, target_chars) }]
            }]
        });

        let response: Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("summarization response carried no text"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_target_and_conversation() {
        let prompt = GeminiSummarizer::build_prompt("user:hi\nagent:hello", 24_000);
        assert!(prompt.contains("under 24000 characters"));
        assert!(prompt.ends_with("user:hi\nagent:hello"));
    }
}
