use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a classification call. Anything that is not a JSON object under
/// the declared schema is plain text to relay to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Fields(serde_json::Map<String, serde_json::Value>),
    Text(String),
}

/// Model-backed fallback for duration inputs the deterministic grammar
/// rejects. Returns `Some(minutes)` or `None` for "unclear"; the
/// deterministic path and this one share the same tagged contract.
#[async_trait]
pub trait MinuteAdjudicator: Send + Sync {
    async fn adjudicate_minutes(&self, text: &str) -> anyhow::Result<Option<i64>>;
}

#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl LlmClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        model: String,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&req);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.context("llm chat request")?;
        if !resp.status().is_success() {
            anyhow::bail!("llm chat request failed with status {}", resp.status());
        }

        let body: ChatResponse = resp.json().await.context("llm chat decode")?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }

    /// Run one classification turn. `prompt` carries the field schema and
    /// instructions; `context` is the conversation so far plus the current
    /// date and time.
    pub async fn classify(&self, prompt: &str, context: &str) -> anyhow::Result<Extraction> {
        let raw = self.complete(prompt, context).await?;
        Ok(parse_extraction(&raw))
    }
}

#[async_trait]
impl MinuteAdjudicator for LlmClient {
    async fn adjudicate_minutes(&self, text: &str) -> anyhow::Result<Option<i64>> {
        const SYSTEM: &str = "The user describes a meeting duration. Reply with the \
            integer minute count only, or the literal word unclear. No other output.";
        let reply = self.complete(SYSTEM, text).await?;
        let t = reply.trim().trim_matches('"');
        if t.eq_ignore_ascii_case("unclear") {
            return Ok(None);
        }
        Ok(t.parse::<i64>().ok().filter(|m| *m > 0))
    }
}

/// A reply is structured only if it parses as a JSON object, optionally
/// wrapped in a markdown code fence. Everything else is clarification text.
pub fn parse_extraction(raw: &str) -> Extraction {
    let trimmed = raw.trim();
    let candidate = strip_code_fence(trimmed);
    match serde_json::from_str::<serde_json::Value>(candidate) {
        Ok(serde_json::Value::Object(map)) => Extraction::Fields(map),
        _ => Extraction::Text(trimmed.to_string()),
    }
}

fn strip_code_fence(s: &str) -> &str {
    let s = s.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_reply_is_fields() {
        let got = parse_extraction(r#"{"intent": "create_task", "assignee": "dana"}"#);
        match got {
            Extraction::Fields(map) => {
                assert_eq!(map.get("assignee").and_then(|v| v.as_str()), Some("dana"));
            }
            other => panic!("expected fields, got {other:?}"),
        }
    }

    #[test]
    fn fenced_object_reply_is_fields() {
        let got = parse_extraction("```json\n{\"intent\": \"schedule_meeting\"}\n```");
        assert!(matches!(got, Extraction::Fields(_)));
    }

    #[test]
    fn prose_reply_is_text() {
        let got = parse_extraction("Which day works best for you?");
        assert_eq!(
            got,
            Extraction::Text("Which day works best for you?".to_string())
        );
    }

    #[test]
    fn json_array_is_still_text() {
        // Schema requires an object; arrays don't qualify.
        let got = parse_extraction(r#"["a", "b"]"#);
        assert!(matches!(got, Extraction::Text(_)));
    }
}
