use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Calendar collaborator: a single event-creation call returning a link to
/// the created event.
#[derive(Debug, Clone)]
pub struct CalendarClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CalendarClient {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub async fn create_event(
        &self,
        title: &str,
        start: &str,
        end: &str,
        attendees: &[String],
        recurrence_rule: Option<&str>,
    ) -> anyhow::Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            title: &'a str,
            start: &'a str,
            end: &'a str,
            attendees: &'a [String],
            #[serde(skip_serializing_if = "Option::is_none")]
            recurrence_rule: Option<&'a str>,
        }

        #[derive(Deserialize)]
        struct Resp {
            event_link: String,
        }

        let mut builder = self.http.post(&self.base_url).json(&Req {
            title,
            start,
            end,
            attendees,
            recurrence_rule,
        });
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.context("calendar create-event request")?;
        if !resp.status().is_success() {
            anyhow::bail!(
                "calendar create-event failed with status {}",
                resp.status()
            );
        }

        let body: Resp = resp.json().await.context("calendar create-event decode")?;
        Ok(body.event_link)
    }
}
