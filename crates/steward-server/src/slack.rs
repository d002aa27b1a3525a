use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SlackSignatureError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
    #[error("timestamp too old")]
    TimestampTooOld,
    #[error("signature mismatch")]
    SignatureMismatch,
}

pub fn verify_slack_signature(
    signing_secret: &str,
    headers: &axum::http::HeaderMap,
    body: &Bytes,
) -> Result<(), SlackSignatureError> {
    let timestamp = headers
        .get("X-Slack-Request-Timestamp")
        .ok_or(SlackSignatureError::MissingHeader(
            "X-Slack-Request-Timestamp",
        ))?
        .to_str()
        .map_err(|_| SlackSignatureError::InvalidHeader("X-Slack-Request-Timestamp"))?;

    let signature = headers
        .get("X-Slack-Signature")
        .ok_or(SlackSignatureError::MissingHeader("X-Slack-Signature"))?
        .to_str()
        .map_err(|_| SlackSignatureError::InvalidHeader("X-Slack-Signature"))?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| SlackSignatureError::InvalidHeader("X-Slack-Request-Timestamp"))?;

    // Reject if timestamp is too far from "now" to reduce replay.
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64;
    if (now - ts).abs() > 60 * 5 {
        return Err(SlackSignatureError::TimestampTooOld);
    }

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes()).expect("HMAC key valid");
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    // Constant-time compare.
    if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
        return Err(SlackSignatureError::SignatureMismatch);
    }

    Ok(())
}

/// Outbound notification gateway. Delivery is fire-and-forget: callers log
/// failures and never retry.
#[derive(Debug, Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    bot_token: String,
}

impl SlackClient {
    pub fn new(http: reqwest::Client, bot_token: String) -> Self {
        Self { http, bot_token }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.bot_token))
                .expect("slack token header value"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    /// `to` is a channel id or a user id (Slack opens the DM for user ids).
    pub async fn post_message(&self, to: &str, text: &str) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            channel: &'a str,
            text: &'a str,
        }

        let text = text.trim();
        let text = if text.is_empty() { "(empty)" } else { text };

        let resp: SlackApiResponse<serde_json::Value> = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .headers(self.headers())
            .json(&Req { channel: to, text })
            .send()
            .await
            .context("slack chat.postMessage request")?
            .json()
            .await
            .context("slack chat.postMessage decode")?;

        if !resp.ok {
            anyhow::bail!(
                "slack chat.postMessage failed: {}",
                resp.error.unwrap_or_else(|| "unknown_error".to_string())
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SlackApiResponse<T> {
    pub ok: bool,
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Option<T>,
}
