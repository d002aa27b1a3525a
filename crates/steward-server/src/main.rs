mod calendar;
mod config;
mod confirm;
mod db;
mod dialog;
mod llm;
mod models;
mod scheduler;
mod session;
mod slack;
mod validate;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::Deserialize;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::calendar::CalendarClient;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::scheduler::ReminderScheduler;
use crate::session::SessionStore;
use crate::slack::{verify_slack_signature, SlackClient};

type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
struct AppError(anyhow::Error);

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self(value)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        Self(anyhow::Error::new(value))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub sessions: SessionStore,
    pub scheduler: ReminderScheduler,
    pub gateway: Option<SlackClient>,
    pub llm: LlmClient,
    pub calendar: Option<CalendarClient>,
}

impl AppState {
    /// Fire-and-forget outbound delivery; failures are diagnostics only and
    /// are never retried.
    pub async fn send(&self, to: &str, text: &str) {
        match self.gateway.as_ref() {
            Some(gateway) => {
                if let Err(err) = gateway.post_message(to, text).await {
                    warn!(error = %err, to, "notification delivery failed");
                }
            }
            None => warn!(to, "no notification gateway configured; dropping message"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::parse());

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let db_path = config.data_dir.join("steward.sqlite");
    let pool = db::init_sqlite(&db_path).await?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(30))
        .build()
        .context("build reqwest client")?;

    let gateway = config
        .slack_bot_token
        .clone()
        .map(|token| SlackClient::new(http.clone(), token));
    if gateway.is_none() {
        warn!("SLACK_BOT_TOKEN not set; outbound messages will be dropped");
    }

    let sessions = SessionStore::new();
    let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), gateway.clone());

    let state = AppState {
        config: config.clone(),
        pool,
        sessions,
        scheduler,
        gateway,
        llm: LlmClient::new(
            http.clone(),
            config.llm_base_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        ),
        calendar: config
            .calendar_url
            .clone()
            .map(|url| CalendarClient::new(http, url, config.calendar_api_key.clone())),
    };

    // Background sweep: legacy due reminders, session expiry, event cleanup.
    tokio::spawn(worker::sweep_loop(state.clone()));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/slack/events", post(slack_events))
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let Some(secret) = state.config.slack_signing_secret.as_deref() else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            "slack not configured (missing SLACK_SIGNING_SECRET)",
        )
            .into_response());
    };

    if let Err(err) = verify_slack_signature(secret, &headers, &body) {
        warn!(error = %err, "invalid slack signature");
        return Ok((StatusCode::UNAUTHORIZED, "invalid signature").into_response());
    }

    let env: SlackEnvelope = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "invalid slack payload");
            return Ok((StatusCode::BAD_REQUEST, "invalid payload").into_response());
        }
    };

    match env {
        SlackEnvelope::UrlVerification { challenge } => {
            Ok(axum::Json(serde_json::json!({ "challenge": challenge })).into_response())
        }
        SlackEnvelope::EventCallback { event_id, event } => {
            let (user, text, channel) = match event {
                SlackEvent::AppMention {
                    user,
                    text,
                    channel,
                } => (user, strip_leading_mentions(&text), channel),
                SlackEvent::Message {
                    user,
                    text,
                    channel,
                    channel_type,
                    subtype,
                    bot_id,
                } => {
                    // Ignore bot messages and non-user subtypes to avoid loops.
                    if bot_id.is_some() || subtype.is_some() {
                        return Ok((StatusCode::OK, "").into_response());
                    }
                    let Some(user) = user else {
                        return Ok((StatusCode::OK, "").into_response());
                    };
                    let ct = channel_type.as_deref().unwrap_or("");
                    if ct != "im" {
                        // Channel chatter reaches us via app_mention instead.
                        return Ok((StatusCode::OK, "").into_response());
                    }
                    (user, text.unwrap_or_default().trim().to_string(), channel)
                }
                SlackEvent::Other => return Ok((StatusCode::OK, "").into_response()),
            };

            if text.is_empty() {
                return Ok((StatusCode::OK, "").into_response());
            }

            // Slack retries webhooks; process each event exactly once.
            let processed = db::try_mark_event_processed(&state.pool, "slack", &event_id).await?;
            if !processed {
                return Ok((StatusCode::OK, "").into_response());
            }

            let text = clamp_chars(text, 4_000);
            // Ack within Slack's deadline; the turn runs on its own task.
            tokio::spawn(async move {
                if let Err(err) = dialog::handle_message(&state, &user, &channel, &text).await {
                    error!(error = %err, user = %user, "dialog turn failed");
                    state
                        .send(&channel, "Sorry, something went wrong handling that message.")
                        .await;
                }
            });

            Ok((StatusCode::OK, "").into_response())
        }
    }
}

fn strip_leading_mentions(text: &str) -> String {
    let mut s = text.trim_start();

    // Remove one or more leading "<@...>" tokens and separators.
    loop {
        if let Some(rest) = s.strip_prefix("<@") {
            if let Some(end) = rest.find('>') {
                s = rest[end + 1..].trim_start();
                continue;
            }
        }
        if let Some(rest) = s.strip_prefix(':').or_else(|| s.strip_prefix(',')) {
            s = rest.trim_start();
            continue;
        }
        break;
    }

    s.trim().to_string()
}

fn clamp_chars(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    s.chars().take(max).collect()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SlackEnvelope {
    #[serde(rename = "url_verification")]
    UrlVerification { challenge: String },

    #[serde(rename = "event_callback")]
    EventCallback {
        #[serde(rename = "event_id")]
        event_id: String,
        event: SlackEvent,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SlackEvent {
    #[serde(rename = "app_mention")]
    AppMention {
        user: String,
        text: String,
        channel: String,
    },

    #[serde(rename = "message")]
    Message {
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        text: Option<String>,
        channel: String,
        #[serde(default)]
        channel_type: Option<String>, // im | channel | group | mpim
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        bot_id: Option<String>,
    },

    #[serde(other)]
    Other,
}

#[cfg(test)]
pub async fn test_state() -> AppState {
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    let options = SqliteConnectOptions::new()
        .filename(":memory:")
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("connect in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");

    let http = reqwest::Client::new();
    let sessions = SessionStore::new();
    let scheduler = ReminderScheduler::new(pool.clone(), sessions.clone(), None);

    AppState {
        config: Arc::new(Config::parse_from(["steward-server"])),
        pool,
        sessions,
        scheduler,
        gateway: None,
        llm: LlmClient::new(http, "http://127.0.0.1:9".to_string(), None, "test-model".to_string()),
        calendar: None,
    }
}
