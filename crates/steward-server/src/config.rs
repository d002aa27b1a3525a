use std::path::PathBuf;

use chrono::FixedOffset;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "steward-server")]
pub struct Config {
    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    #[arg(long, env = "STEWARD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "SLACK_SIGNING_SECRET")]
    pub slack_signing_secret: Option<String>,

    #[arg(long, env = "SLACK_BOT_TOKEN")]
    pub slack_bot_token: Option<String>,

    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    #[arg(long, env = "STEWARD_LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub llm_base_url: String,

    #[arg(long, env = "STEWARD_LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    #[arg(long, env = "STEWARD_LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Event-creation endpoint of the calendar collaborator.
    #[arg(long, env = "STEWARD_CALENDAR_URL")]
    pub calendar_url: Option<String>,

    #[arg(long, env = "STEWARD_CALENDAR_API_KEY")]
    pub calendar_api_key: Option<String>,

    /// Fixed deployment timezone as an offset from UTC, in minutes.
    /// All date parsing and reminder delay arithmetic is anchored here.
    #[arg(long, env = "STEWARD_UTC_OFFSET_MINUTES", default_value = "0")]
    pub utc_offset_minutes: i32,

    /// Interval of the background sweep (legacy due reminders, session expiry).
    #[arg(long, env = "STEWARD_SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Idle sessions older than this are abandoned.
    #[arg(long, env = "STEWARD_SESSION_TTL_MINUTES", default_value = "30")]
    pub session_ttl_minutes: u64,
}

impl Config {
    pub fn tz_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }
}
