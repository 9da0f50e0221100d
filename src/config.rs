use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const SETTINGS_FILE: &str = "config/settings";
const DEFAULT_CRAWL_DELAY: Duration = Duration::from_secs(1);

/// Runtime settings. Every field has a default; `config/settings.toml` and
/// `JOBS_*` environment variables override them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub rules_path: PathBuf,
    pub user_agent: String,
    /// Seconds between requests when robots.txt has no usable Crawl-delay.
    pub default_crawl_delay: f64,
    /// Hard cap on the page numbers probed during bound discovery.
    pub max_page: u32,
    /// Pages checked past a non-empty probe before declaring it the last page.
    pub lookahead: u32,
    pub request_timeout_secs: u64,

    pub llm_api: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub llm_temperature: f32,
    /// Descriptions longer than this (in characters) are truncated in prompts.
    pub max_body_chars: usize,

    pub workers: usize,
    pub batch_size: usize,
    pub error_log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/jobs.sqlite"),
            rules_path: PathBuf::from("config/scraper_rules.json"),
            user_agent: "JobTaker".to_string(),
            default_crawl_delay: DEFAULT_CRAWL_DELAY.as_secs_f64(),
            max_page: 500,
            lookahead: 1,
            request_timeout_secs: 10,
            llm_api: "https://openrouter.ai/api/v1".to_string(),
            llm_api_key: None,
            llm_model: "deepseek/deepseek-chat-v3.1:free".to_string(),
            llm_timeout_secs: 120,
            llm_max_retries: 2,
            llm_temperature: 0.2,
            max_body_chars: 5000,
            workers: 3,
            batch_size: 3,
            error_log_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let mut settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(SETTINGS_FILE).required(false))
            .add_source(config::Environment::with_prefix("JOBS"))
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")?;

        if settings.llm_api_key.is_none() {
            settings.llm_api_key = std::env::var("LLM_API_KEY").ok();
        }
        Ok(settings)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    /// Negative values mean no delay; values too large for a `Duration` fall
    /// back to the built-in default.
    pub fn default_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_crawl_delay.max(0.0))
            .unwrap_or(DEFAULT_CRAWL_DELAY)
    }
}
