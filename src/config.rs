use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use reqwest::Url;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub database_url: String,
    pub a1111_api_url: Url,
    pub a1111_timeout: Duration,
    pub admin_ids: Vec<i64>,
    pub characters_file_path: String,
    pub characters_example_file_path: String,
    pub bot_settings_file_path: String,
    pub max_saved_prompts: usize,
    pub max_combinations: usize,
    pub telegram_max_length: usize,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_csv_i64(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring invalid user id '{}' in ADMIN_IDS", entry);
                None
            }
        })
        .collect()
}

fn parse_api_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    // Url::join drops the last path segment unless the base ends with a slash.
    let url = Url::parse(&format!("{trimmed}/"))
        .map_err(|err| anyhow!("Invalid A1111_API_URL '{}': {}", raw, err))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!(
            "Invalid A1111_API_URL '{}': unsupported scheme {}",
            raw,
            other
        )),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        if bot_token.trim().is_empty() {
            return Err(anyhow!("BOT_TOKEN is required"));
        }

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: env_string("DATABASE_URL", "sqlite://bot.db?mode=rwc"),
            a1111_api_url: parse_api_url(&env_string("A1111_API_URL", "http://127.0.0.1:7860"))?,
            a1111_timeout: Duration::from_secs(env_u64("A1111_TIMEOUT_SECONDS", 300).max(1)),
            admin_ids: parse_csv_i64(&env_string("ADMIN_IDS", "")),
            characters_file_path: env_string("CHARACTERS_FILE_PATH", "data/characters.json"),
            characters_example_file_path: env_string(
                "CHARACTERS_EXAMPLE_FILE_PATH",
                "data/characters_example.json",
            ),
            bot_settings_file_path: env_string("BOT_SETTINGS_FILE_PATH", "data/settings.json"),
            max_saved_prompts: env_usize("MAX_SAVED_PROMPTS", 10),
            max_combinations: env_usize("MAX_COMBINATIONS", 10_000).max(1),
            telegram_max_length: env_usize("TELEGRAM_MAX_LENGTH", 4000),
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}
