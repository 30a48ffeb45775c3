//! Process settings loaded from the environment (after `.env` is read by
//! the binary).

use std::path::PathBuf;

/// Application settings. Constructed once at startup and passed down
/// explicitly; there is no ambient global configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub google_api_key: String,
    pub gemini_model: String,
    pub headless: bool,
    pub database_path: PathBuf,
    pub scenarios_dir: PathBuf,
    pub screenshots_dir: PathBuf,
    pub slack_webhook_url: Option<String>,
    /// Courtesy delay between targets in a batch run.
    pub run_delay_secs: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            google_api_key: env_or("GOOGLE_API_KEY", ""),
            gemini_model: env_or("GEMINI_MODEL", "gemini-1.5-flash"),
            headless: env_or("HEADLESS", "true").to_lowercase() == "true",
            database_path: PathBuf::from(env_or("DATABASE_PATH", "harvester.db")),
            scenarios_dir: PathBuf::from(env_or("SCENARIOS_DIR", "scenarios")),
            screenshots_dir: PathBuf::from(env_or("SCREENSHOTS_DIR", "screenshots")),
            slack_webhook_url: std::env::var("SLACK_WEBHOOK_URL").ok(),
            run_delay_secs: env_or("RUN_DELAY_SECS", "5").parse().unwrap_or(5),
        }
    }

}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
