use regex::Regex;
use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::error::{Error, Result};

#[derive(Deserialize)]
pub struct Config {
    pub amazon: AmazonConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub paperless: Option<PaperlessConfig>,
    #[serde(default)]
    pub webdriver: WebDriverConfig,
    /// Recurring-run interval, e.g. "12h" or "1d". Absent = run once.
    pub schedule: Option<String>,
}

#[derive(Deserialize)]
pub struct AmazonConfig {
    pub email: String,
    pub password: String,
    /// Oldest order-history year worth visiting.
    pub min_year: Option<i32>,
}

#[derive(Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    pub output_folder: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            db_path: default_db_path(),
            output_folder: None,
        }
    }
}

fn default_db_path() -> String {
    "invoices.db".to_string()
}

#[derive(Deserialize)]
pub struct PaperlessConfig {
    pub url: String,
    pub token: String,
    pub correspondent: Option<i64>,
    pub document_type: Option<i64>,
    pub storage_path: Option<i64>,
    #[serde(default)]
    pub tags: Vec<i64>,
}

impl PaperlessConfig {
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

#[derive(Deserialize)]
pub struct WebDriverConfig {
    #[serde(default = "default_webdriver_endpoint")]
    pub endpoint: String,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        WebDriverConfig {
            endpoint: default_webdriver_endpoint(),
        }
    }
}

fn default_webdriver_endpoint() -> String {
    "http://localhost:9515".to_string()
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// At least one delivery sink must be configured, otherwise a run could
    /// never complete any invoice.
    fn validate(&self) -> Result<()> {
        if self.storage.output_folder.is_none() && self.paperless.is_none() {
            return Err(Error::Config(
                "either storage.output_folder or a [paperless] section must be configured"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a schedule interval like "1h", "24h", "1d" or "7d" into a duration.
pub fn parse_schedule_interval(schedule: &str) -> Result<Duration> {
    let re = Regex::new(r"^(\d+)([hd])$").expect("schedule regex is valid");
    let lowercased = schedule.to_lowercase();
    let caps = re.captures(&lowercased).ok_or_else(|| {
        Error::Config(format!(
            "invalid schedule format: {schedule}. Use format like '1h', '24h', '1d', '7d'"
        ))
    })?;

    let value: u64 = caps[1]
        .parse()
        .map_err(|_| Error::Config(format!("invalid schedule value: {schedule}")))?;
    let seconds = match &caps[2] {
        "h" => value * 3600,
        "d" => value * 86400,
        _ => unreachable!("regex only admits h or d"),
    };
    Ok(Duration::from_secs(seconds))
}
