//! Configuration loading and management
//!
//! Tuning lives in a TOML settings file; secrets and store locations come
//! from the process environment.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::extractor::SymbolVocabulary;
use crate::pacing::{BrowserProfile, PacingPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scraper: ScraperConfig,
    pub mentions: MentionConfig,
    pub pacing: PacingPolicy,
    pub browser: BrowserProfile,
    pub monitor: MonitorConfig,
    pub telegram: TelegramConfig,
    pub correlation: CorrelationConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub search_terms: Vec<String>,
    pub hashtag_terms: Vec<String>,
    pub max_results_per_search: usize,
    pub max_results_per_hashtag: usize,
    /// Comment pages fetched per video (50 comments per page)
    pub comment_pages: u32,
    pub comment_rate_limit_per_second: u32,
    pub navigation_timeout_seconds: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        let terms: Vec<String> = ["memecoin", "pumpfun", "solana", "crypto", "meme", "bags", "bonk"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            search_terms: terms.clone(),
            hashtag_terms: terms,
            max_results_per_search: 100,
            max_results_per_hashtag: 200,
            comment_pages: 3,
            comment_rate_limit_per_second: 2,
            navigation_timeout_seconds: 60,
        }
    }
}

/// Symbol vocabulary. An empty keyword list means cashtag matching.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MentionConfig {
    pub keywords: Vec<String>,
}

impl MentionConfig {
    pub fn vocabulary(&self) -> SymbolVocabulary {
        if self.keywords.is_empty() {
            SymbolVocabulary::Cashtags
        } else {
            SymbolVocabulary::Keywords(self.keywords.clone())
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_seconds: u64,
    pub staleness_seconds: i64,
    pub batch_size: usize,
    pub max_consecutive_failures: u32,
    pub retry_delay_seconds: u64,
    pub item_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            staleness_seconds: 300,
            batch_size: 10,
            max_consecutive_failures: 3,
            retry_delay_seconds: 30,
            item_delay_ms: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Channels proposed to discovery; only kept when recently active
    pub seed_channels: Vec<String>,
    pub recency_days: i64,
    pub messages_per_channel: usize,
    pub requests_per_second: u32,
    pub default_scrape_interval_minutes: i64,
    pub cycle_minutes: u64,
    pub discovery_interval_hours: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            seed_channels: Vec::new(),
            recency_days: 60,
            messages_per_channel: 1000,
            requests_per_second: 1,
            default_scrape_interval_minutes: 15,
            cycle_minutes: 5,
            discovery_interval_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub window_hours: i64,
    pub interval_minutes: u64,
    pub recommendation_threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            interval_minutes: 15,
            recommendation_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub events_poll_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            events_poll_seconds: 5,
        }
    }
}

impl Config {
    /// Load configuration from TOML file, falling back to defaults when the
    /// file does not exist. A file that exists but does not parse is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No settings file at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::configuration(format!("invalid settings: {}", e)))
    }
}

/// Process environment the pipeline depends on.
#[derive(Debug, Clone)]
pub struct Environment {
    pub database_path: String,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub bitquery_api_key: Option<String>,
}

impl Environment {
    /// Read the environment (after `.env` has been loaded). Only the database
    /// path is required for every command.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: require_var("DATABASE_PATH")?,
            browserless_url: optional_var("BROWSERLESS_URL"),
            browserless_token: optional_var("BROWSERLESS_TOKEN"),
            bitquery_api_key: optional_var("BITQUERY_API_KEY"),
        })
    }

    pub fn require_browserless(&self) -> Result<&str> {
        self.browserless_url
            .as_deref()
            .ok_or_else(|| Error::configuration("missing required environment variable BROWSERLESS_URL"))
    }

    pub fn require_bitquery_key(&self) -> Result<&str> {
        self.bitquery_api_key
            .as_deref()
            .ok_or_else(|| Error::configuration("missing required environment variable BITQUERY_API_KEY"))
    }
}

fn require_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::configuration(format!("missing required environment variable {}", name)))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
