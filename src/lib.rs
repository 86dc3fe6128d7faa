//! Mention Scraper Library
//!
//! Collects token mentions from TikTok videos and Telegram channels,
//! stores them with per-item deduplication and correlates mention activity
//! with on-chain trading volume for the dashboard API.

pub mod cards;
pub mod comments;
pub mod config;
pub mod correlation;
pub mod db;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod market;
pub mod monitor;
pub mod pacing;
pub mod resolver;
pub mod scraper;
pub mod server;
pub mod telegram;

pub use config::{Config, Environment};
pub use db::Database;
pub use error::{Error, Result};
pub use monitor::Monitor;
pub use scraper::TikTokScraper;
pub use telegram::TelegramScraper;
