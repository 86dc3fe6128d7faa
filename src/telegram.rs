//! Telegram channel scraper
//!
//! Public channels expose a static web preview at `https://t.me/s/<channel>`,
//! twenty-odd messages per page, older pages reached with `?before=<id>`.
//! Messages are stored as-is and also flow through mention parsing as
//! `telegram` content items.
//!
//! Channel lifecycle:
//! - registered manually, or discovered from the configured seed list
//! - scraped when its scrape interval has elapsed
//! - disabled once it has no message inside the recency window

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cards::parse_views;
use crate::config::TelegramConfig;
use crate::db::{ChannelConfig, ContentItem, Database, Platform, TelegramMessage};
use crate::error::{Error, Result};
use crate::extractor::MentionParser;
use crate::pacing::{ActionClass, BrowserProfile, PacingPolicy};
use crate::resolver::SymbolResolver;

const PREVIEW_BASE: &str = "https://t.me/s";

static MESSAGE: Lazy<Selector> = Lazy::new(|| selector(".tgme_widget_message[data-post]"));
static MESSAGE_TEXT: Lazy<Selector> = Lazy::new(|| selector(".tgme_widget_message_text"));
static MESSAGE_TIME: Lazy<Selector> = Lazy::new(|| selector("time[datetime]"));
static MESSAGE_VIEWS: Lazy<Selector> = Lazy::new(|| selector(".tgme_widget_message_views"));
static MESSAGE_PHOTO: Lazy<Selector> = Lazy::new(|| selector(".tgme_widget_message_photo_wrap[style]"));
static CHANNEL_TITLE: Lazy<Selector> = Lazy::new(|| selector(".tgme_channel_info_header_title"));

static BACKGROUND_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"background-image:\s*url\(['"]?([^'")]+)['"]?\)"#).expect("valid style regex"));

fn selector(s: &str) -> Selector {
    Selector::parse(s).expect("static selector must parse")
}

/// One message as parsed from a preview page
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub views: Option<i64>,
    pub photo_urls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelPage {
    pub title: Option<String>,
    /// Oldest first, as rendered
    pub messages: Vec<ParsedMessage>,
}

impl ChannelPage {
    fn newest_post(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().map(|m| m.posted_at).max()
    }

    fn oldest_id(&self) -> Option<i64> {
        self.messages.iter().map(|m| m.message_id).min()
    }
}

/// Parse a `t.me/s/<channel>` page. Messages without a usable id or
/// timestamp are skipped.
pub fn parse_channel_page(html: &str) -> ChannelPage {
    let document = Html::parse_document(html);

    let title = document
        .select(&CHANNEL_TITLE)
        .next()
        .map(collapse_text)
        .filter(|t| !t.is_empty());

    let messages = document
        .select(&MESSAGE)
        .filter_map(|el| match parse_message(el) {
            Some(msg) => Some(msg),
            None => {
                debug!("Skipping message without id or date: {:?}", el.value().attr("data-post"));
                None
            }
        })
        .collect();

    ChannelPage { title, messages }
}

fn parse_message(el: ElementRef<'_>) -> Option<ParsedMessage> {
    let message_id = el
        .value()
        .attr("data-post")?
        .rsplit('/')
        .next()?
        .parse::<i64>()
        .ok()?;

    let posted_at = el
        .select(&MESSAGE_TIME)
        .filter_map(|t| t.value().attr("datetime"))
        .find_map(|dt| DateTime::parse_from_rfc3339(dt).ok())?
        .with_timezone(&Utc);

    let text = el
        .select(&MESSAGE_TEXT)
        .next()
        .map(collapse_text)
        .filter(|t| !t.is_empty());

    let views = el
        .select(&MESSAGE_VIEWS)
        .next()
        .map(collapse_text)
        .map(|v| parse_views(&v));

    let photo_urls = el
        .select(&MESSAGE_PHOTO)
        .filter_map(|p| p.value().attr("style"))
        .filter_map(|style| BACKGROUND_URL.captures(style).map(|cap| cap[1].to_string()))
        .collect();

    Some(ParsedMessage { message_id, text, posted_at, views, photo_urls })
}

fn collapse_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content id of a Telegram message in the shared content table
pub fn content_id(channel: &str, message_id: i64) -> String {
    format!("telegram:{}/{}", channel, message_id)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TelegramStats {
    pub channels_scraped: usize,
    pub channels_failed: usize,
    pub channels_disabled: usize,
    pub new_messages: usize,
    pub mentions_inserted: usize,
}

/// Fetches one preview page of a channel
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Newest page when `before` is None, otherwise the page of messages
    /// older than `before`.
    async fn fetch_page(&self, channel: &str, before: Option<i64>) -> Result<ChannelPage>;
}

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate-limited client for `t.me/s` preview pages
pub struct PreviewClient {
    client: Client,
    rate_limiter: DirectLimiter,
}

impl PreviewClient {
    pub fn new(profile: &BrowserProfile, requests_per_second: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .user_agent(profile.user_agent.as_str())
            .build()?;

        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            rate_limiter: GovRateLimiter::direct(quota),
        })
    }
}

#[async_trait]
impl ChannelSource for PreviewClient {
    async fn fetch_page(&self, channel: &str, before: Option<i64>) -> Result<ChannelPage> {
        self.rate_limiter.until_ready().await;

        let mut request = self.client.get(format!("{}/{}", PREVIEW_BASE, channel));
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }
        debug!(channel, ?before, "Fetching channel page");

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api { status: status.as_u16(), message: format!("t.me/s/{}", channel) });
        }

        Ok(parse_channel_page(&response.text().await?))
    }
}

pub struct TelegramScraper<S = PreviewClient> {
    source: S,
    config: TelegramConfig,
    pacing: PacingPolicy,
    parser: MentionParser,
}

impl TelegramScraper<PreviewClient> {
    pub fn new(config: TelegramConfig, pacing: PacingPolicy, profile: &BrowserProfile, parser: MentionParser) -> Result<Self> {
        let source = PreviewClient::new(profile, config.requests_per_second)?;
        Ok(Self::with_source(source, config, pacing, parser))
    }
}

impl<S: ChannelSource> TelegramScraper<S> {
    pub fn with_source(source: S, config: TelegramConfig, pacing: PacingPolicy, parser: MentionParser) -> Self {
        Self { source, config, pacing, parser }
    }

    fn recency_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(self.config.recency_days)
    }

    /// Messages newer than both `after_id` and `cutoff`, newest page first,
    /// at most `limit`. Returns the first page too, for activity checks.
    async fn fetch_recent(
        &self,
        channel: &str,
        after_id: i64,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<(ChannelPage, Vec<ParsedMessage>)> {
        let first = self.source.fetch_page(channel, None).await?;
        let mut collected = Vec::new();
        let mut page = first.clone();

        loop {
            let oldest_id = page.oldest_id();
            let mut reached_end = page.messages.is_empty();

            for msg in page.messages.into_iter().rev() {
                if msg.message_id <= after_id || msg.posted_at < cutoff {
                    reached_end = true;
                    continue;
                }
                collected.push(msg);
            }

            if reached_end || collected.len() >= limit {
                break;
            }
            match oldest_id {
                Some(id) if id > 1 => page = self.source.fetch_page(channel, Some(id)).await?,
                _ => break,
            }
        }

        collected.sort_by_key(|m| m.message_id);
        collected.dedup_by_key(|m| m.message_id);
        if collected.len() > limit {
            collected.drain(..collected.len() - limit);
        }
        Ok((first, collected))
    }

    /// Add a channel by hand. Returns false if it is already registered.
    pub async fn register_channel(&self, db: &Database, username: &str) -> Result<bool> {
        let username = username.trim().trim_start_matches('@');
        if username.is_empty() {
            return Err(Error::configuration("channel username is empty"));
        }
        if db.get_channel(username)?.is_some() {
            info!("Channel @{} already registered", username);
            return Ok(false);
        }

        let page = self.source.fetch_page(username, None).await?;
        let title = page.title.unwrap_or_else(|| username.to_string());
        let channel = ChannelConfig::new(username, &title, self.config.default_scrape_interval_minutes);
        let added = db.add_channel(&channel)?;
        info!("Registered channel @{} ({})", username, title);
        Ok(added)
    }

    /// Propose the configured seed channels and keep the ones with a message
    /// inside the recency window. Returns the number added.
    pub async fn discover_channels(&self, db: &Database, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = self.recency_cutoff(now);
        let mut added = 0;

        for seed in &self.config.seed_channels {
            let username = seed.trim().trim_start_matches('@');
            if username.is_empty() || db.get_channel(username)?.is_some() {
                continue;
            }

            let page = match self.source.fetch_page(username, None).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(channel = username, error = %e, "Discovery fetch failed");
                    continue;
                }
            };

            if page.newest_post().is_some_and(|t| t >= cutoff) {
                let title = page.title.clone().unwrap_or_else(|| username.to_string());
                let channel = ChannelConfig::new(username, &title, self.config.default_scrape_interval_minutes);
                if db.add_channel(&channel)? {
                    info!("Discovered active channel @{}", username);
                    added += 1;
                }
            } else {
                debug!("Seed channel @{} has no recent messages", username);
            }

            self.pacing.pause(ActionClass::InterChannel).await;
        }

        Ok(added)
    }

    /// Scrape every enabled channel whose interval has elapsed. One failing
    /// channel never stops the others.
    pub async fn scrape_all_channels(&self, db: &Database, now: DateTime<Utc>) -> Result<TelegramStats> {
        let resolver = SymbolResolver::from_tokens(&db.load_tokens()?);
        let due: Vec<ChannelConfig> = db
            .load_enabled_channels()?
            .into_iter()
            .filter(|c| c.is_due(now))
            .collect();

        let mut stats = TelegramStats::default();
        info!("Scraping {} due Telegram channels", due.len());

        for (i, channel) in due.iter().enumerate() {
            if i > 0 {
                self.pacing.pause(ActionClass::InterChannel).await;
            }

            match self.scrape_channel(db, &resolver, channel, now).await {
                Ok(ChannelScrape::Inactive) => {
                    info!("Disabling @{}: no messages in the last {} days", channel.username, self.config.recency_days);
                    match db.disable_channel(&channel.username, now) {
                        Ok(()) => stats.channels_disabled += 1,
                        Err(e) => {
                            warn!(channel = %channel.username, error = %e, "Failed to disable channel");
                            stats.channels_failed += 1;
                        }
                    }
                }
                Ok(ChannelScrape::Scraped { new_messages, mentions }) => {
                    stats.channels_scraped += 1;
                    stats.new_messages += new_messages;
                    stats.mentions_inserted += mentions;
                }
                Err(e) => {
                    warn!(channel = %channel.username, error = %e, "Channel scrape failed");
                    stats.channels_failed += 1;
                }
            }
        }

        info!(
            "Telegram cycle: {} scraped, {} failed, {} disabled, {} new messages, {} mentions",
            stats.channels_scraped,
            stats.channels_failed,
            stats.channels_disabled,
            stats.new_messages,
            stats.mentions_inserted
        );
        Ok(stats)
    }

    async fn scrape_channel(
        &self,
        db: &Database,
        resolver: &SymbolResolver,
        channel: &ChannelConfig,
        now: DateTime<Utc>,
    ) -> Result<ChannelScrape> {
        let cutoff = self.recency_cutoff(now);
        let (first, messages) = self
            .fetch_recent(&channel.username, channel.last_message_id, cutoff, self.config.messages_per_channel)
            .await?;

        if !first.newest_post().is_some_and(|t| t >= cutoff) {
            return Ok(ChannelScrape::Inactive);
        }

        let (new_messages, mentions) = self.store_messages(db, resolver, channel, &messages, now)?;
        let last_id = messages.iter().map(|m| m.message_id).max().unwrap_or(channel.last_message_id);
        db.record_channel_scrape(&channel.username, last_id, now)?;

        debug!(channel = %channel.username, new_messages, mentions, "Channel scraped");
        Ok(ChannelScrape::Scraped { new_messages, mentions })
    }

    /// Persist messages and their mentions. Returns (messages inserted,
    /// mention rows inserted).
    pub fn store_messages(
        &self,
        db: &Database,
        resolver: &SymbolResolver,
        channel: &ChannelConfig,
        messages: &[ParsedMessage],
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let rows: Vec<TelegramMessage> = messages
            .iter()
            .map(|m| TelegramMessage {
                channel_username: channel.username.clone(),
                message_id: m.message_id,
                text: m.text.clone(),
                posted_at: m.posted_at,
                views: m.views,
                photo_urls: if channel.scrape_media { m.photo_urls.clone() } else { Vec::new() },
                scraped_at: now,
            })
            .collect();
        let inserted = db.store_telegram_messages(&rows)?;

        let mut mentions = 0;
        for msg in messages {
            let Some(text) = msg.text.as_deref() else {
                continue;
            };
            let counts = self.parser.parse(text);
            if counts.is_empty() {
                continue;
            }

            let item = ContentItem {
                id: content_id(&channel.username, msg.message_id),
                platform: Platform::Telegram,
                author: channel.username.clone(),
                url: format!("https://t.me/{}/{}", channel.username, msg.message_id),
                thumbnail_url: msg.photo_urls.first().cloned(),
                posted_at: msg.posted_at,
                fetched_at: now,
                view_count: msg.views.unwrap_or(0),
                comment_count: 0,
                last_mention_check_at: Some(now),
            };
            if let Err(e) = db.upsert_content(&item) {
                warn!(content_id = %item.id, error = %e, "Failed to store message content");
                continue;
            }

            let rows = resolver.resolve(&item.id, &counts, msg.posted_at);
            match db.insert_mentions_if_absent(&item.id, &rows) {
                Ok(outcome) => mentions += outcome.inserted(),
                Err(e) => warn!(content_id = %item.id, error = %e, "Failed to store message mentions"),
            }
        }

        Ok((inserted, mentions))
    }

    /// Scrape on a fixed cycle and rerun discovery on its own longer
    /// interval, until `shutdown` resolves. A signal that arrives mid-cycle
    /// abandons the channel in flight; it is still due next time.
    pub async fn run_continuous<F>(&self, db: &Database, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let cycle = Duration::from_secs(self.config.cycle_minutes.max(1) * 60);
        info!("Starting Telegram scraper: cycle every {}m", self.config.cycle_minutes);
        tokio::pin!(shutdown);

        let mut last_discovery: Option<DateTime<Utc>> = None;
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.run_cycle(db, &mut last_discovery) => cycles += 1,
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(cycle) => {}
            }
        }

        info!("Telegram scraper shutting down after {} cycles", cycles);
        Ok(())
    }

    async fn run_cycle(&self, db: &Database, last_discovery: &mut Option<DateTime<Utc>>) {
        let now = Utc::now();
        let discovery_every = ChronoDuration::hours(self.config.discovery_interval_hours as i64);
        if last_discovery.map_or(true, |t| now - t >= discovery_every) {
            match self.discover_channels(db, now).await {
                Ok(added) => info!("Discovery added {} channels", added),
                Err(e) => error!("Channel discovery failed: {}", e),
            }
            *last_discovery = Some(now);
        }

        if let Err(e) = self.scrape_all_channels(db, now).await {
            error!("Telegram cycle failed: {}", e);
        }
    }
}

enum ChannelScrape {
    Inactive,
    Scraped { new_messages: usize, mentions: usize },
}
