//! SQLite storage for content, tokens, mentions and aggregates

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::Result;

/// Database handle for SQLite operations.
///
/// The connection sits behind a mutex so one handle can be shared by the
/// monitor, the aggregation job and the HTTP handlers.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create new database connection
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::error::Error::configuration(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic while holding the lock leaves the connection itself usable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run database migrations
    pub fn run_migrations(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            -- One row per scraped post, keyed by the platform-native id
            CREATE TABLE IF NOT EXISTS content_items (
                id TEXT PRIMARY KEY,
                platform TEXT NOT NULL DEFAULT 'tiktok',
                author TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL,
                thumbnail_url TEXT,
                posted_at INTEGER NOT NULL,          -- Unix seconds
                fetched_at INTEGER NOT NULL,
                view_count INTEGER NOT NULL DEFAULT 0,
                comment_count INTEGER NOT NULL DEFAULT 0,
                last_mention_check_at INTEGER        -- NULL = never checked
            );

            CREATE INDEX IF NOT EXISTS idx_content_check ON content_items(platform, last_mention_check_at);
            CREATE INDEX IF NOT EXISTS idx_content_fetched ON content_items(fetched_at);

            -- Known tradable tokens, maintained outside the pipeline
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                uri TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_symbol ON tokens(symbol);
            CREATE INDEX IF NOT EXISTS idx_tokens_uri ON tokens(uri);

            CREATE TABLE IF NOT EXISTS mentions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_id TEXT NOT NULL REFERENCES content_items(id),
                token_id INTEGER NOT NULL REFERENCES tokens(id),
                count INTEGER NOT NULL,
                mention_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_mentions_content ON mentions(content_id);
            CREATE INDEX IF NOT EXISTS idx_mentions_token ON mentions(token_id, mention_at);

            CREATE TABLE IF NOT EXISTS telegram_channels (
                username TEXT PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                last_message_id INTEGER NOT NULL DEFAULT 0,
                scrape_media BOOLEAN NOT NULL DEFAULT FALSE,
                scrape_interval_minutes INTEGER NOT NULL DEFAULT 15,
                last_scraped_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telegram_messages (
                channel_username TEXT NOT NULL,
                message_id INTEGER NOT NULL,
                text TEXT,
                posted_at INTEGER NOT NULL,
                views INTEGER,
                photo_urls TEXT NOT NULL DEFAULT '[]',   -- JSON array
                scraped_at INTEGER NOT NULL,
                PRIMARY KEY (channel_username, message_id)
            );

            CREATE INDEX IF NOT EXISTS idx_tg_messages_posted ON telegram_messages(posted_at);

            -- Hourly trading volume per token URI (external market data)
            CREATE TABLE IF NOT EXISTS token_volumes (
                token_uri TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                volume_usd REAL NOT NULL,
                price_usd REAL,
                PRIMARY KEY (token_uri, bucket_start)
            );

            CREATE TABLE IF NOT EXISTS analysis_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                computed_at INTEGER NOT NULL,
                window_hours INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS token_correlations (
                run_id INTEGER NOT NULL REFERENCES analysis_runs(id),
                token_id INTEGER NOT NULL REFERENCES tokens(id),
                total_mentions INTEGER NOT NULL,
                total_views INTEGER NOT NULL,
                volume_24h REAL NOT NULL,
                price_change_24h REAL NOT NULL,
                correlation_score REAL NOT NULL,
                PRIMARY KEY (run_id, token_id)
            );

            CREATE INDEX IF NOT EXISTS idx_correlations_score ON token_correlations(correlation_score);
            "#,
        )?;

        Ok(())
    }

    // === Content ===

    /// Insert or update a content item. Every non-key field is overwritten
    /// except the mention-check timestamp, which a re-scrape never clears.
    pub fn upsert_content(&self, item: &ContentItem) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO content_items (
                id, platform, author, url, thumbnail_url, posted_at, fetched_at,
                view_count, comment_count, last_mention_check_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                platform = excluded.platform,
                author = excluded.author,
                url = excluded.url,
                thumbnail_url = excluded.thumbnail_url,
                posted_at = excluded.posted_at,
                fetched_at = excluded.fetched_at,
                view_count = excluded.view_count,
                comment_count = excluded.comment_count,
                last_mention_check_at = COALESCE(excluded.last_mention_check_at, last_mention_check_at)
            "#,
            params![
                item.id,
                item.platform.as_str(),
                item.author,
                item.url,
                item.thumbnail_url,
                item.posted_at.timestamp(),
                item.fetched_at.timestamp(),
                item.view_count,
                item.comment_count,
                item.last_mention_check_at.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    pub fn get_content(&self, id: &str) -> Result<Option<ContentItem>> {
        let sql = format!("SELECT {} FROM content_items WHERE id = ?1", CONTENT_COLUMNS);
        let item = self
            .conn()
            .query_row(&sql, params![id], content_from_row)
            .optional()?;
        Ok(item)
    }

    /// Items whose mentions were never checked or were last checked before
    /// `now - staleness`, never-checked first, then oldest check first.
    pub fn select_stale_content(
        &self,
        platform: Platform,
        now: DateTime<Utc>,
        staleness: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<ContentItem>> {
        let cutoff = (now - staleness).timestamp();
        let sql = format!(
            "SELECT {} FROM content_items
             WHERE platform = ?1
               AND (last_mention_check_at IS NULL OR last_mention_check_at < ?2)
             ORDER BY last_mention_check_at ASC NULLS FIRST, id ASC
             LIMIT ?3",
            CONTENT_COLUMNS
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![platform.as_str(), cutoff, limit as i64], content_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn mark_mention_checked(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE content_items SET last_mention_check_at = ?1 WHERE id = ?2",
            params![at.timestamp(), id],
        )?;
        Ok(())
    }

    /// Newest-fetched content first, optionally filtered by author or URL
    pub fn list_content(&self, search: Option<&str>, limit: usize, offset: usize) -> Result<Vec<ContentItem>> {
        let pattern = search_pattern(search);
        let sql = format!(
            "SELECT {} FROM content_items
             WHERE (?1 IS NULL OR author LIKE ?1 OR url LIKE ?1)
             ORDER BY fetched_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            CONTENT_COLUMNS
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![pattern, limit as i64, offset as i64], content_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn count_content(&self, search: Option<&str>) -> Result<i64> {
        let pattern = search_pattern(search);
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM content_items WHERE (?1 IS NULL OR author LIKE ?1 OR url LIKE ?1)",
            params![pattern],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn latest_content(&self, platform: Platform) -> Result<Option<ContentItem>> {
        let sql = format!(
            "SELECT {} FROM content_items WHERE platform = ?1 ORDER BY fetched_at DESC, id DESC LIMIT 1",
            CONTENT_COLUMNS
        );
        let item = self
            .conn()
            .query_row(&sql, params![platform.as_str()], content_from_row)
            .optional()?;
        Ok(item)
    }

    // === Tokens and mentions ===

    pub fn load_tokens(&self) -> Result<Vec<TokenReference>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, symbol, name, uri FROM tokens ORDER BY id ASC")?;
        let tokens = stmt
            .query_map([], |row| {
                Ok(TokenReference {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    name: row.get(2)?,
                    uri: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    pub fn insert_token(&self, symbol: &str, name: &str, uri: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tokens (symbol, name, uri) VALUES (?1, ?2, ?3)",
            params![symbol, name, uri],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a batch of mentions unless the content item already has any.
    ///
    /// The existence check and the insert share one IMMEDIATE transaction,
    /// so two writers cannot both pass the check for the same content id.
    /// Rows are always written under `content_id`.
    pub fn insert_mentions_if_absent(&self, content_id: &str, mentions: &[Mention]) -> Result<InsertOutcome> {
        if mentions.is_empty() {
            return Ok(InsertOutcome::Empty);
        }

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM mentions WHERE content_id = ?1",
            params![content_id],
            |row| row.get(0),
        )?;

        if existing > 0 {
            info!(content_id, "Mentions already exist, skipping insert");
            return Ok(InsertOutcome::AlreadyExists);
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO mentions (content_id, token_id, count, mention_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for mention in mentions {
                stmt.execute(params![
                    content_id,
                    mention.token_id,
                    mention.count,
                    mention.mention_at.timestamp(),
                ])?;
            }
        }
        tx.commit()?;

        debug!(content_id, rows = mentions.len(), "Stored mentions");
        Ok(InsertOutcome::Inserted(mentions.len()))
    }

    pub fn count_mentions(&self, content_id: &str) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM mentions WHERE content_id = ?1",
            params![content_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mentions_for_content(&self, content_id: &str) -> Result<Vec<Mention>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT content_id, token_id, count, mention_at FROM mentions
             WHERE content_id = ?1 ORDER BY token_id",
        )?;
        let mentions = stmt
            .query_map(params![content_id], |row| {
                Ok(Mention {
                    content_id: row.get(0)?,
                    token_id: row.get(1)?,
                    count: row.get(2)?,
                    mention_at: from_ts(row.get(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(mentions)
    }

    /// (mention time, count) pairs for one token since `since`
    pub fn mention_series(&self, token_id: i64, since: DateTime<Utc>) -> Result<Vec<(DateTime<Utc>, i64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT mention_at, count FROM mentions
             WHERE token_id = ?1 AND mention_at >= ?2 ORDER BY mention_at",
        )?;
        let series = stmt
            .query_map(params![token_id, since.timestamp()], |row| {
                Ok((from_ts(row.get(0)?), row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(series)
    }

    /// Total views of distinct content items that mentioned the token
    pub fn token_view_total(&self, token_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let total = self.conn().query_row(
            "SELECT COALESCE(SUM(view_count), 0) FROM content_items
             WHERE id IN (SELECT content_id FROM mentions WHERE token_id = ?1 AND mention_at >= ?2)",
            params![token_id, since.timestamp()],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // === Telegram ===

    /// Register a channel; returns false when it already exists
    pub fn add_channel(&self, channel: &ChannelConfig) -> Result<bool> {
        let now = Utc::now().timestamp();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO telegram_channels (
                username, display_name, enabled, last_message_id, scrape_media,
                scrape_interval_minutes, last_scraped_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                channel.username,
                channel.display_name,
                channel.enabled,
                channel.last_message_id,
                channel.scrape_media,
                channel.scrape_interval_minutes,
                channel.last_scraped_at.map(|t| t.timestamp()),
                now,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_channel(&self, username: &str) -> Result<Option<ChannelConfig>> {
        let sql = format!("SELECT {} FROM telegram_channels WHERE username = ?1", CHANNEL_COLUMNS);
        let channel = self
            .conn()
            .query_row(&sql, params![username], channel_from_row)
            .optional()?;
        Ok(channel)
    }

    pub fn load_enabled_channels(&self) -> Result<Vec<ChannelConfig>> {
        self.query_channels("WHERE enabled = 1")
    }

    pub fn list_channels(&self) -> Result<Vec<ChannelConfig>> {
        self.query_channels("")
    }

    fn query_channels(&self, filter: &str) -> Result<Vec<ChannelConfig>> {
        let sql = format!(
            "SELECT {} FROM telegram_channels {} ORDER BY username",
            CHANNEL_COLUMNS, filter
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    pub fn disable_channel(&self, username: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE telegram_channels SET enabled = 0, updated_at = ?1 WHERE username = ?2",
            params![at.timestamp(), username],
        )?;
        Ok(())
    }

    /// Remember how far a channel has been scraped. The last message id never
    /// moves backwards.
    pub fn record_channel_scrape(&self, username: &str, last_message_id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE telegram_channels
             SET last_message_id = MAX(last_message_id, ?1), last_scraped_at = ?2, updated_at = ?2
             WHERE username = ?3",
            params![last_message_id, at.timestamp(), username],
        )?;
        Ok(())
    }

    /// Store messages, ignoring ones already stored. Returns rows inserted.
    pub fn store_telegram_messages(&self, messages: &[TelegramMessage]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO telegram_messages
                 (channel_username, message_id, text, posted_at, views, photo_urls, scraped_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for msg in messages {
                let photos = serde_json::to_string(&msg.photo_urls)?;
                inserted += stmt.execute(params![
                    msg.channel_username,
                    msg.message_id,
                    msg.text,
                    msg.posted_at.timestamp(),
                    msg.views,
                    photos,
                    msg.scraped_at.timestamp(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn recent_telegram_messages(&self, limit: usize) -> Result<Vec<TelegramMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT channel_username, message_id, text, posted_at, views, photo_urls, scraped_at
             FROM telegram_messages ORDER BY posted_at DESC, message_id DESC LIMIT ?1",
        )?;
        let messages = stmt
            .query_map(params![limit as i64], |row| {
                let photos: String = row.get(5)?;
                Ok(TelegramMessage {
                    channel_username: row.get(0)?,
                    message_id: row.get(1)?,
                    text: row.get(2)?,
                    posted_at: from_ts(row.get(3)?),
                    views: row.get(4)?,
                    photo_urls: serde_json::from_str(&photos).unwrap_or_default(),
                    scraped_at: from_ts(row.get(6)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    // === Market data ===

    pub fn upsert_volume_samples(&self, samples: &[VolumeSample]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO token_volumes (token_uri, bucket_start, volume_usd, price_usd)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(token_uri, bucket_start) DO UPDATE SET
                    volume_usd = excluded.volume_usd,
                    price_usd = COALESCE(excluded.price_usd, price_usd)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    sample.token_uri,
                    sample.bucket_start.timestamp(),
                    sample.volume_usd,
                    sample.price_usd,
                ])?;
            }
        }
        tx.commit()?;
        Ok(samples.len())
    }

    pub fn volume_series(&self, token_uri: &str, since: DateTime<Utc>) -> Result<Vec<VolumeSample>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT token_uri, bucket_start, volume_usd, price_usd FROM token_volumes
             WHERE token_uri = ?1 AND bucket_start >= ?2 ORDER BY bucket_start",
        )?;
        let samples = stmt
            .query_map(params![token_uri, since.timestamp()], |row| {
                Ok(VolumeSample {
                    token_uri: row.get(0)?,
                    bucket_start: from_ts(row.get(1)?),
                    volume_usd: row.get(2)?,
                    price_usd: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    // === Analysis runs ===

    pub fn record_analysis(&self, at: DateTime<Utc>, window_hours: i64, metrics: &[AggregateMetric]) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO analysis_runs (computed_at, window_hours) VALUES (?1, ?2)",
            params![at.timestamp(), window_hours],
        )?;
        let run_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO token_correlations (
                    run_id, token_id, total_mentions, total_views, volume_24h,
                    price_change_24h, correlation_score
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for m in metrics {
                stmt.execute(params![
                    run_id,
                    m.token_id,
                    m.total_mentions,
                    m.tiktok_views_24h,
                    m.trading_volume_24h,
                    m.price_change_24h,
                    m.correlation_score,
                ])?;
            }
        }
        tx.commit()?;
        Ok(run_id)
    }

    /// Metrics of the most recent analysis run, unordered
    pub fn latest_metrics(&self) -> Result<Vec<AggregateMetric>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT t.id, t.uri, t.symbol, t.name, c.volume_24h, c.total_views,
                    c.correlation_score, c.price_change_24h, c.total_mentions, r.computed_at
             FROM token_correlations c
             JOIN analysis_runs r ON r.id = c.run_id
             JOIN tokens t ON t.id = c.token_id
             WHERE c.run_id = (SELECT MAX(id) FROM analysis_runs)
             ORDER BY t.id",
        )?;
        let metrics = stmt
            .query_map([], |row| {
                Ok(AggregateMetric {
                    token_id: row.get(0)?,
                    uri: row.get(1)?,
                    symbol: row.get(2)?,
                    name: row.get(3)?,
                    trading_volume_24h: row.get(4)?,
                    tiktok_views_24h: row.get(5)?,
                    correlation_score: row.get(6)?,
                    price_change_24h: row.get(7)?,
                    total_mentions: row.get(8)?,
                    last_updated: from_ts(row.get(9)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(metrics)
    }

    pub fn analysis_summary(&self, recommendation_threshold: f64) -> Result<AnalysisSummary> {
        let conn = self.conn();
        let last_analysis: Option<i64> =
            conn.query_row("SELECT MAX(computed_at) FROM analysis_runs", [], |row| row.get(0))?;
        let total_correlations: i64 =
            conn.query_row("SELECT COUNT(*) FROM token_correlations", [], |row| row.get(0))?;
        let total_recommendations: i64 = conn.query_row(
            "SELECT COUNT(*) FROM token_correlations WHERE correlation_score >= ?1",
            params![recommendation_threshold],
            |row| row.get(0),
        )?;
        Ok(AnalysisSummary {
            last_analysis: last_analysis.map(from_ts),
            total_correlations,
            total_recommendations,
        })
    }

    // === Storage statistics ===

    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn();
        let count = |table: &str| -> Result<i64> {
            let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n)
        };

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(StorageStats {
            content_count: count("content_items")?,
            unchecked_count: conn.query_row(
                "SELECT COUNT(*) FROM content_items WHERE last_mention_check_at IS NULL",
                [],
                |row| row.get(0),
            )?,
            token_count: count("tokens")?,
            mention_count: count("mentions")?,
            channel_count: count("telegram_channels")?,
            message_count: count("telegram_messages")?,
            volume_sample_count: count("token_volumes")?,
            analysis_run_count: count("analysis_runs")?,
            db_size_bytes: page_count * page_size,
        })
    }
}

const CONTENT_COLUMNS: &str = "id, platform, author, url, thumbnail_url, posted_at, fetched_at, \
                               view_count, comment_count, last_mention_check_at";

const CHANNEL_COLUMNS: &str = "username, display_name, enabled, last_message_id, scrape_media, \
                               scrape_interval_minutes, last_scraped_at";

fn content_from_row(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
    let platform: String = row.get(1)?;
    let last_check: Option<i64> = row.get(9)?;
    Ok(ContentItem {
        id: row.get(0)?,
        platform: Platform::parse(&platform).unwrap_or(Platform::TikTok),
        author: row.get(2)?,
        url: row.get(3)?,
        thumbnail_url: row.get(4)?,
        posted_at: from_ts(row.get(5)?),
        fetched_at: from_ts(row.get(6)?),
        view_count: row.get(7)?,
        comment_count: row.get(8)?,
        last_mention_check_at: last_check.map(from_ts),
    })
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelConfig> {
    let last_scraped: Option<i64> = row.get(6)?;
    Ok(ChannelConfig {
        username: row.get(0)?,
        display_name: row.get(1)?,
        enabled: row.get(2)?,
        last_message_id: row.get(3)?,
        scrape_media: row.get(4)?,
        scrape_interval_minutes: row.get(5)?,
        last_scraped_at: last_scraped.map(from_ts),
    })
}

fn search_pattern(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s))
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// === Data structures ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    TikTok,
    Telegram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::TikTok => "tiktok",
            Platform::Telegram => "telegram",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tiktok" => Some(Platform::TikTok),
            "telegram" => Some(Platform::Telegram),
            _ => None,
        }
    }
}

/// One scraped social post
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentItem {
    pub id: String,
    pub platform: Platform,
    pub author: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub view_count: i64,
    pub comment_count: i64,
    pub last_mention_check_at: Option<DateTime<Utc>>,
}

/// A known tradable token. Symbols are not unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenReference {
    pub id: i64,
    pub symbol: String,
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub content_id: String,
    pub token_id: i64,
    pub count: i64,
    pub mention_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(usize),
    AlreadyExists,
    Empty,
}

impl InsertOutcome {
    pub fn inserted(&self) -> usize {
        match self {
            InsertOutcome::Inserted(n) => *n,
            _ => 0,
        }
    }
}

/// A monitored Telegram channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelConfig {
    pub username: String,
    pub display_name: String,
    pub enabled: bool,
    pub last_message_id: i64,
    pub scrape_media: bool,
    pub scrape_interval_minutes: i64,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl ChannelConfig {
    pub fn new(username: &str, display_name: &str, scrape_interval_minutes: i64) -> Self {
        Self {
            username: username.trim_start_matches('@').to_string(),
            display_name: display_name.to_string(),
            enabled: true,
            last_message_id: 0,
            scrape_media: false,
            scrape_interval_minutes,
            last_scraped_at: None,
        }
    }

    /// Due when never scraped or when the scrape interval has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_scraped_at {
            None => true,
            Some(last) => now - last >= chrono::Duration::minutes(self.scrape_interval_minutes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelegramMessage {
    pub channel_username: String,
    pub message_id: i64,
    pub text: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub views: Option<i64>,
    pub photo_urls: Vec<String>,
    pub scraped_at: DateTime<Utc>,
}

/// Trading volume for one token over one hour bucket
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSample {
    pub token_uri: String,
    pub bucket_start: DateTime<Utc>,
    pub volume_usd: f64,
    pub price_usd: Option<f64>,
}

/// Per-token rollup of social and market signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateMetric {
    pub token_id: i64,
    pub uri: String,
    pub symbol: String,
    pub name: String,
    pub trading_volume_24h: f64,
    pub tiktok_views_24h: i64,
    pub correlation_score: f64,
    pub price_change_24h: f64,
    pub total_mentions: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSummary {
    pub last_analysis: Option<DateTime<Utc>>,
    pub total_correlations: i64,
    pub total_recommendations: i64,
}

#[derive(Debug)]
pub struct StorageStats {
    pub content_count: i64,
    pub unchecked_count: i64,
    pub token_count: i64,
    pub mention_count: i64,
    pub channel_count: i64,
    pub message_count: i64,
    pub volume_sample_count: i64,
    pub analysis_run_count: i64,
    pub db_size_bytes: i64,
}

impl StorageStats {
    pub fn print_report(&self) {
        println!("\n{}", "=".repeat(50));
        println!("STORAGE STATISTICS");
        println!("{}", "=".repeat(50));
        println!("\nRecords:");
        println!("  Content items:    {:>10}", self.content_count);
        println!("  Never checked:    {:>10} ({:.1}%)",
            self.unchecked_count,
            self.unchecked_count as f64 / self.content_count.max(1) as f64 * 100.0
        );
        println!("  Tokens:           {:>10}", self.token_count);
        println!("  Mentions:         {:>10}", self.mention_count);
        println!("  Telegram channels:{:>10}", self.channel_count);
        println!("  Telegram messages:{:>10}", self.message_count);
        println!("  Volume samples:   {:>10}", self.volume_sample_count);
        println!("  Analysis runs:    {:>10}", self.analysis_run_count);
        println!("\nStorage:");
        println!("  Database size:    {:>10}", format_bytes(self.db_size_bytes));
    }
}

fn format_bytes(bytes: i64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
    } else {
        format!("{:.2} GB", bytes as f64 / 1024.0 / 1024.0 / 1024.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Duration;

    pub(crate) fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db
    }

    pub(crate) fn content(id: &str, last_check: Option<DateTime<Utc>>) -> ContentItem {
        let now = Utc::now();
        ContentItem {
            id: id.to_string(),
            platform: Platform::TikTok,
            author: "moonboy".to_string(),
            url: format!("https://www.tiktok.com/@moonboy/video/{}", id),
            thumbnail_url: None,
            posted_at: now,
            fetched_at: now,
            view_count: 100,
            comment_count: 2,
            last_mention_check_at: last_check,
        }
    }

    /// Every later `disable_channel` fails at the store
    pub(crate) fn reject_channel_disable(db: &Database) {
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_disable BEFORE UPDATE OF enabled ON telegram_channels
                 WHEN NEW.enabled = 0
                 BEGIN SELECT RAISE(ABORT, 'channel rows are locked'); END;",
            )
            .unwrap();
    }

    fn mention(content_id: &str, token_id: i64, count: i64) -> Mention {
        Mention {
            content_id: content_id.to_string(),
            token_id,
            count,
            mention_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_content_is_idempotent() {
        let db = test_db();
        let item = content("12345", None);
        db.upsert_content(&item).unwrap();
        db.upsert_content(&item).unwrap();

        assert_eq!(db.count_content(None).unwrap(), 1);
        assert_eq!(db.get_content("12345").unwrap().unwrap().id, "12345");
    }

    #[test]
    fn test_upsert_content_last_write_wins() {
        let db = test_db();
        let mut item = content("1", None);
        db.upsert_content(&item).unwrap();
        let checked = Utc::now() - Duration::minutes(1);
        db.mark_mention_checked("1", checked).unwrap();

        item.view_count = 999;
        item.author = "renamed".to_string();
        db.upsert_content(&item).unwrap();

        let stored = db.get_content("1").unwrap().unwrap();
        assert_eq!(stored.view_count, 999);
        assert_eq!(stored.author, "renamed");
        // re-scrape does not clear the check timestamp
        assert_eq!(stored.last_mention_check_at.unwrap().timestamp(), checked.timestamp());
    }

    #[test]
    fn test_insert_mentions_if_absent_dedups_by_content() {
        let db = test_db();
        let bonk = db.insert_token("BONK", "Bonk", "uri:bonk").unwrap();
        let wif = db.insert_token("WIF", "dogwifhat", "uri:wif").unwrap();
        let popcat = db.insert_token("POPCAT", "Popcat", "uri:popcat").unwrap();
        db.upsert_content(&content("1", None)).unwrap();

        let first = db
            .insert_mentions_if_absent("1", &[mention("1", bonk, 2), mention("1", wif, 2)])
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted(2));

        let second = db.insert_mentions_if_absent("1", &[mention("1", popcat, 5)]).unwrap();
        assert_eq!(second, InsertOutcome::AlreadyExists);
        assert_eq!(db.count_mentions("1").unwrap(), 2);
    }

    #[test]
    fn test_empty_mentions_are_noop() {
        let db = test_db();
        assert_eq!(db.insert_mentions_if_absent("1", &[]).unwrap(), InsertOutcome::Empty);
        assert_eq!(db.count_mentions("1").unwrap(), 0);
    }

    #[test]
    fn test_stale_selection_order_and_threshold() {
        let db = test_db();
        let now = Utc::now();
        db.upsert_content(&content("recent", Some(now - Duration::minutes(2)))).unwrap();
        db.upsert_content(&content("old", Some(now - Duration::minutes(10)))).unwrap();
        db.upsert_content(&content("never", None)).unwrap();

        let stale = db
            .select_stale_content(Platform::TikTok, now, Duration::minutes(5), 10)
            .unwrap();
        let ids: Vec<&str> = stale.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["never", "old"]);
    }

    #[test]
    fn test_stale_selection_respects_limit_and_platform() {
        let db = test_db();
        let now = Utc::now();
        for i in 0..5 {
            db.upsert_content(&content(&i.to_string(), None)).unwrap();
        }
        let mut tg = content("telegram:chan/1", None);
        tg.platform = Platform::Telegram;
        db.upsert_content(&tg).unwrap();

        let stale = db
            .select_stale_content(Platform::TikTok, now, Duration::minutes(5), 3)
            .unwrap();
        assert_eq!(stale.len(), 3);
        assert!(stale.iter().all(|c| c.platform == Platform::TikTok));
    }

    #[test]
    fn test_list_content_search_and_paging() {
        let db = test_db();
        let mut a = content("1", None);
        a.author = "solana_degen".to_string();
        let mut b = content("2", None);
        b.fetched_at = a.fetched_at + Duration::seconds(10);
        db.upsert_content(&a).unwrap();
        db.upsert_content(&b).unwrap();

        let all = db.list_content(None, 10, 0).unwrap();
        assert_eq!(all[0].id, "2");
        assert_eq!(db.list_content(None, 1, 1).unwrap()[0].id, "1");

        let found = db.list_content(Some("DEGEN"), 10, 0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(db.count_content(Some("degen")).unwrap(), 1);
        assert_eq!(db.count_content(Some("  ")).unwrap(), 2);
    }

    #[test]
    fn test_channels_lifecycle() {
        let db = test_db();
        let channel = ChannelConfig::new("@memecoin_hunters", "Memecoin Hunters", 15);
        assert!(db.add_channel(&channel).unwrap());
        assert!(!db.add_channel(&channel).unwrap());

        let now = Utc::now();
        db.record_channel_scrape("memecoin_hunters", 120, now).unwrap();
        db.record_channel_scrape("memecoin_hunters", 90, now).unwrap();
        let stored = db.get_channel("memecoin_hunters").unwrap().unwrap();
        assert_eq!(stored.last_message_id, 120);
        assert!(!stored.is_due(now));
        assert!(stored.is_due(now + Duration::minutes(15)));

        db.disable_channel("memecoin_hunters", now).unwrap();
        assert!(db.load_enabled_channels().unwrap().is_empty());
        assert_eq!(db.list_channels().unwrap().len(), 1);
    }

    #[test]
    fn test_telegram_messages_ignore_duplicates() {
        let db = test_db();
        let msg = TelegramMessage {
            channel_username: "chan".to_string(),
            message_id: 10,
            text: Some("$BONK".to_string()),
            posted_at: Utc::now(),
            views: Some(1200),
            photo_urls: vec!["https://cdn.telegram.org/a.jpg".to_string()],
            scraped_at: Utc::now(),
        };
        assert_eq!(db.store_telegram_messages(&[msg.clone()]).unwrap(), 1);
        assert_eq!(db.store_telegram_messages(&[msg]).unwrap(), 0);

        let recent = db.recent_telegram_messages(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].photo_urls.len(), 1);
    }

    #[test]
    fn test_analysis_summary() {
        let db = test_db();
        let token = db.insert_token("BONK", "Bonk", "uri:bonk").unwrap();
        assert_eq!(db.analysis_summary(0.7).unwrap().last_analysis, None);

        let now = Utc::now();
        let metric = |score: f64| AggregateMetric {
            token_id: token,
            uri: "uri:bonk".to_string(),
            symbol: "BONK".to_string(),
            name: "Bonk".to_string(),
            trading_volume_24h: 10.0,
            tiktok_views_24h: 5,
            correlation_score: score,
            price_change_24h: 0.0,
            total_mentions: 1,
            last_updated: now,
        };
        db.record_analysis(now - Duration::hours(1), 24, &[metric(0.9)]).unwrap();
        db.record_analysis(now, 24, &[metric(0.2)]).unwrap();

        let summary = db.analysis_summary(0.7).unwrap();
        assert_eq!(summary.last_analysis.unwrap().timestamp(), now.timestamp());
        assert_eq!(summary.total_correlations, 2);
        assert_eq!(summary.total_recommendations, 1);

        let latest = db.latest_metrics().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].correlation_score, 0.2);
    }

    #[test]
    fn test_stats_and_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("data").join("mentions.db")).unwrap();
        db.run_migrations().unwrap();
        db.insert_token("WIF", "dogwifhat", "uri:wif").unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.token_count, 1);
        assert_eq!(stats.content_count, 0);
        assert!(stats.db_size_bytes > 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1500), "1.5 KB");
        assert_eq!(format_bytes(1500000), "1.4 MB");
    }
}
