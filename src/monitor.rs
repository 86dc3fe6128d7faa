//! Mention monitor - periodic re-checks of stored content
//!
//! Each cycle picks the items whose mentions are stale, fetches fresh
//! mentions for them and marks them checked. An item is marked checked even
//! when its fetch fails, so a permanently broken item cannot stall the queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::comments::CommentSource;
use crate::config::MonitorConfig;
use crate::db::{ContentItem, Database, Platform};
use crate::error::{Error, Result};
use crate::extractor::{MentionCounts, MentionParser};
use crate::resolver::SymbolResolver;

/// Fresh mention counts for one stored item
#[async_trait]
pub trait MentionSource: Send + Sync {
    async fn fetch_mentions(&self, item: &ContentItem) -> Result<MentionCounts>;
}

/// Mentions parsed from the item's current comments
pub struct CommentMentionSource<C> {
    comments: C,
    parser: MentionParser,
}

impl<C: CommentSource> CommentMentionSource<C> {
    pub fn new(comments: C, parser: MentionParser) -> Self {
        Self { comments, parser }
    }
}

#[async_trait]
impl<C: CommentSource> MentionSource for CommentMentionSource<C> {
    async fn fetch_mentions(&self, item: &ContentItem) -> Result<MentionCounts> {
        let bundle = self.comments.fetch_comments(&item.id).await?;
        Ok(self.parser.parse_all(bundle.texts.iter().map(String::as_str)))
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleStats {
    pub checked: usize,
    pub failed: usize,
    pub new_mentions: usize,
}

/// Totals over a continuous monitoring session
#[derive(Debug, Default, Clone)]
pub struct SessionSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub items_checked: usize,
    pub new_mentions: usize,
}

impl SessionSummary {
    fn absorb(&mut self, stats: &CycleStats) {
        self.cycles += 1;
        self.items_checked += stats.checked;
        self.new_mentions += stats.new_mentions;
    }
}

pub struct Monitor<S> {
    db: Arc<Database>,
    source: S,
    config: MonitorConfig,
    platform: Platform,
}

impl<S: MentionSource> Monitor<S> {
    pub fn new(db: Arc<Database>, source: S, config: MonitorConfig) -> Self {
        Self { db, source, config, platform: Platform::TikTok }
    }

    /// Run one cycle as if the clock read `now`
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleStats> {
        let resolver = SymbolResolver::from_tokens(&self.db.load_tokens()?);
        let items = self.db.select_stale_content(
            self.platform,
            now,
            self.config.staleness(),
            self.config.batch_size,
        )?;

        let mut stats = CycleStats::default();
        if items.is_empty() {
            debug!("No stale content to check");
            return Ok(stats);
        }
        info!("Checking mentions for {} items", items.len());

        for (i, item) in items.iter().enumerate() {
            if i > 0 && !self.config.item_delay().is_zero() {
                tokio::time::sleep(self.config.item_delay()).await;
            }

            match self.check_item(&resolver, item, now).await {
                Ok(inserted) => stats.new_mentions += inserted,
                Err(e) => {
                    warn!(content_id = %item.id, error = %e, "Mention check failed");
                    stats.failed += 1;
                }
            }

            if let Err(e) = self.db.mark_mention_checked(&item.id, now) {
                warn!(content_id = %item.id, error = %e, "Failed to mark item checked");
            }
            stats.checked += 1;
        }

        info!(
            "Cycle complete: {} checked, {} failed, {} new mentions",
            stats.checked, stats.failed, stats.new_mentions
        );
        Ok(stats)
    }

    async fn check_item(&self, resolver: &SymbolResolver, item: &ContentItem, now: DateTime<Utc>) -> Result<usize> {
        let counts = self.source.fetch_mentions(item).await?;
        let mentions = resolver.resolve(&item.id, &counts, now);
        Ok(self.db.insert_mentions_if_absent(&item.id, &mentions)?.inserted())
    }

    /// Run cycles on a fixed interval until `shutdown` resolves. Too many
    /// failed cycles in a row end the session with an error.
    ///
    /// `shutdown` is polled before each cycle starts, so signal handlers it
    /// installs on first poll are live from the start. A signal that arrives
    /// mid-cycle abandons the in-flight item; it stays stale and is picked
    /// up by the next session.
    pub async fn run_continuous<F>(&self, shutdown: F) -> Result<SessionSummary>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting mention monitor: every {}s, staleness {}s, batch {}",
            self.config.interval_seconds, self.config.staleness_seconds, self.config.batch_size
        );

        tokio::pin!(shutdown);
        let started = Instant::now();
        let mut summary = SessionSummary::default();
        let mut consecutive_failures = 0u32;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                outcome = self.run_cycle_at(Utc::now()) => outcome,
            };

            let delay = match outcome {
                Ok(stats) => {
                    consecutive_failures = 0;
                    summary.absorb(&stats);
                    self.config.interval()
                }
                Err(e) => {
                    consecutive_failures += 1;
                    summary.failed_cycles += 1;
                    error!(
                        "Monitor cycle failed ({}/{}): {}",
                        consecutive_failures, self.config.max_consecutive_failures, e
                    );
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        return Err(Error::ConsecutiveCycleFailure { count: consecutive_failures });
                    }
                    self.config.retry_delay()
                }
            };

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            "Monitor shutting down after {:.0}s: {} cycles ({} failed), {} items checked, {} new mentions",
            started.elapsed().as_secs_f64(),
            summary.cycles,
            summary.failed_cycles,
            summary.items_checked,
            summary.new_mentions
        );
        Ok(summary)
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error setting up Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Error setting up SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
