//! Social signal vs. trading volume correlation
//!
//! For each token, mentions and USD volume are bucketed by hour over a
//! rolling window. The score is the Pearson correlation of the two hourly
//! series, clamped to [0, 1]: negative or undefined correlation scores 0.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::CorrelationConfig;
use crate::db::{AggregateMetric, Database, TokenReference};
use crate::error::Result;
use crate::market::hour_bucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Correlation,
    Volume,
    Views,
    Mentions,
}

impl SortBy {
    /// Unknown values fall back to correlation
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "volume" | "trading_volume_24h" => SortBy::Volume,
            "views" | "tiktok_views_24h" => SortBy::Views,
            "mentions" | "total_mentions" => SortBy::Mentions,
            _ => SortBy::Correlation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::Correlation => "correlation",
            SortBy::Volume => "volume",
            SortBy::Views => "views",
            SortBy::Mentions => "mentions",
        }
    }

    fn compare(&self, a: &AggregateMetric, b: &AggregateMetric) -> Ordering {
        match self {
            SortBy::Correlation => a.correlation_score.total_cmp(&b.correlation_score),
            SortBy::Volume => a.trading_volume_24h.total_cmp(&b.trading_volume_24h),
            SortBy::Views => a.tiktok_views_24h.cmp(&b.tiktok_views_24h),
            SortBy::Mentions => a.total_mentions.cmp(&b.total_mentions),
        }
    }
}

/// Order descending by the chosen field, ties by ascending token id, and
/// keep the first `limit`.
pub fn rank(mut metrics: Vec<AggregateMetric>, sort: SortBy, limit: usize) -> Vec<AggregateMetric> {
    metrics.sort_by(|a, b| sort.compare(b, a).then_with(|| a.token_id.cmp(&b.token_id)));
    metrics.truncate(limit);
    metrics
}

/// Pearson correlation clamped to [0, 1]; 0 when either series is flat or
/// shorter than two points.
pub fn correlation_score(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return 0.0;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    if r.is_finite() {
        r.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub struct Aggregator {
    db: Arc<Database>,
    config: CorrelationConfig,
}

impl Aggregator {
    pub fn new(db: Arc<Database>, config: CorrelationConfig) -> Self {
        Self { db, config }
    }

    /// Metrics for every token with mentions or volume in the window ending
    /// at the hour containing `now`.
    pub fn compute(&self, now: DateTime<Utc>) -> Result<Vec<AggregateMetric>> {
        let hours = self.config.window_hours.max(1);
        let start = hour_bucket(now) - chrono::Duration::hours(hours - 1);

        let mut metrics = Vec::new();
        for token in self.db.load_tokens()? {
            if let Some(metric) = self.token_metric(&token, start, hours as usize, now)? {
                metrics.push(metric);
            }
        }
        debug!("Computed metrics for {} tokens", metrics.len());
        Ok(metrics)
    }

    fn token_metric(
        &self,
        token: &TokenReference,
        start: DateTime<Utc>,
        hours: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<AggregateMetric>> {
        let bucket_of = |t: DateTime<Utc>| -> Option<usize> {
            let idx = (t - start).num_hours();
            (0..hours as i64).contains(&idx).then_some(idx as usize)
        };

        let mut mention_buckets = vec![0.0; hours];
        let mut total_mentions = 0;
        for (at, count) in self.db.mention_series(token.id, start)? {
            if let Some(i) = bucket_of(at) {
                mention_buckets[i] += count as f64;
                total_mentions += count;
            }
        }

        let mut volume_buckets = vec![0.0; hours];
        let mut prices = Vec::new();
        if !token.uri.is_empty() {
            for sample in self.db.volume_series(&token.uri, start)? {
                if let Some(i) = bucket_of(sample.bucket_start) {
                    volume_buckets[i] += sample.volume_usd;
                    if let Some(p) = sample.price_usd {
                        prices.push(p);
                    }
                }
            }
        }
        let trading_volume: f64 = volume_buckets.iter().sum();

        if total_mentions == 0 && trading_volume == 0.0 {
            return Ok(None);
        }

        Ok(Some(AggregateMetric {
            token_id: token.id,
            uri: token.uri.clone(),
            symbol: token.symbol.clone(),
            name: token.name.clone(),
            trading_volume_24h: trading_volume,
            tiktok_views_24h: self.db.token_view_total(token.id, start)?,
            correlation_score: correlation_score(&mention_buckets, &volume_buckets),
            price_change_24h: price_change(&prices),
            total_mentions,
            last_updated: now,
        }))
    }

    /// Compute and persist one analysis run. Returns the number of tokens scored.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let metrics = self.compute(now)?;
        let run_id = self.db.record_analysis(now, self.config.window_hours, &metrics)?;
        info!("Analysis run {} stored {} token correlations", run_id, metrics.len());
        Ok(metrics.len())
    }

    /// Recompute on a fixed interval forever
    pub async fn run_periodic(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_minutes.max(1) * 60));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(Utc::now()) {
                error!("Aggregation run failed: {}", e);
            }
        }
    }
}

/// Percent change from the first to the last price in the window
fn price_change(prices: &[f64]) -> f64 {
    match (prices.first(), prices.last()) {
        (Some(&first), Some(&last)) if first > 0.0 => (last - first) / first * 100.0,
        _ => 0.0,
    }
}
