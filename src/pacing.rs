//! Human-like pacing and browser fingerprint policy
//!
//! Every navigation, scroll and item action against a scraped platform is
//! followed by a randomized delay. The ranges are configuration, so tests
//! run with `PacingPolicy::disabled()`.

use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Inclusive range of milliseconds a delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const ZERO: DelayRange = DelayRange::new(0, 0);

    /// Draw a delay uniformly from the range. A reversed range is treated as
    /// its lower bound.
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::rng().random_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    PageLoad,
    Scroll,
    InterItem,
    InterTerm,
    InterChannel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingPolicy {
    pub page_load: DelayRange,
    pub scroll: DelayRange,
    pub inter_item: DelayRange,
    pub inter_term: DelayRange,
    pub inter_channel: DelayRange,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            page_load: DelayRange::new(3000, 7000),
            scroll: DelayRange::new(2000, 5000),
            inter_item: DelayRange::new(4000, 8000),
            inter_term: DelayRange::new(5000, 10000),
            inter_channel: DelayRange::new(2000, 2000),
        }
    }
}

impl PacingPolicy {
    pub fn disabled() -> Self {
        Self {
            page_load: DelayRange::ZERO,
            scroll: DelayRange::ZERO,
            inter_item: DelayRange::ZERO,
            inter_term: DelayRange::ZERO,
            inter_channel: DelayRange::ZERO,
        }
    }

    pub fn range(&self, class: ActionClass) -> DelayRange {
        match class {
            ActionClass::PageLoad => self.page_load,
            ActionClass::Scroll => self.scroll,
            ActionClass::InterItem => self.inter_item,
            ActionClass::InterTerm => self.inter_term,
            ActionClass::InterChannel => self.inter_channel,
        }
    }

    pub async fn pause(&self, class: ActionClass) {
        let delay = self.range(class).sample();
        if delay.is_zero() {
            return;
        }
        debug!(?class, delay_ms = delay.as_millis() as u64, "pacing pause");
        tokio::time::sleep(delay).await;
    }
}

/// Header and user-agent profile presented by the headless browser
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    pub timezone: String,
    pub extra_headers: BTreeMap<String, String>,
}

impl Default for BrowserProfile {
    fn default() -> Self {
        let extra_headers = [
            ("Referer", "https://www.tiktok.com/"),
            ("Sec-Fetch-Dest", "document"),
            ("Sec-Fetch-Mode", "navigate"),
            ("Sec-Fetch-Site", "none"),
            ("Sec-Fetch-User", "?1"),
            ("Upgrade-Insecure-Requests", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36"
                .to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            timezone: "America/New_York".to_string(),
            extra_headers,
        }
    }
}

impl BrowserProfile {
    /// All headers sent with navigations, including Accept-Language
    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.extra_headers.clone();
        headers.insert("Accept-Language".to_string(), self.accept_language.clone());
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_within_range() {
        let range = DelayRange::new(10, 20);
        for _ in 0..100 {
            let d = range.sample().as_millis() as u64;
            assert!((10..=20).contains(&d));
        }
    }

    #[test]
    fn test_degenerate_ranges() {
        assert_eq!(DelayRange::ZERO.sample(), Duration::ZERO);
        assert_eq!(DelayRange::new(50, 10).sample(), Duration::from_millis(50));
    }

    #[test]
    fn test_disabled_policy_is_zero() {
        let policy = PacingPolicy::disabled();
        for class in [
            ActionClass::PageLoad,
            ActionClass::Scroll,
            ActionClass::InterItem,
            ActionClass::InterTerm,
            ActionClass::InterChannel,
        ] {
            assert_eq!(policy.range(class), DelayRange::ZERO);
        }
    }

    #[tokio::test]
    async fn test_disabled_pause_returns_immediately() {
        let start = std::time::Instant::now();
        PacingPolicy::disabled().pause(ActionClass::PageLoad).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_profile_headers_include_language() {
        let headers = BrowserProfile::default().headers();
        assert_eq!(headers.get("Accept-Language").unwrap(), "en-US,en;q=0.9");
        assert!(headers.contains_key("Referer"));
    }
}
