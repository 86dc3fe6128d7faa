//! Page fetcher for infinite-scroll TikTok feeds
//!
//! Pages are rendered by a headless browser behind the `PageDriver` trait.
//! The fetcher loads a feed, harvests new cards, scrolls with human pacing
//! and stops on a target count, an exhausted feed or a bot challenge.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cards::{extract_cards, ContentDraft, SeenUrls};
use crate::error::{Error, Result};
use crate::pacing::{ActionClass, BrowserProfile, PacingPolicy};

/// Text served by TikTok in place of a feed when it wants a captcha solved
const BLOCK_MARKERS: &[&str] = &["Verify to continue", "Please verify you are a human"];

/// Consecutive scrolls without page growth before the feed counts as exhausted
const MAX_STALLED_SCROLLS: u32 = 2;

/// Rendered state of the page after a navigation or scroll
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PageSnapshot {
    pub html: String,
    pub height: u64,
}

/// Headless browser session bound to one page
#[async_trait]
pub trait PageDriver: Send {
    /// Navigate to `url` and wait for `wait_selector` to appear
    async fn load(&mut self, url: &str, wait_selector: &str) -> Result<PageSnapshot>;

    /// Scroll to the bottom of the current page and return the new state
    async fn scroll(&mut self) -> Result<PageSnapshot>;
}

/// A TikTok feed to collect from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedTarget {
    Search(String),
    Hashtag(String),
}

impl FeedTarget {
    pub fn url(&self) -> Result<String> {
        let url = match self {
            FeedTarget::Search(keyword) => {
                Url::parse_with_params("https://www.tiktok.com/search", &[("q", keyword.as_str())])
                    .map_err(|e| Error::configuration(format!("bad search term {}: {}", keyword, e)))?
            }
            FeedTarget::Hashtag(tag) => {
                let mut url = Url::parse("https://www.tiktok.com/tag")
                    .map_err(|e| Error::configuration(e.to_string()))?;
                url.path_segments_mut()
                    .map_err(|_| Error::configuration("tag URL cannot take path segments"))?
                    .push(tag.trim_start_matches('#'));
                url
            }
        };
        Ok(url.to_string())
    }

    /// Container of one video card on this kind of feed
    pub fn card_selector(&self) -> &'static str {
        match self {
            FeedTarget::Search(_) => r#"div[class*="DivItemContainerForSearch"]"#,
            FeedTarget::Hashtag(_) => r#"div[class*="DivItemContainerV2"]"#,
        }
    }

    pub fn label(&self) -> String {
        match self {
            FeedTarget::Search(keyword) => format!("search:{}", keyword),
            FeedTarget::Hashtag(tag) => format!("hashtag:{}", tag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    EndOfFeed,
    Blocked,
    Failed(String),
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub drafts: Vec<ContentDraft>,
    pub stop: StopReason,
}

pub struct PageFetcher {
    pacing: PacingPolicy,
    max_scrolls: u32,
}

impl PageFetcher {
    pub fn new(pacing: PacingPolicy) -> Self {
        Self { pacing, max_scrolls: 100 }
    }

    pub fn with_max_scrolls(mut self, max_scrolls: u32) -> Self {
        self.max_scrolls = max_scrolls;
        self
    }

    /// Collect up to `max_results` drafts not yet in `seen`. Never writes to
    /// storage; partial results survive blocks and driver failures.
    pub async fn collect(
        &self,
        driver: &mut dyn PageDriver,
        target: &FeedTarget,
        max_results: usize,
        seen: &mut SeenUrls,
    ) -> FetchOutcome {
        let mut drafts = Vec::new();

        let url = match target.url() {
            Ok(url) => url,
            Err(e) => return FetchOutcome { drafts, stop: StopReason::Failed(e.to_string()) },
        };
        info!("Collecting {} from {}", target.label(), url);

        let mut snapshot = match driver.load(&url, target.card_selector()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(target = %target.label(), error = %e, "Navigation failed");
                return FetchOutcome { drafts, stop: StopReason::Failed(e.to_string()) };
            }
        };
        self.pacing.pause(ActionClass::PageLoad).await;

        let mut stalled = 0;
        let mut scrolls = 0;

        let stop = loop {
            if let Some(marker) = detect_block(&snapshot.html) {
                let err = Error::Blocked { platform: "tiktok".to_string(), url: url.clone() };
                warn!(marker, "{}", err);
                break StopReason::Blocked;
            }

            let found = match self.harvest(&snapshot.html, target, seen, &mut drafts) {
                Ok(found) => found,
                Err(e) => break StopReason::Failed(e.to_string()),
            };
            debug!(target = %target.label(), found, total = drafts.len(), "Harvested cards");

            if drafts.len() >= max_results {
                break StopReason::TargetReached;
            }
            if stalled >= MAX_STALLED_SCROLLS || scrolls >= self.max_scrolls {
                break StopReason::EndOfFeed;
            }
            if found == 0 {
                // nothing new rendered yet; give the feed extra time
                self.pacing.pause(ActionClass::InterItem).await;
            }

            self.pacing.pause(ActionClass::Scroll).await;
            let next = match driver.scroll().await {
                Ok(next) => next,
                Err(e) => {
                    warn!(target = %target.label(), error = %e, "Scroll failed");
                    break StopReason::Failed(e.to_string());
                }
            };
            scrolls += 1;

            if next.height <= snapshot.height {
                stalled += 1;
            } else {
                stalled = 0;
            }
            snapshot = next;
        };

        drafts.truncate(max_results);
        info!(
            "Finished {}: {} new videos ({:?})",
            target.label(),
            drafts.len(),
            stop
        );
        FetchOutcome { drafts, stop }
    }

    fn harvest(
        &self,
        html: &str,
        target: &FeedTarget,
        seen: &mut SeenUrls,
        drafts: &mut Vec<ContentDraft>,
    ) -> Result<usize> {
        let mut found = 0;
        for card in extract_cards(html, target.card_selector())? {
            match card {
                Ok(draft) => {
                    if seen.insert(&draft.video_url) {
                        drafts.push(draft);
                        found += 1;
                    }
                }
                Err(e) => debug!("Skipping card: {}", e),
            }
        }
        Ok(found)
    }
}

fn detect_block(html: &str) -> Option<&'static str> {
    BLOCK_MARKERS.iter().copied().find(|marker| html.contains(marker))
}

/// Puppeteer function run by Browserless. It replays the navigation plus
/// `scrolls` scrolls, so every call renders the page fresh.
const RENDER_FUNCTION: &str = r#"
export default async function ({ page, context }) {
  await page.setUserAgent(context.userAgent);
  await page.setExtraHTTPHeaders(context.headers);
  await page.emulateTimezone(context.timezone);
  await page.setViewport({ width: 1920, height: 1080 });
  await page.goto(context.url, { waitUntil: "networkidle2", timeout: context.timeoutMs });
  try {
    await page.waitForSelector(context.selector, { timeout: context.timeoutMs });
  } catch (e) {}
  for (let i = 0; i < context.scrolls; i++) {
    await page.evaluate(() => window.scrollTo(0, document.body.scrollHeight));
    await new Promise((r) => setTimeout(r, context.settleMs));
  }
  const html = await page.content();
  const height = await page.evaluate(() => document.body.scrollHeight);
  return { data: { html, height }, type: "application/json" };
}
"#;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderContext<'a> {
    url: &'a str,
    selector: &'a str,
    scrolls: u32,
    settle_ms: u64,
    timeout_ms: u64,
    user_agent: &'a str,
    timezone: &'a str,
    headers: std::collections::BTreeMap<String, String>,
}

/// `{base}/function`, with the API token as an encoded query param
fn function_endpoint(base_url: &str, token: Option<&str>) -> Result<Url> {
    let mut endpoint = Url::parse(&format!("{}/function", base_url.trim_end_matches('/')))
        .map_err(|e| Error::configuration(format!("invalid Browserless URL {}: {}", base_url, e)))?;
    if let Some(token) = token {
        endpoint.query_pairs_mut().append_pair("token", token);
    }
    Ok(endpoint)
}

/// `PageDriver` backed by a Browserless (headless Chrome as a service) instance
pub struct BrowserlessDriver {
    client: Client,
    endpoint: Url,
    profile: BrowserProfile,
    navigation_timeout: Duration,
    current: Option<(String, String)>,
    scrolls: u32,
}

impl BrowserlessDriver {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        profile: BrowserProfile,
        navigation_timeout: Duration,
    ) -> Result<Self> {
        // every scroll replays the previous ones, so allow well past one navigation
        let client = Client::builder()
            .timeout(navigation_timeout * 4)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: function_endpoint(base_url, token)?,
            profile,
            navigation_timeout,
            current: None,
            scrolls: 0,
        })
    }

    async fn render(&self, url: &str, selector: &str, scrolls: u32) -> Result<PageSnapshot> {
        let context = RenderContext {
            url,
            selector,
            scrolls,
            settle_ms: 1500,
            timeout_ms: self.navigation_timeout.as_millis() as u64,
            user_agent: &self.profile.user_agent,
            timezone: &self.profile.timezone,
            headers: self.profile.headers(),
        };
        let body = serde_json::json!({ "code": RENDER_FUNCTION, "context": context });

        let resp = self.client.post(self.endpoint.clone()).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Browser { status: status.as_u16(), message });
        }

        let text = resp.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl PageDriver for BrowserlessDriver {
    async fn load(&mut self, url: &str, wait_selector: &str) -> Result<PageSnapshot> {
        self.current = Some((url.to_string(), wait_selector.to_string()));
        self.scrolls = 0;
        self.render(url, wait_selector, 0).await
    }

    async fn scroll(&mut self) -> Result<PageSnapshot> {
        let (url, selector) = self
            .current
            .clone()
            .ok_or_else(|| Error::Browser { status: 0, message: "scroll before load".to_string() })?;
        self.scrolls += 1;
        self.render(&url, &selector, self.scrolls).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serves a fixed sequence of pages; the last one repeats on further scrolls
    pub(crate) struct ScriptedDriver {
        pages: Vec<PageSnapshot>,
        position: usize,
        pub loads: Vec<String>,
        fail_scroll: bool,
    }

    impl ScriptedDriver {
        pub(crate) fn new(pages: Vec<PageSnapshot>) -> Self {
            Self { pages, position: 0, loads: Vec::new(), fail_scroll: false }
        }
    }

    #[async_trait]
    impl PageDriver for ScriptedDriver {
        async fn load(&mut self, url: &str, _wait_selector: &str) -> Result<PageSnapshot> {
            self.loads.push(url.to_string());
            self.position = 0;
            Ok(self.pages[0].clone())
        }

        async fn scroll(&mut self) -> Result<PageSnapshot> {
            if self.fail_scroll {
                return Err(Error::Browser { status: 500, message: "tab crashed".into() });
            }
            self.position = (self.position + 1).min(self.pages.len() - 1);
            Ok(self.pages[self.position].clone())
        }
    }

    pub(crate) fn search_page(ids: &[u64], height: u64) -> PageSnapshot {
        let cards: String = ids
            .iter()
            .map(|id| {
                format!(
                    r#"<div class="DivItemContainerForSearch">
                         <a href="/@moonboy/video/{}"></a>
                         <strong data-e2e="video-views">1.2M</strong>
                       </div>"#,
                    id
                )
            })
            .collect();
        PageSnapshot { html: format!("<html><body>{}</body></html>", cards), height }
    }

    fn fetcher() -> PageFetcher {
        PageFetcher::new(PacingPolicy::disabled())
    }

    #[test]
    fn test_target_urls() {
        assert_eq!(
            FeedTarget::Search("solana memes".into()).url().unwrap(),
            "https://www.tiktok.com/search?q=solana+memes"
        );
        assert_eq!(
            FeedTarget::Hashtag("#bonk".into()).url().unwrap(),
            "https://www.tiktok.com/tag/bonk"
        );
    }

    #[tokio::test]
    async fn test_stops_at_target_count() {
        let mut driver = ScriptedDriver::new(vec![search_page(&[1, 2, 3], 1000), search_page(&[1, 2, 3, 4, 5], 2000)]);
        let mut seen = SeenUrls::new();
        let outcome = fetcher()
            .collect(&mut driver, &FeedTarget::Search("bonk".into()), 4, &mut seen)
            .await;

        assert_eq!(outcome.stop, StopReason::TargetReached);
        assert_eq!(outcome.drafts.len(), 4);
    }

    #[tokio::test]
    async fn test_end_of_feed_after_two_stalled_scrolls() {
        let mut driver = ScriptedDriver::new(vec![search_page(&[1, 2], 1000)]);
        let mut seen = SeenUrls::new();
        let outcome = fetcher()
            .collect(&mut driver, &FeedTarget::Search("bonk".into()), 50, &mut seen)
            .await;

        assert_eq!(outcome.stop, StopReason::EndOfFeed);
        assert_eq!(outcome.drafts.len(), 2);
    }

    #[tokio::test]
    async fn test_seen_urls_shared_across_targets() {
        let mut driver = ScriptedDriver::new(vec![search_page(&[1, 2], 1000)]);
        let mut seen = SeenUrls::new();
        let f = fetcher();
        let first = f.collect(&mut driver, &FeedTarget::Search("a".into()), 10, &mut seen).await;
        let second = f.collect(&mut driver, &FeedTarget::Search("b".into()), 10, &mut seen).await;

        assert_eq!(first.drafts.len(), 2);
        assert!(second.drafts.is_empty());
        assert_eq!(driver.loads.len(), 2);
    }

    #[tokio::test]
    async fn test_block_keeps_partial_results() {
        let mut blocked = search_page(&[9], 3000);
        blocked.html.push_str("<div>Please verify you are a human</div>");
        let mut driver = ScriptedDriver::new(vec![search_page(&[7, 8], 1000), blocked]);
        let mut seen = SeenUrls::new();
        let outcome = fetcher()
            .collect(&mut driver, &FeedTarget::Search("bonk".into()), 10, &mut seen)
            .await;

        assert_eq!(outcome.stop, StopReason::Blocked);
        assert_eq!(outcome.drafts.len(), 2);
    }

    #[tokio::test]
    async fn test_scroll_failure_returns_partial() {
        let mut driver = ScriptedDriver::new(vec![search_page(&[1], 1000)]);
        driver.fail_scroll = true;
        let mut seen = SeenUrls::new();
        let outcome = fetcher()
            .collect(&mut driver, &FeedTarget::Search("x".into()), 10, &mut seen)
            .await;

        assert!(matches!(outcome.stop, StopReason::Failed(_)));
        assert_eq!(outcome.drafts.len(), 1);
    }

    #[test]
    fn test_function_endpoint_encodes_token() {
        let endpoint = function_endpoint("http://browserless:3000/", Some("a+b&c=d")).unwrap();
        assert_eq!(endpoint.as_str(), "http://browserless:3000/function?token=a%2Bb%26c%3Dd");
        assert_eq!(endpoint.query_pairs().next().unwrap().1, "a+b&c=d");

        let bare = function_endpoint("http://localhost:3000", None).unwrap();
        assert_eq!(bare.as_str(), "http://localhost:3000/function");

        assert!(function_endpoint("not a url", None).unwrap_err().is_fatal());
    }

    #[test]
    fn test_snapshot_deserializes_from_function_response() {
        let snap: PageSnapshot = serde_json::from_str(r#"{"html":"<p></p>","height":4200}"#).unwrap();
        assert_eq!(snap.height, 4200);
    }
}
