//! Content card extraction from rendered TikTok feed pages

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

use crate::error::{Error, Result};

static VIDEO_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/video/(\d+)").expect("valid video id regex"));

static AUTHOR_IN_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/@([^/?#]+)/video/").expect("valid author regex"));

static VIDEO_LINK: Lazy<Selector> = Lazy::new(|| selector(r#"a[href*="/video/"]"#));
static AUTHOR: Lazy<Selector> = Lazy::new(|| {
    selector(r#"[data-e2e="search-card-user-unique-id"], [data-e2e="video-author-uniqueid"]"#)
});
static VIEWS: Lazy<Selector> = Lazy::new(|| selector(r#"[data-e2e="video-views"]"#));
static THUMBNAIL: Lazy<Selector> = Lazy::new(|| selector("img[src]"));

const TIKTOK_ORIGIN: &str = "https://www.tiktok.com";

fn selector(s: &str) -> Selector {
    Selector::parse(s).expect("static selector must parse")
}

/// Fields pulled from one feed card before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDraft {
    pub video_url: String,
    pub author: Option<String>,
    pub views_raw: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Unix seconds
    pub posted_timestamp: Option<i64>,
}

impl ContentDraft {
    pub fn content_id(&self) -> Option<String> {
        content_id_from_url(&self.video_url)
    }

    pub fn view_count(&self) -> i64 {
        self.views_raw.as_deref().map(parse_views).unwrap_or(0)
    }
}

/// Extract every card matching `card_selector` from a rendered page.
/// Cards missing required fields come back as `Err` so the caller can log
/// and skip them.
pub fn extract_cards(html: &str, card_selector: &str) -> Result<Vec<Result<ContentDraft>>> {
    let cards = Selector::parse(card_selector)
        .map_err(|e| Error::extraction(format!("invalid card selector {}: {:?}", card_selector, e)))?;
    let document = Html::parse_document(html);
    Ok(document.select(&cards).map(extract_card).collect())
}

/// Convert one card element into a draft. The video URL is the only
/// required field.
pub fn extract_card(card: ElementRef<'_>) -> Result<ContentDraft> {
    let href = card
        .select(&VIDEO_LINK)
        .filter_map(|a| a.value().attr("href"))
        .next()
        .ok_or_else(|| Error::extraction("card has no video link"))?;

    let video_url = absolutize(href);
    let video_id = content_id_from_url(&video_url)
        .ok_or_else(|| Error::extraction(format!("no video id in {}", video_url)))?;

    let author = card
        .select(&AUTHOR)
        .map(collapse_text)
        .find(|t| !t.is_empty())
        .or_else(|| {
            AUTHOR_IN_URL_PATTERN
                .captures(&video_url)
                .map(|cap| cap[1].to_string())
        });

    let views_raw = card
        .select(&VIEWS)
        .map(collapse_text)
        .find(|t| !t.is_empty());

    let thumbnail_url = card
        .select(&THUMBNAIL)
        .filter_map(|img| img.value().attr("src"))
        .find(|src| !src.starts_with("data:"))
        .map(|src| src.to_string());

    Ok(ContentDraft {
        video_url,
        author,
        views_raw,
        thumbnail_url,
        posted_timestamp: timestamp_from_video_id(&video_id),
    })
}

fn collapse_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn absolutize(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}{}", TIKTOK_ORIGIN, href)
    }
}

/// Stable platform id from a `/video/<digits>` URL
pub fn content_id_from_url(url: &str) -> Option<String> {
    VIDEO_ID_PATTERN.captures(url).map(|cap| cap[1].to_string())
}

/// TikTok ids carry their creation time (unix seconds) in the upper 32 bits
pub fn timestamp_from_video_id(id: &str) -> Option<i64> {
    let raw: u64 = id.parse().ok()?;
    let ts = (raw >> 32) as i64;
    (ts > 0).then_some(ts)
}

/// Expand compact counts such as "12.3k" or "4.1M" into integers.
///
/// The trailing unit letter selects a multiplier (k, m, b); without a unit
/// the whole string is parsed. Anything unparseable is 0.
pub fn parse_views(raw: &str) -> i64 {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    let Some(last) = cleaned.chars().last() else {
        return 0;
    };

    let multiplier = match last.to_ascii_lowercase() {
        'k' => Some(1_000.0),
        'm' => Some(1_000_000.0),
        'b' => Some(1_000_000_000.0),
        _ => None,
    };

    let value = match multiplier {
        Some(mult) => cleaned[..cleaned.len() - 1]
            .trim()
            .parse::<f64>()
            .map(|n| n * mult),
        None => cleaned.parse::<f64>(),
    };

    match value {
        // absorb representation error such as 4.1 * 1e6 = 4099999.9999999995
        Ok(v) if v.is_finite() && v > 0.0 => (v + 1e-6).floor() as i64,
        _ => 0,
    }
}

/// URLs already collected during one scrape invocation
#[derive(Debug, Default)]
pub struct SeenUrls {
    urls: HashSet<String>,
}

impl SeenUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a URL is seen
    pub fn insert(&mut self, url: &str) -> bool {
        self.urls.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}
