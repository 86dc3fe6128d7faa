//! TikTok comment fetching
//!
//! Comments are read from the public comment list endpoint that the web
//! player itself calls, paged by cursor.

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pacing::BrowserProfile;

const COMMENT_API: &str = "https://www.tiktok.com/api/comment/list/";
const PAGE_SIZE: u32 = 50;

/// Comment texts of one content item plus the platform's total comment count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentBundle {
    pub total: i64,
    pub texts: Vec<String>,
}

#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn fetch_comments(&self, content_id: &str) -> Result<CommentBundle>;
}

#[derive(Debug, Deserialize)]
struct CommentListPage {
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    comments: Option<Vec<RawComment>>,
    #[serde(default)]
    cursor: i64,
    #[serde(default)]
    has_more: i64,
    #[serde(default)]
    total: i64,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    #[serde(default)]
    text: String,
}

type DirectLimiter = GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct TikTokCommentClient {
    client: Client,
    rate_limiter: DirectLimiter,
    max_pages: u32,
}

impl TikTokCommentClient {
    pub fn new(profile: &BrowserProfile, requests_per_second: u32, max_pages: u32) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in profile.headers() {
            let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(&value)) else {
                warn!("Skipping invalid header {}", name);
                continue;
            };
            headers.insert(name, value);
        }
        headers.insert(REFERER, HeaderValue::from_static("https://www.tiktok.com/"));

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .user_agent(profile.user_agent.as_str())
            .default_headers(headers)
            .build()?;

        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            rate_limiter: GovRateLimiter::direct(quota),
            max_pages: max_pages.max(1),
        })
    }

    async fn fetch_page(&self, content_id: &str, cursor: i64) -> Result<CommentListPage> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .get(COMMENT_API)
            .query(&[
                ("aweme_id", content_id.to_string()),
                ("count", PAGE_SIZE.to_string()),
                ("cursor", cursor.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status: status.as_u16(), message });
        }

        parse_comment_page(&response.text().await?)
    }
}

#[async_trait]
impl CommentSource for TikTokCommentClient {
    async fn fetch_comments(&self, content_id: &str) -> Result<CommentBundle> {
        let mut bundle = CommentBundle::default();
        let mut cursor = 0;

        for page_no in 0..self.max_pages {
            let page = self.fetch_page(content_id, cursor).await?;
            bundle.total = bundle.total.max(page.total);

            let comments = page.comments.unwrap_or_default();
            bundle.texts.extend(
                comments
                    .into_iter()
                    .map(|c| c.text)
                    .filter(|t| !t.trim().is_empty()),
            );

            debug!(content_id, page = page_no, fetched = bundle.texts.len(), "Fetched comment page");

            if page.has_more == 0 || page.cursor <= cursor {
                break;
            }
            cursor = page.cursor;
        }

        bundle.total = bundle.total.max(bundle.texts.len() as i64);
        Ok(bundle)
    }
}

/// Decode one comment list response. An empty body or a non-zero status
/// code means TikTok refused the request.
fn parse_comment_page(body: &str) -> Result<CommentListPage> {
    if body.trim().is_empty() {
        return Err(Error::extraction("empty comment response"));
    }
    let page: CommentListPage = serde_json::from_str(body)
        .map_err(|e| Error::extraction(format!("malformed comment response: {}", e)))?;
    if page.status_code != 0 {
        return Err(Error::extraction(format!(
            "comment API returned status_code {}",
            page.status_code
        )));
    }
    Ok(page)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Canned comments per content id; unknown ids fail
    #[derive(Default)]
    pub(crate) struct StaticComments {
        pub by_id: HashMap<String, Vec<String>>,
    }

    impl StaticComments {
        pub(crate) fn with(id: &str, texts: &[&str]) -> Self {
            let mut source = Self::default();
            source.by_id.insert(id.to_string(), texts.iter().map(|t| t.to_string()).collect());
            source
        }
    }

    #[async_trait]
    impl CommentSource for StaticComments {
        async fn fetch_comments(&self, content_id: &str) -> Result<CommentBundle> {
            let texts = self
                .by_id
                .get(content_id)
                .cloned()
                .ok_or_else(|| Error::Api { status: 404, message: content_id.to_string() })?;
            Ok(CommentBundle { total: texts.len() as i64, texts })
        }
    }

    #[test]
    fn test_parse_comment_page() {
        let page = parse_comment_page(
            r#"{"status_code":0,"comments":[{"text":"$BONK!","cid":"1"},{"text":""}],
                "cursor":50,"has_more":1,"total":120}"#,
        )
        .unwrap();
        assert_eq!(page.comments.as_ref().unwrap().len(), 2);
        assert_eq!(page.cursor, 50);
        assert_eq!(page.has_more, 1);
        assert_eq!(page.total, 120);
    }

    #[test]
    fn test_null_comments_list() {
        let page = parse_comment_page(r#"{"status_code":0,"comments":null,"has_more":0}"#).unwrap();
        assert!(page.comments.is_none());
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        assert!(matches!(parse_comment_page(""), Err(Error::Extraction(_))));
        assert!(matches!(parse_comment_page("<html>captcha</html>"), Err(Error::Extraction(_))));
        assert!(matches!(
            parse_comment_page(r#"{"status_code":10201}"#),
            Err(Error::Extraction(_))
        ));
    }
}
