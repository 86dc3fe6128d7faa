//! TikTok scrape run - search and hashtag feeds to stored mentions
//!
//! One run walks every configured search term and then every hashtag,
//! collecting video cards, fetching each video's comments and storing the
//! video with the token mentions found in them. Videos are deduplicated
//! across the whole run, and a failure on one video never stops the run.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::cards::{ContentDraft, SeenUrls};
use crate::comments::{CommentBundle, CommentSource};
use crate::config::ScraperConfig;
use crate::db::{ContentItem, Database, Platform};
use crate::error::{Error, Result};
use crate::extractor::MentionParser;
use crate::fetcher::{FeedTarget, PageDriver, PageFetcher, StopReason};
use crate::pacing::{ActionClass, PacingPolicy};
use crate::resolver::SymbolResolver;

pub struct TikTokScraper<C> {
    config: ScraperConfig,
    pacing: PacingPolicy,
    fetcher: PageFetcher,
    parser: MentionParser,
    comments: C,
}

impl<C: CommentSource> TikTokScraper<C> {
    pub fn new(config: ScraperConfig, pacing: PacingPolicy, parser: MentionParser, comments: C) -> Self {
        Self {
            fetcher: PageFetcher::new(pacing.clone()),
            config,
            pacing,
            parser,
            comments,
        }
    }

    /// Every feed of one run, searches first
    pub fn targets(&self) -> Vec<(FeedTarget, usize)> {
        let searches = self
            .config
            .search_terms
            .iter()
            .map(|t| (FeedTarget::Search(t.clone()), self.config.max_results_per_search));
        let hashtags = self
            .config
            .hashtag_terms
            .iter()
            .map(|t| (FeedTarget::Hashtag(t.clone()), self.config.max_results_per_hashtag));
        searches.chain(hashtags).collect()
    }

    /// Run one full scrape over all configured feeds
    pub async fn run(&self, driver: &mut dyn PageDriver, db: &Database) -> Result<ScrapeStats> {
        let tokens = db.load_tokens()?;
        let resolver = SymbolResolver::from_tokens(&tokens);
        info!("Loaded {} tokens ({} symbols)", tokens.len(), resolver.symbol_count());

        let mut stats = ScrapeStats::default();
        let mut seen = SeenUrls::new();

        for (i, (target, max_results)) in self.targets().into_iter().enumerate() {
            if i > 0 {
                self.pacing.pause(ActionClass::InterTerm).await;
            }

            let outcome = self.fetcher.collect(driver, &target, max_results, &mut seen).await;
            match outcome.stop {
                StopReason::Blocked => stats.blocked_targets += 1,
                StopReason::Failed(_) => stats.failed_targets += 1,
                StopReason::TargetReached | StopReason::EndOfFeed => {}
            }

            for draft in &outcome.drafts {
                stats.videos_seen += 1;
                self.process_draft(db, &resolver, draft, &mut stats).await;
            }
        }

        info!(
            "Scrape run complete: {} videos seen, {} stored, {} skipped, {} storage errors, \
             {} mentions, {} blocked / {} failed targets",
            stats.videos_seen,
            stats.stored,
            stats.skipped,
            stats.storage_errors,
            stats.mentions_inserted,
            stats.blocked_targets,
            stats.failed_targets
        );

        Ok(stats)
    }

    async fn process_draft(
        &self,
        db: &Database,
        resolver: &SymbolResolver,
        draft: &ContentDraft,
        stats: &mut ScrapeStats,
    ) {
        let Some(content_id) = draft.content_id() else {
            debug!("No content id in {}", draft.video_url);
            stats.skipped += 1;
            return;
        };

        // without comments the video is still stored, and the monitor picks it up later
        let bundle = match self.comments.fetch_comments(&content_id).await {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(content_id = %content_id, error = %e, "Comment fetch failed");
                None
            }
        };

        match self.ingest_video(db, resolver, draft, bundle.as_ref(), Utc::now()) {
            Ok(inserted) => {
                stats.stored += 1;
                stats.mentions_inserted += inserted;
            }
            Err(Error::Extraction(msg)) => {
                debug!("Skipping {}: {}", draft.video_url, msg);
                stats.skipped += 1;
            }
            Err(e) => {
                error!(content_id = %content_id, error = %e, "Failed to store video");
                stats.storage_errors += 1;
            }
        }
    }

    /// Store one video and the mentions in its comments. Returns the number
    /// of mention rows inserted; a storage failure aborts only this video.
    pub fn ingest_video(
        &self,
        db: &Database,
        resolver: &SymbolResolver,
        draft: &ContentDraft,
        comments: Option<&CommentBundle>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let item = content_item(draft, comments, now)?;
        db.upsert_content(&item)?;

        let Some(bundle) = comments else {
            return Ok(0);
        };

        let counts = self.parser.parse_all(bundle.texts.iter().map(String::as_str));
        let mentions = resolver.resolve(&item.id, &counts, now);
        let outcome = db.insert_mentions_if_absent(&item.id, &mentions)?;

        debug!(content_id = %item.id, symbols = counts.len(), ?outcome, "Ingested video");
        Ok(outcome.inserted())
    }
}

/// Normalize a draft into a storable item. Videos whose comments were read
/// count as mention-checked at `now`.
fn content_item(draft: &ContentDraft, comments: Option<&CommentBundle>, now: DateTime<Utc>) -> Result<ContentItem> {
    let id = draft
        .content_id()
        .ok_or_else(|| Error::extraction(format!("no video id in {}", draft.video_url)))?;

    let posted_at = draft
        .posted_timestamp
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or(now);

    Ok(ContentItem {
        id,
        platform: Platform::TikTok,
        author: draft.author.clone().unwrap_or_default(),
        url: draft.video_url.clone(),
        thumbnail_url: draft.thumbnail_url.clone(),
        posted_at,
        fetched_at: now,
        view_count: draft.view_count(),
        comment_count: comments.map(|c| c.total).unwrap_or(0),
        last_mention_check_at: comments.map(|_| now),
    })
}

/// Statistics from a scrape run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScrapeStats {
    pub videos_seen: usize,
    pub stored: usize,
    pub skipped: usize,
    pub storage_errors: usize,
    pub mentions_inserted: usize,
    pub blocked_targets: usize,
    pub failed_targets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::tests::StaticComments;
    use crate::db::tests::test_db;
    use crate::fetcher::tests::{search_page, ScriptedDriver};

    fn scraper(comments: StaticComments) -> TikTokScraper<StaticComments> {
        let config = ScraperConfig {
            search_terms: vec!["bonk".into()],
            hashtag_terms: vec![],
            ..ScraperConfig::default()
        };
        TikTokScraper::new(config, PacingPolicy::disabled(), MentionParser::cashtags(), comments)
    }

    fn draft(id: &str) -> ContentDraft {
        ContentDraft {
            video_url: format!("https://www.tiktok.com/@moonboy/video/{}", id),
            author: Some("moonboy".into()),
            views_raw: Some("1.2m".into()),
            thumbnail_url: None,
            posted_timestamp: None,
        }
    }

    #[test]
    fn test_ingest_video_end_to_end() {
        let db = test_db();
        let bonk = db.insert_token("BONK", "Bonk", "uri:bonk").unwrap();
        let resolver = SymbolResolver::from_tokens(&db.load_tokens().unwrap());
        let s = scraper(StaticComments::default());
        let bundle = CommentBundle {
            total: 2,
            texts: vec!["$BONK to the moon".into(), "buying more $BONK".into()],
        };
        let now = Utc::now();

        let inserted = s.ingest_video(&db, &resolver, &draft("12345"), Some(&bundle), now).unwrap();
        assert_eq!(inserted, 1);

        let mentions = db.mentions_for_content("12345").unwrap();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].token_id, bonk);
        assert_eq!(mentions[0].count, 2);

        let item = db.get_content("12345").unwrap().unwrap();
        assert_eq!(item.view_count, 1_200_000);
        assert_eq!(item.comment_count, 2);
        assert!(item.last_mention_check_at.is_some());
    }

    #[test]
    fn test_reingest_keeps_single_batch() {
        let db = test_db();
        db.insert_token("BONK", "Bonk", "uri:bonk").unwrap();
        let resolver = SymbolResolver::from_tokens(&db.load_tokens().unwrap());
        let s = scraper(StaticComments::default());
        let bundle = CommentBundle { total: 1, texts: vec!["$BONK".into()] };

        s.ingest_video(&db, &resolver, &draft("1"), Some(&bundle), Utc::now()).unwrap();
        let again = s.ingest_video(&db, &resolver, &draft("1"), Some(&bundle), Utc::now()).unwrap();

        assert_eq!(again, 0);
        assert_eq!(db.count_mentions("1").unwrap(), 1);
        assert_eq!(db.count_content(None).unwrap(), 1);
    }

    #[test]
    fn test_video_without_comments_left_for_monitor() {
        let db = test_db();
        let s = scraper(StaticComments::default());
        s.ingest_video(&db, &SymbolResolver::default(), &draft("77"), None, Utc::now())
            .unwrap();
        let item = db.get_content("77").unwrap().unwrap();
        assert_eq!(item.last_mention_check_at, None);
    }

    #[tokio::test]
    async fn test_run_collects_and_stores() {
        let db = test_db();
        db.insert_token("WIF", "dogwifhat", "uri:wif").unwrap();
        let s = scraper(StaticComments::with("2", &["$wif is back", "$WIF"]));
        let mut driver = ScriptedDriver::new(vec![search_page(&[1, 2], 1000)]);

        let stats = s.run(&mut driver, &db).await.unwrap();

        assert_eq!(stats.videos_seen, 2);
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.mentions_inserted, 1);
        assert_eq!(db.count_mentions("2").unwrap(), 1);
        // comment fetch failed for video 1; it is stored but unchecked
        assert_eq!(db.get_content("1").unwrap().unwrap().last_mention_check_at, None);
    }

    #[test]
    fn test_targets_order() {
        let config = ScraperConfig {
            search_terms: vec!["a".into()],
            hashtag_terms: vec!["b".into()],
            ..ScraperConfig::default()
        };
        let s = TikTokScraper::new(config, PacingPolicy::disabled(), MentionParser::cashtags(), StaticComments::default());
        let targets = s.targets();
        assert_eq!(targets[0], (FeedTarget::Search("a".into()), 100));
        assert_eq!(targets[1], (FeedTarget::Hashtag("b".into()), 200));
    }
}
