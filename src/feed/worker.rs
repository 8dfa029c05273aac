use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::dates::parse_pub_date;
use super::fetcher::{FeedFetcher, FetchError};
use super::parser::FeedItem;
use crate::storage::{Feed, FeedStore, NewPost, StoreError};
use crate::util::{validate_url, HostPolicy, UrlValidationError};

/// Why a single feed could not be processed.
///
/// None of these stop the scheduler; they only end work on one feed.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Invalid feed URL: {0}")]
    Validation(#[from] UrlValidationError),
    #[error("Failed to mark feed as fetched: {0}")]
    Claim(#[source] StoreError),
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
}

/// Exponential backoff for failing feeds.
///
/// The n-th consecutive failure defers the feed by `base * 2^(n-1)`,
/// never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after `failures` consecutive failures (including the current one).
    pub fn delay(&self, failures: i64) -> Duration {
        let exponent = u32::try_from(failures.saturating_sub(1).max(0)).unwrap_or(u32::MAX);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// When a feed with `failures` consecutive failures becomes eligible again.
    pub fn retry_at(&self, failures: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(failures))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now)
    }
}

/// Per-poll policy shared by every worker in a tick.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeOptions {
    pub host_policy: HostPolicy,
    pub backoff: Backoff,
}

/// Item counts for one successful poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeSummary {
    /// Items present in the document
    pub items: usize,
    /// New posts stored
    pub inserted: usize,
    /// Items whose URL was already stored for this feed
    pub duplicates: usize,
    /// Items dropped for an unreadable date or a store error
    pub skipped: usize,
}

/// Outcome of one worker run.
#[derive(Debug)]
pub struct ScrapeResult {
    pub feed_id: Uuid,
    pub result: Result<ScrapeSummary, ScrapeError>,
}

/// Poll one feed and store its new items as posts.
///
/// The feed is claimed (marked fetched) before any network traffic, so a
/// slow or failing feed moves to the back of the rotation either way.
/// Validation and fetch failures are recorded on the feed and push its
/// next poll out according to `options.backoff`; a successful fetch clears
/// any earlier failures.
///
/// Never panics and never returns early on a single bad item: items with
/// an unreadable date or rejected by the store are counted in
/// [`ScrapeSummary::skipped`]. Items without a link are stored under an
/// empty URL, so later ones in the same feed count as duplicates.
pub async fn scrape_feed(
    store: &dyn FeedStore,
    fetcher: &FeedFetcher,
    options: &ScrapeOptions,
    feed: &Feed,
) -> ScrapeResult {
    ScrapeResult {
        feed_id: feed.id,
        result: scrape(store, fetcher, options, feed).await,
    }
}

async fn scrape(
    store: &dyn FeedStore,
    fetcher: &FeedFetcher,
    options: &ScrapeOptions,
    feed: &Feed,
) -> Result<ScrapeSummary, ScrapeError> {
    let url = match validate_url(&feed.url, options.host_policy) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(feed_id = %feed.id, name = %feed.name, url = %feed.url, error = %e, "Invalid feed URL");
            // Claim anyway so the feed does not stay at the head of the queue
            if let Err(claim_err) = store.mark_feed_fetched(feed.id).await {
                tracing::warn!(feed_id = %feed.id, error = %claim_err, "Couldn't mark feed fetched");
            }
            record_failure(store, options, feed, &e.to_string()).await;
            return Err(ScrapeError::Validation(e));
        }
    };

    if let Err(e) = store.mark_feed_fetched(feed.id).await {
        tracing::warn!(feed_id = %feed.id, error = %e, "Couldn't mark feed fetched");
        return Err(ScrapeError::Claim(e));
    }

    let document = match fetcher.fetch(url.as_str()).await {
        Ok(document) => document,
        Err(e) => {
            tracing::warn!(feed_id = %feed.id, name = %feed.name, error = %e, "Couldn't collect feed");
            record_failure(store, options, feed, &e.to_string()).await;
            return Err(ScrapeError::Fetch(e));
        }
    };

    if feed.consecutive_failures > 0 {
        match store.clear_feed_failures(feed.id).await {
            Ok(()) => tracing::info!(
                feed_id = %feed.id,
                name = %feed.name,
                previous_failures = feed.consecutive_failures,
                "Feed recovered"
            ),
            Err(e) => {
                tracing::warn!(feed_id = %feed.id, error = %e, "Failed to clear feed failures")
            }
        }
    }

    let summary = ingest_items(store, feed, &document.items).await;

    tracing::info!(
        feed_id = %feed.id,
        name = %feed.name,
        items = summary.items,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        skipped = summary.skipped,
        "Feed collected"
    );

    Ok(summary)
}

async fn ingest_items(store: &dyn FeedStore, feed: &Feed, items: &[FeedItem]) -> ScrapeSummary {
    let mut summary = ScrapeSummary {
        items: items.len(),
        ..ScrapeSummary::default()
    };

    for item in items {
        let published_at = match parse_pub_date(&item.pub_date) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(feed_id = %feed.id, link = %item.link, error = %e, "Couldn't parse item date");
                summary.skipped += 1;
                continue;
            }
        };

        let post = NewPost::new(
            feed.id,
            item.title.as_str(),
            item.link.as_str(),
            item.description.clone(),
            published_at,
        );

        match store.create_post(&post).await {
            Ok(stored) => {
                summary.inserted += 1;
                tracing::debug!(feed_id = %feed.id, post_id = %stored.id, url = %stored.url, "Found post");
            }
            Err(StoreError::Duplicate) => summary.duplicates += 1,
            Err(e) => {
                tracing::warn!(feed_id = %feed.id, url = %item.link, error = %e, "Couldn't create post");
                summary.skipped += 1;
            }
        }
    }

    summary
}

async fn record_failure(store: &dyn FeedStore, options: &ScrapeOptions, feed: &Feed, error: &str) {
    let failures = feed.consecutive_failures.saturating_add(1);
    let retry_at = options.backoff.retry_at(failures, Utc::now());

    match store.record_feed_failure(feed.id, error, retry_at).await {
        Ok(failures) => tracing::debug!(
            feed_id = %feed.id,
            failures,
            retry_at = %retry_at,
            "Feed deferred after failure"
        ),
        Err(e) => tracing::warn!(feed_id = %feed.id, error = %e, "Failed to record feed failure"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fetcher::{DEFAULT_MAX_BYTES, DEFAULT_TIMEOUT};
    use crate::storage::{Database, Post};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Delegates to a real database and counts claims.
    struct CountingStore {
        db: Database,
        marks: AtomicUsize,
    }

    #[async_trait]
    impl FeedStore for CountingStore {
        async fn list_feeds_to_fetch(&self, limit: usize) -> Result<Vec<Feed>, StoreError> {
            self.db.list_feeds_to_fetch(limit).await
        }

        async fn mark_feed_fetched(&self, feed_id: Uuid) -> Result<Feed, StoreError> {
            self.marks.fetch_add(1, Ordering::SeqCst);
            self.db.mark_feed_fetched(feed_id).await
        }

        async fn create_post(&self, post: &NewPost) -> Result<Post, StoreError> {
            self.db.create_post(post).await
        }

        async fn record_feed_failure(
            &self,
            feed_id: Uuid,
            error: &str,
            retry_at: DateTime<Utc>,
        ) -> Result<i64, StoreError> {
            self.db.record_feed_failure(feed_id, error, retry_at).await
        }

        async fn clear_feed_failures(&self, feed_id: Uuid) -> Result<(), StoreError> {
            self.db.clear_feed_failures(feed_id).await
        }
    }

    fn options() -> ScrapeOptions {
        ScrapeOptions {
            host_policy: HostPolicy::AllowPrivate,
            backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(3600)),
        }
    }

    fn fetcher() -> FeedFetcher {
        FeedFetcher::new(DEFAULT_TIMEOUT, DEFAULT_MAX_BYTES).unwrap()
    }

    async fn setup(url: &str) -> (CountingStore, Feed) {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.insert_feed("Test", url, Uuid::nil()).await.unwrap();
        let feed = db.get_feed(id).await.unwrap().unwrap();
        let store = CountingStore {
            db,
            marks: AtomicUsize::new(0),
        };
        (store, feed)
    }

    async fn serve(body: &str) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(&mock_server)
            .await;
        mock_server
    }

    const TWO_ITEMS: &str = r#"<rss><channel><title>T</title>
        <item><title>A</title><link>https://example.com/a</link>
          <description>first</description>
          <pubDate>Mon, 02 Jan 2006 15:04:05 -0700</pubDate></item>
        <item><title>B</title><link>https://example.com/b</link>
          <pubDate>2006-01-03T10:00:00Z</pubDate></item>
    </channel></rss>"#;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_secs(120));
        assert_eq!(backoff.delay(3), Duration::from_secs(240));
        assert_eq!(backoff.delay(4), Duration::from_secs(300));
        assert_eq!(backoff.delay(1_000), Duration::from_secs(300));
        assert_eq!(backoff.delay(i64::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_zero_failures_uses_base() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_at_offsets_now() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(3600));
        let now = Utc::now();
        assert_eq!(backoff.retry_at(2, now), now + chrono::Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_scrape_inserts_posts() {
        let mock_server = serve(TWO_ITEMS).await;
        let (store, feed) = setup(&format!("{}/feed", mock_server.uri())).await;

        let result = scrape_feed(&store, &fetcher(), &options(), &feed).await;
        assert_eq!(result.feed_id, feed.id);
        assert_eq!(
            result.result.unwrap(),
            ScrapeSummary {
                items: 2,
                inserted: 2,
                duplicates: 0,
                skipped: 0
            }
        );

        let posts = store.db.get_posts_for_feed(feed.id, None).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].url, "https://example.com/b");
        assert_eq!(posts[1].description.as_deref(), Some("first"));
        assert_eq!(posts[1].published_at.to_rfc3339(), "2006-01-02T22:04:05+00:00");

        let feed = store.db.get_feed(feed.id).await.unwrap().unwrap();
        assert!(feed.last_fetched_at.is_some());
        assert_eq!(store.marks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_scrape_counts_duplicates() {
        let mock_server = serve(TWO_ITEMS).await;
        let (store, feed) = setup(&format!("{}/feed", mock_server.uri())).await;

        scrape_feed(&store, &fetcher(), &options(), &feed).await.result.unwrap();
        let second = scrape_feed(&store, &fetcher(), &options(), &feed)
            .await
            .result
            .unwrap();

        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.db.count_posts_for_feed(feed.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_date_skips_only_that_item() {
        let body = r#"<rss><channel>
            <item><title>Bad</title><link>https://example.com/bad</link><pubDate>yesterday</pubDate></item>
            <item><title>Good</title><link>https://example.com/good</link><pubDate>Mon, 02 Jan 2006 15:04:05 GMT</pubDate></item>
        </channel></rss>"#;
        let mock_server = serve(body).await;
        let (store, feed) = setup(&format!("{}/feed", mock_server.uri())).await;

        let summary = scrape_feed(&store, &fetcher(), &options(), &feed)
            .await
            .result
            .unwrap();
        assert_eq!(summary.items, 2);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 1);

        let posts = store.db.get_posts_for_feed(feed.id, None).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Good");
    }

    #[tokio::test]
    async fn test_items_without_link_share_one_post() {
        let body = r#"<rss><channel>
            <item><title>No link</title><pubDate>Mon, 02 Jan 2006 15:04:05 GMT</pubDate></item>
            <item><title>Also no link</title><pubDate>Tue, 03 Jan 2006 15:04:05 GMT</pubDate></item>
        </channel></rss>"#;
        let mock_server = serve(body).await;
        let (store, feed) = setup(&format!("{}/feed", mock_server.uri())).await;

        let summary = scrape_feed(&store, &fetcher(), &options(), &feed)
            .await
            .result
            .unwrap();
        assert_eq!(
            summary,
            ScrapeSummary {
                items: 2,
                inserted: 1,
                duplicates: 1,
                skipped: 0
            }
        );

        let posts = store.db.get_posts_for_feed(feed.id, None).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "No link");
        assert_eq!(posts[0].url, "");
    }

    #[tokio::test]
    async fn test_invalid_url_claimed_once_and_deferred() {
        let (store, feed) = setup("not a url").await;

        let result = scrape_feed(&store, &fetcher(), &options(), &feed).await;
        assert!(matches!(result.result, Err(ScrapeError::Validation(_))));
        assert_eq!(store.marks.load(Ordering::SeqCst), 1);

        let feed = store.db.get_feed(feed.id).await.unwrap().unwrap();
        assert!(feed.last_fetched_at.is_some());
        assert_eq!(feed.consecutive_failures, 1);
        assert!(feed.next_eligible_at.unwrap() > Utc::now());
        assert!(store.db.list_feeds_to_fetch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_url_claimed_once() {
        let (store, feed) = setup("   ").await;

        let result = scrape_feed(&store, &fetcher(), &options(), &feed).await;
        assert!(matches!(
            result.result,
            Err(ScrapeError::Validation(UrlValidationError::Empty))
        ));
        assert_eq!(store.marks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_private_host_rejected_by_default_policy() {
        let mock_server = serve(TWO_ITEMS).await;
        let (store, feed) = setup(&format!("{}/feed", mock_server.uri())).await;
        let options = ScrapeOptions {
            host_policy: HostPolicy::PublicOnly,
            ..options()
        };

        let result = scrape_feed(&store, &fetcher(), &options, &feed).await;
        assert!(matches!(result.result, Err(ScrapeError::Validation(_))));
        assert_eq!(store.db.count_posts_for_feed(feed.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_recorded_then_cleared() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TWO_ITEMS))
            .mount(&mock_server)
            .await;
        let (store, feed) = setup(&format!("{}/feed", mock_server.uri())).await;

        let first = scrape_feed(&store, &fetcher(), &options(), &feed).await;
        assert!(matches!(
            first.result,
            Err(ScrapeError::Fetch(FetchError::HttpStatus(503)))
        ));
        let failed = store.db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(failed.consecutive_failures, 1);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP error: status 503"));

        let second = scrape_feed(&store, &fetcher(), &options(), &failed).await;
        assert_eq!(second.result.unwrap().inserted, 2);
        let recovered = store.db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(recovered.consecutive_failures, 0);
        assert!(recovered.last_error.is_none());
        assert!(recovered.next_eligible_at.is_none());
    }
}
