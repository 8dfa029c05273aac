use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::schema::Database;
use super::types::{Feed, NewPost, Post, StoreError};

/// The persistence operations the poller depends on.
///
/// [`Database`] is the production implementation. Implementations must be
/// safe to share between concurrently running feed workers and must
/// serialize conflicting writes themselves.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Up to `limit` eligible feeds, never-fetched first, then stalest first.
    async fn list_feeds_to_fetch(&self, limit: usize) -> Result<Vec<Feed>, StoreError>;

    /// Set the feed's last-fetched timestamp to now.
    async fn mark_feed_fetched(&self, feed_id: Uuid) -> Result<Feed, StoreError>;

    /// Insert a post; [`StoreError::Duplicate`] if its URL is already stored for the feed.
    async fn create_post(&self, post: &NewPost) -> Result<Post, StoreError>;

    /// Record a failed poll and defer the feed until `retry_at`. Returns the failure count.
    async fn record_feed_failure(
        &self,
        feed_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Reset failure state after a successful poll.
    async fn clear_feed_failures(&self, feed_id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
impl FeedStore for Database {
    async fn list_feeds_to_fetch(&self, limit: usize) -> Result<Vec<Feed>, StoreError> {
        Database::list_feeds_to_fetch(self, limit).await
    }

    async fn mark_feed_fetched(&self, feed_id: Uuid) -> Result<Feed, StoreError> {
        Database::mark_feed_fetched(self, feed_id).await
    }

    async fn create_post(&self, post: &NewPost) -> Result<Post, StoreError> {
        Database::create_post(self, post).await
    }

    async fn record_feed_failure(
        &self,
        feed_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Database::record_feed_failure(self, feed_id, error, retry_at).await
    }

    async fn clear_feed_failures(&self, feed_id: Uuid) -> Result<(), StoreError> {
        Database::clear_feed_failures(self, feed_id).await
    }
}
