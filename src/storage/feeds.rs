use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::schema::Database;
use super::types::{Feed, StoreError};

const FEED_COLUMNS: &str = "id, created_at, updated_at, name, url, user_id, last_fetched_at, \
                            last_error, consecutive_failures, next_eligible_at";

impl Database {
    // ========================================================================
    // Feed Registration
    // ========================================================================

    /// Register a feed, or rename it if the URL is already registered.
    ///
    /// Returns the feed's id (the existing id on conflict).
    pub async fn insert_feed(
        &self,
        name: &str,
        url: &str,
        user_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (id, created_at, updated_at, name, url, user_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                name = excluded.name,
                updated_at = excluded.updated_at
            RETURNING id
        "#,
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(now)
        .bind(name)
        .bind(url)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(id)
    }

    /// Get all feeds in registration order
    pub async fn list_feeds(&self) -> Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY created_at, url"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Get a single feed by id
    pub async fn get_feed(&self, feed_id: Uuid) -> Result<Option<Feed>, StoreError> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Get up to `limit` feeds that are due for polling.
    ///
    /// Feeds never fetched come first, then the least recently fetched.
    /// Feeds in backoff (`next_eligible_at` in the future) are excluded.
    pub async fn list_feeds_to_fetch(&self, limit: usize) -> Result<Vec<Feed>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds
            WHERE next_eligible_at IS NULL OR next_eligible_at <= ?
            ORDER BY last_fetched_at ASC NULLS FIRST, created_at ASC
            LIMIT ?
        "#
        ))
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Claim a feed: set `last_fetched_at` to now.
    ///
    /// The timestamp never moves backwards, so repeated claims are
    /// idempotent with respect to ordering even if the wall clock steps back.
    pub async fn mark_feed_fetched(&self, feed_id: Uuid) -> Result<Feed, StoreError> {
        let now = Utc::now();
        let feed = sqlx::query_as::<_, Feed>(&format!(
            r#"
            UPDATE feeds SET
                last_fetched_at = CASE
                    WHEN last_fetched_at IS NOT NULL AND last_fetched_at > ? THEN last_fetched_at
                    ELSE ?
                END,
                updated_at = ?
            WHERE id = ?
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        feed.ok_or(StoreError::FeedNotFound(feed_id))
    }

    // ========================================================================
    // Failure Tracking
    // ========================================================================

    /// Record a failed poll.
    ///
    /// Increments the consecutive failure count, stores the error message and
    /// keeps the feed out of the polling rotation until `retry_at`.
    /// Returns the new failure count.
    pub async fn record_feed_failure(
        &self,
        feed_id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE feeds SET
                consecutive_failures = consecutive_failures + 1,
                last_error = ?,
                next_eligible_at = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING consecutive_failures
        "#,
        )
        .bind(error)
        .bind(retry_at)
        .bind(Utc::now())
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(failures,)| failures)
            .ok_or(StoreError::FeedNotFound(feed_id))
    }

    /// Reset failure state after a successful poll.
    pub async fn clear_feed_failures(&self, feed_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                consecutive_failures = 0,
                last_error = NULL,
                next_eligible_at = NULL,
                updated_at = ?
            WHERE id = ?
        "#,
        )
        .bind(Utc::now())
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn seed(db: &Database, n: usize) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let id = db
                .insert_feed(
                    &format!("Feed {i}"),
                    &format!("https://feed{i}.example.com/rss"),
                    Uuid::nil(),
                )
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn test_insert_feed_appears_in_list() {
        let db = test_db().await;
        let user = Uuid::new_v4();
        let id = db
            .insert_feed("Example", "https://example.com/rss", user)
            .await
            .unwrap();

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].id, id);
        assert_eq!(feeds[0].name, "Example");
        assert_eq!(feeds[0].user_id, user);
        assert!(feeds[0].last_fetched_at.is_none());
        assert_eq!(feeds[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_insert_duplicate_url_renames() {
        let db = test_db().await;
        let id1 = db
            .insert_feed("Old", "https://example.com/rss", Uuid::nil())
            .await
            .unwrap();
        let id2 = db
            .insert_feed("New", "https://example.com/rss", Uuid::nil())
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].name, "New");
    }

    #[tokio::test]
    async fn test_never_fetched_feeds_come_first() {
        let db = test_db().await;
        let ids = seed(&db, 4).await;

        db.mark_feed_fetched(ids[0]).await.unwrap();
        db.mark_feed_fetched(ids[1]).await.unwrap();

        let batch = db.list_feeds_to_fetch(3).await.unwrap();
        let batch_ids: Vec<Uuid> = batch.iter().map(|f| f.id).collect();
        assert_eq!(batch_ids, vec![ids[2], ids[3], ids[0]]);
    }

    #[tokio::test]
    async fn test_oldest_fetch_selected_first() {
        let db = test_db().await;
        let ids = seed(&db, 3).await;

        db.mark_feed_fetched(ids[2]).await.unwrap();
        db.mark_feed_fetched(ids[0]).await.unwrap();
        db.mark_feed_fetched(ids[1]).await.unwrap();

        let batch = db.list_feeds_to_fetch(2).await.unwrap();
        let batch_ids: Vec<Uuid> = batch.iter().map(|f| f.id).collect();
        assert_eq!(batch_ids, vec![ids[2], ids[0]]);
    }

    #[tokio::test]
    async fn test_list_respects_limit() {
        let db = test_db().await;
        seed(&db, 12).await;
        assert_eq!(db.list_feeds_to_fetch(5).await.unwrap().len(), 5);
        assert_eq!(db.list_feeds_to_fetch(50).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_mark_fetched_is_monotonic() {
        let db = test_db().await;
        let ids = seed(&db, 1).await;

        let first = db.mark_feed_fetched(ids[0]).await.unwrap();
        let second = db.mark_feed_fetched(ids[0]).await.unwrap();

        let t1 = first.last_fetched_at.unwrap();
        let t2 = second.last_fetched_at.unwrap();
        assert!(t2 >= t1);
    }

    #[tokio::test]
    async fn test_mark_fetched_unknown_feed() {
        let db = test_db().await;
        let missing = Uuid::new_v4();
        let err = db.mark_feed_fetched(missing).await.unwrap_err();
        assert!(matches!(err, crate::storage::StoreError::FeedNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_failure_in_backoff_excluded() {
        let db = test_db().await;
        let ids = seed(&db, 2).await;

        let failures = db
            .record_feed_failure(ids[0], "timeout", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(failures, 1);

        let batch = db.list_feeds_to_fetch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, ids[1]);
    }

    #[tokio::test]
    async fn test_failure_with_elapsed_backoff_included() {
        let db = test_db().await;
        let ids = seed(&db, 1).await;

        db.record_feed_failure(ids[0], "timeout", Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let batch = db.list_feeds_to_fetch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_failures_accumulate_and_clear() {
        let db = test_db().await;
        let ids = seed(&db, 1).await;
        let later = Utc::now() + Duration::hours(1);

        db.record_feed_failure(ids[0], "a", later).await.unwrap();
        let count = db.record_feed_failure(ids[0], "b", later).await.unwrap();
        assert_eq!(count, 2);

        db.clear_feed_failures(ids[0]).await.unwrap();

        let feed = db.get_feed(ids[0]).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
        assert!(feed.last_error.is_none());
        assert!(feed.next_eligible_at.is_none());
        assert_eq!(db.list_feeds_to_fetch(10).await.unwrap().len(), 1);
    }
}
