use anyhow::Result;
use uuid::Uuid;

use super::schema::Database;
use super::types::{NewPost, Post, StoreError};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of posts to return from any single query (OOM protection)
const MAX_POSTS: i64 = 2000;

const POST_COLUMNS: &str =
    "id, created_at, updated_at, title, url, description, published_at, feed_id";

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Insert a post.
    ///
    /// Fails with [`StoreError::Duplicate`] if the feed already has a post
    /// with the same URL; the stored post is left untouched.
    pub async fn create_post(&self, post: &NewPost) -> Result<Post, StoreError> {
        sqlx::query_as::<_, Post>(&format!(
            r#"
            INSERT INTO posts (id, created_at, updated_at, title, url, description, published_at, feed_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {POST_COLUMNS}
        "#
        ))
        .bind(post.id)
        .bind(post.created_at)
        .bind(post.updated_at)
        .bind(&post.title)
        .bind(&post.url)
        .bind(&post.description)
        .bind(post.published_at)
        .bind(post.feed_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)
    }

    // ========================================================================
    // Post Queries
    // ========================================================================

    /// Get posts for a feed, newest first
    /// Hard cap at MAX_POSTS (2000) to prevent OOM
    pub async fn get_posts_for_feed(&self, feed_id: Uuid, limit: Option<i64>) -> Result<Vec<Post>> {
        let limit = limit.unwrap_or(100).clamp(0, MAX_POSTS);
        let posts = sqlx::query_as::<_, Post>(&format!(
            r#"
            SELECT {POST_COLUMNS}
            FROM posts
            WHERE feed_id = ?
            ORDER BY published_at DESC, created_at DESC
            LIMIT ?
        "#
        ))
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Get the most recently published posts across all feeds
    pub async fn get_recent_posts(&self, limit: Option<i64>) -> Result<Vec<Post>> {
        let limit = limit.unwrap_or(100).clamp(0, MAX_POSTS);
        let posts = sqlx::query_as::<_, Post>(&format!(
            r#"
            SELECT {POST_COLUMNS}
            FROM posts
            ORDER BY published_at DESC, created_at DESC
            LIMIT ?
        "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Count stored posts for a feed
    pub async fn count_posts_for_feed(&self, feed_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
