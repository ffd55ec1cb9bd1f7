use super::schema::Database;
use super::types::{Attributes, Feed, FeedDbRow, StoreError, FEED_COLUMNS};
use crate::sync::BackoffState;
use crate::util::sanitize_name;

/// Matches URL-backed feeds; query feeds are never fetched.
const FETCHABLE: &str =
    "f.url IS NOT NULL AND f.url != '' AND (f.query IS NULL OR trim(f.query) = '')";

impl Database {
    // ========================================================================
    // Feed Lifecycle
    // ========================================================================

    /// Create a URL feed, or return the existing one for the same URL.
    ///
    /// New feeds start at `wait_period` with no remaining wait, so the next
    /// scheduled session fetches them.
    pub async fn create_feed(
        &self,
        url: &str,
        title: &str,
        wait_period: u32,
    ) -> Result<Feed, StoreError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StoreError::Invalid("feed URL cannot be empty".into()));
        }
        let title = sanitize_name(title).unwrap_or_else(|| url.to_owned());
        let now = chrono::Utc::now().timestamp();

        // The no-op DO UPDATE makes RETURNING yield the existing row's id
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, wait_period, remaining_wait, created_at)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(url) DO UPDATE SET url = excluded.url
            RETURNING id
        "#,
        )
        .bind(&title)
        .bind(url)
        .bind(i64::from(wait_period))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_feed(id).await?.ok_or(StoreError::FeedNotFound(id))
    }

    /// Create a query feed whose articles are computed from `query`.
    pub async fn create_query_feed(
        &self,
        title: &str,
        query: &str,
        summary: &str,
    ) -> Result<Feed, StoreError> {
        let title = sanitize_name(title)
            .ok_or_else(|| StoreError::Invalid("query feed title cannot be empty".into()))?;
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::Invalid("query cannot be empty".into()));
        }
        let now = chrono::Utc::now().timestamp();

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, summary, query, wait_period, remaining_wait, created_at)
            VALUES (?, NULL, ?, ?, 0, 0, ?)
            RETURNING id
        "#,
        )
        .bind(&title)
        .bind(summary.trim())
        .bind(query)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_feed(id).await?.ok_or(StoreError::FeedNotFound(id))
    }

    /// Delete a feed. Its articles and their enclosures go with it; group
    /// memberships are dropped, the groups themselves stay.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn rename_feed(&self, feed_id: i64, title: &str) -> Result<(), StoreError> {
        let title = sanitize_name(title)
            .ok_or_else(|| StoreError::Invalid("feed title cannot be empty".into()))?;
        let result = sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    /// Replace a feed's opaque attribute map.
    pub async fn set_feed_attributes(
        &self,
        feed_id: i64,
        attributes: &Attributes,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(attributes)?;
        let result = sqlx::query("UPDATE feeds SET attributes = ? WHERE id = ?")
            .bind(json)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    // ========================================================================
    // Feed Queries
    // ========================================================================

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds f WHERE f.id = ?");
        let row = sqlx::query_as::<_, FeedDbRow>(&sql)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(FeedDbRow::into_feed).transpose()
    }

    pub async fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds f WHERE f.url = ?");
        let row = sqlx::query_as::<_, FeedDbRow>(&sql)
            .bind(url.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.map(FeedDbRow::into_feed).transpose()
    }

    /// All feeds with unread counts, ordered by title.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds f ORDER BY f.title COLLATE NOCASE, f.id");
        self.fetch_feeds(&sql).await
    }

    // ========================================================================
    // Backoff State
    // ========================================================================

    /// One scheduler tick: count every URL feed's remaining wait down by one,
    /// stopping at zero. Returns the number of feeds that moved.
    pub async fn tick_backoff(&self) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE feeds AS f SET remaining_wait = remaining_wait - 1 WHERE f.remaining_wait > 0 AND {FETCHABLE}"
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// URL feeds whose remaining wait has run out.
    pub async fn due_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f WHERE f.remaining_wait = 0 AND {FETCHABLE} ORDER BY f.id"
        );
        self.fetch_feeds(&sql).await
    }

    /// Every URL feed regardless of backoff, for forced refreshes.
    pub async fn fetchable_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds f WHERE {FETCHABLE} ORDER BY f.id");
        self.fetch_feeds(&sql).await
    }

    /// Store the backoff state after a successful fetch and clear the
    /// failure streak.
    pub async fn record_fetch_success(
        &self,
        feed_id: i64,
        state: BackoffState,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET wait_period = ?, remaining_wait = ?, consecutive_failures = 0, last_error = NULL
            WHERE id = ?
        "#,
        )
        .bind(i64::from(state.wait_period))
        .bind(i64::from(state.remaining_wait))
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    /// Store the backoff state after a failed fetch, returning the new
    /// consecutive failure count.
    pub async fn record_fetch_failure(
        &self,
        feed_id: i64,
        state: BackoffState,
        error: &str,
    ) -> Result<u32, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE feeds
            SET wait_period = ?, remaining_wait = ?,
                consecutive_failures = consecutive_failures + 1, last_error = ?
            WHERE id = ?
            RETURNING consecutive_failures
        "#,
        )
        .bind(i64::from(state.wait_period))
        .bind(i64::from(state.remaining_wait))
        .bind(error)
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        let (failures,) = row.ok_or(StoreError::FeedNotFound(feed_id))?;
        Ok(u32::try_from(failures).unwrap_or(u32::MAX))
    }

    async fn fetch_feeds(&self, sql: &str) -> Result<Vec<Feed>, StoreError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(FeedDbRow::into_feed).collect()
    }
}
