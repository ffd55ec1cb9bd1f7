use super::schema::Database;
use super::types::{Enclosure, EnclosureDbRow, StoreError};

impl Database {
    // ========================================================================
    // Enclosure Operations
    // ========================================================================

    pub async fn enclosures_for_article(
        &self,
        article_id: i64,
    ) -> Result<Vec<Enclosure>, StoreError> {
        let rows = sqlx::query_as::<_, EnclosureDbRow>(
            r#"
            SELECT id, article_id, url, kind, data, downloaded
            FROM enclosures
            WHERE article_id = ?
            ORDER BY id
        "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Enclosure::from).collect())
    }

    /// Attach downloaded bytes to an enclosure.
    ///
    /// Returns `false` if the enclosure no longer exists, e.g. its feed was
    /// deleted while the download was in flight.
    pub async fn store_enclosure_data(
        &self,
        enclosure_id: i64,
        data: &[u8],
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE enclosures SET data = ?, downloaded = 1 WHERE id = ?")
            .bind(data)
            .bind(enclosure_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enclosures never downloaded, as `(id, url)` pairs, oldest first.
    pub async fn pending_enclosures(&self, limit: i64) -> Result<Vec<(i64, String)>, StoreError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, url FROM enclosures WHERE downloaded = 0 ORDER BY id LIMIT ?",
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
