use anyhow::{bail, Result};

use super::schema::Database;
use super::types::{Feed, FeedDbRow, Group, FEED_COLUMNS};
use crate::util::sanitize_name;

const GROUP_COLUMNS: &str = r#"
    g.id, g.name,
    (SELECT COUNT(*) FROM feed_group_members m WHERE m.group_id = g.id) AS feed_count
"#;

impl Database {
    // ========================================================================
    // Group Operations
    // ========================================================================

    /// Sanitize and validate a group name.
    ///
    /// Strips control characters, trims whitespace, and rejects empty names.
    fn sanitize_group_name(name: &str) -> Result<String> {
        match sanitize_name(name) {
            Some(clean) => Ok(clean),
            None => bail!("Group name cannot be empty or whitespace-only"),
        }
    }

    /// Create a group, or return the id of the existing group with that name.
    pub async fn create_group(&self, name: &str) -> Result<i64> {
        let clean_name = Self::sanitize_group_name(name)?;

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feed_groups (name) VALUES (?)
            ON CONFLICT(name) DO UPDATE SET name = excluded.name
            RETURNING id
        "#,
        )
        .bind(&clean_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn rename_group(&self, id: i64, new_name: &str) -> Result<()> {
        let clean_name = Self::sanitize_group_name(new_name)?;

        let taken: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM feed_groups WHERE name = ? AND id != ?")
                .bind(&clean_name)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        if taken.is_some() {
            bail!("A group named '{}' already exists", clean_name);
        }

        let result = sqlx::query("UPDATE feed_groups SET name = ? WHERE id = ?")
            .bind(&clean_name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("Group {} does not exist", id);
        }
        Ok(())
    }

    /// Delete a group. Its feeds stay subscribed.
    pub async fn delete_group(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM feed_groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Add a feed to a group; adding twice is a no-op.
    pub async fn add_feed_to_group(&self, group_id: i64, feed_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO feed_group_members (group_id, feed_id) VALUES (?, ?)",
        )
        .bind(group_id)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_feed_from_group(&self, group_id: i64, feed_id: i64) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM feed_group_members WHERE group_id = ? AND feed_id = ?")
                .bind(group_id)
                .bind(feed_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Group Queries
    // ========================================================================

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM feed_groups g ORDER BY g.name COLLATE NOCASE");
        let groups = sqlx::query_as::<_, Group>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }

    pub async fn find_group_by_name(&self, name: &str) -> Result<Option<Group>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM feed_groups g WHERE g.name = ?");
        let group = sqlx::query_as::<_, Group>(&sql)
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    pub async fn feeds_in_group(&self, group_id: i64) -> Result<Vec<Feed>> {
        let sql = format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds f
            JOIN feed_group_members m ON m.feed_id = f.id
            WHERE m.group_id = ?
            ORDER BY f.title COLLATE NOCASE, f.id
        "#
        );
        let rows = sqlx::query_as::<_, FeedDbRow>(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        let feeds = rows
            .into_iter()
            .map(FeedDbRow::into_feed)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(feeds)
    }

    pub async fn groups_for_feed(&self, feed_id: i64) -> Result<Vec<Group>> {
        let sql = format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM feed_groups g
            JOIN feed_group_members fm ON fm.group_id = g.id
            WHERE fm.feed_id = ?
            ORDER BY g.name COLLATE NOCASE
        "#
        );
        let groups = sqlx::query_as::<_, Group>(&sql)
            .bind(feed_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_group_is_idempotent_by_name() {
        let db = test_db().await;
        let first = db.create_group("Tech").await.unwrap();
        let second = db.create_group("  Tech ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.list_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_group_name_sanitized() {
        let db = test_db().await;
        assert!(db.create_group("   ").await.is_err());
        let id = db.create_group("\x1b[31mNews\x1b[0m").await.unwrap();
        let groups = db.list_groups().await.unwrap();
        assert_eq!(groups[0].id, id);
        assert_eq!(groups[0].name, "News");
    }

    #[tokio::test]
    async fn test_feed_in_many_groups() {
        let db = test_db().await;
        let feed = db.create_feed("https://a.example.com/rss", "A", 1).await.unwrap();
        let tech = db.create_group("Tech").await.unwrap();
        let daily = db.create_group("Daily").await.unwrap();

        assert!(db.add_feed_to_group(tech, feed.id).await.unwrap());
        assert!(!db.add_feed_to_group(tech, feed.id).await.unwrap());
        assert!(db.add_feed_to_group(daily, feed.id).await.unwrap());

        let names: Vec<String> = db
            .groups_for_feed(feed.id)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["Daily", "Tech"]);
        assert_eq!(db.feeds_in_group(tech).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleting_group_keeps_feeds() {
        let db = test_db().await;
        let feed = db.create_feed("https://a.example.com/rss", "A", 1).await.unwrap();
        let group = db.create_group("Tech").await.unwrap();
        db.add_feed_to_group(group, feed.id).await.unwrap();

        assert!(db.delete_group(group).await.unwrap());
        assert!(db.get_feed(feed.id).await.unwrap().is_some());
        assert!(db.groups_for_feed(feed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_feed_drops_membership_only() {
        let db = test_db().await;
        let feed = db.create_feed("https://a.example.com/rss", "A", 1).await.unwrap();
        let group = db.create_group("Tech").await.unwrap();
        db.add_feed_to_group(group, feed.id).await.unwrap();

        db.delete_feed(feed.id).await.unwrap();
        let groups = db.list_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].feed_count, 0);
    }

    #[tokio::test]
    async fn test_rename_group_rejects_duplicates() {
        let db = test_db().await;
        let a = db.create_group("A").await.unwrap();
        db.create_group("B").await.unwrap();
        assert!(db.rename_group(a, "B").await.is_err());
        db.rename_group(a, "C").await.unwrap();
        assert!(db.find_group_by_name("C").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_feed_from_group() {
        let db = test_db().await;
        let feed = db.create_feed("https://a.example.com/rss", "A", 1).await.unwrap();
        let group = db.create_group("Tech").await.unwrap();
        db.add_feed_to_group(group, feed.id).await.unwrap();
        assert!(db.remove_feed_from_group(group, feed.id).await.unwrap());
        assert!(!db.remove_feed_from_group(group, feed.id).await.unwrap());
    }
}
