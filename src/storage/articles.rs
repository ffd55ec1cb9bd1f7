use super::query::QueryEvaluator;
use super::schema::Database;
use super::types::{Article, ArticleDbRow, Attributes, Feed, StoreError, ARTICLE_COLUMNS};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

/// Rows fetched per round trip when loading a query feed's universe.
const UNIVERSE_PAGE_SIZE: i64 = 500;

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>, StoreError> {
        let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?");
        let row = sqlx::query_as::<_, ArticleDbRow>(&sql)
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ArticleDbRow::into_article).transpose()
    }

    /// Look up an article by its identifier within one feed.
    pub async fn find_article(
        &self,
        feed_id: i64,
        identifier: &str,
    ) -> Result<Option<Article>, StoreError> {
        let sql =
            format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE feed_id = ? AND identifier = ?");
        let row = sqlx::query_as::<_, ArticleDbRow>(&sql)
            .bind(feed_id)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ArticleDbRow::into_article).transpose()
    }

    /// Articles stored under a feed, newest first.
    ///
    /// Capped at `MAX_ARTICLES`. Query feeds own no stored articles; use
    /// [`Database::articles_for_feed`] to read them.
    pub async fn articles_in_feed(&self, feed_id: i64) -> Result<Vec<Article>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS}
            FROM articles
            WHERE feed_id = ?
            ORDER BY COALESCE(published, updated_at) DESC, id DESC
            LIMIT ?
        "#
        );
        let rows = sqlx::query_as::<_, ArticleDbRow>(&sql)
            .bind(feed_id)
            .bind(MAX_ARTICLES)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ArticleDbRow::into_article).collect()
    }

    /// The article set a reader sees for `feed`.
    ///
    /// URL feeds return their stored articles. Query feeds hand every article
    /// of every URL feed to `evaluator`, newest first, together with the
    /// saved predicate and return whatever it selects.
    pub async fn articles_for_feed(
        &self,
        feed: &Feed,
        evaluator: &dyn QueryEvaluator,
    ) -> Result<Vec<Article>, StoreError> {
        let Some(query) = feed.query.as_deref().filter(|_| feed.is_query_feed()) else {
            return self.articles_in_feed(feed.id).await;
        };

        let universe = self.article_universe().await?;
        tracing::debug!(
            feed_id = feed.id,
            universe = universe.len(),
            "Evaluating query feed"
        );
        Ok(evaluator.evaluate(query, universe))
    }

    /// All articles of URL feeds, newest first, loaded in keyset pages.
    async fn article_universe(&self) -> Result<Vec<Article>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS}
            FROM articles
            WHERE feed_id IN (SELECT id FROM feeds WHERE query IS NULL OR trim(query) = '')
              AND (COALESCE(published, updated_at), id) < (?, ?)
            ORDER BY COALESCE(published, updated_at) DESC, id DESC
            LIMIT ?
        "#
        );

        let mut universe: Vec<Article> = Vec::new();
        let mut cursor = (i64::MAX, i64::MAX);
        loop {
            let rows = sqlx::query_as::<_, ArticleDbRow>(&sql)
                .bind(cursor.0)
                .bind(cursor.1)
                .bind(UNIVERSE_PAGE_SIZE)
                .fetch_all(&self.pool)
                .await?;
            let full_page = rows.len() as i64 == UNIVERSE_PAGE_SIZE;
            for row in rows {
                universe.push(row.into_article()?);
            }
            match universe.last() {
                Some(last) if full_page => {
                    cursor = (last.published.unwrap_or(last.updated_at), last.id);
                }
                _ => break,
            }
        }
        Ok(universe)
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set an article's read flag, returns whether it changed
    pub async fn mark_article_read(&self, article_id: i64, read: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE articles SET read = ? WHERE id = ? AND read != ?")
            .bind(read)
            .bind(article_id)
            .bind(read)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark every unread article of a feed as read, returns count of articles marked
    pub async fn mark_feed_read(&self, feed_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE articles SET read = 1 WHERE feed_id = ? AND read = 0")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete one article and its enclosures.
    ///
    /// A later sync may bring it back if the document still lists it.
    pub async fn delete_article(&self, article_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM articles WHERE id = ?")
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_article_attributes(
        &self,
        article_id: i64,
        attributes: &Attributes,
    ) -> Result<bool, StoreError> {
        let json = serde_json::to_string(attributes)?;
        let result = sqlx::query("UPDATE articles SET attributes = ? WHERE id = ?")
            .bind(json)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{
        Article, Database, KeywordEvaluator, ParsedEntry, ParsedFeed, QueryEvaluator,
    };
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn doc(titles: &[&str]) -> ParsedFeed {
        ParsedFeed {
            entries: titles
                .iter()
                .enumerate()
                .map(|(i, title)| ParsedEntry {
                    identifier: Some(format!("{title}-{i}")),
                    title: title.to_string(),
                    published: Some(1_700_000_000 + i as i64),
                    ..ParsedEntry::default()
                })
                .collect(),
            ..ParsedFeed::default()
        }
    }

    async fn seeded(db: &Database, url: &str, titles: &[&str]) -> i64 {
        let feed = db.create_feed(url, "", 1).await.unwrap();
        db.merge_feed(feed.id, &doc(titles), 1_700_000_000)
            .await
            .unwrap();
        feed.id
    }

    #[tokio::test]
    async fn test_articles_newest_first() {
        let db = test_db().await;
        let feed_id = seeded(&db, "https://a.example.com/rss", &["old", "mid", "new"]).await;
        let titles: Vec<String> = db
            .articles_in_feed(feed_id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.title.to_string())
            .collect();
        assert_eq!(titles, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_query_feed_finds_matches_beyond_the_listing_cap() {
        let db = test_db().await;
        let mut titles = vec!["needle"];
        titles.extend(std::iter::repeat("filler").take(2100));
        let feed_id = seeded(&db, "https://a.example.com/rss", &titles).await;
        assert_eq!(db.articles_in_feed(feed_id).await.unwrap().len(), 2000);

        let query = db.create_query_feed("Needles", "needle", "").await.unwrap();
        let found = db
            .articles_for_feed(&query, &KeywordEvaluator)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier, "needle-0");

        let all = db.create_query_feed("Fillers", "filler", "").await.unwrap();
        let fillers = db.articles_for_feed(&all, &KeywordEvaluator).await.unwrap();
        assert_eq!(fillers.len(), 2100);
        assert!(fillers.windows(2).all(|w| w[0].published >= w[1].published));
    }

    #[tokio::test]
    async fn test_mark_article_read_and_unread() {
        let db = test_db().await;
        let feed_id = seeded(&db, "https://a.example.com/rss", &["one"]).await;
        let article = db.find_article(feed_id, "one-0").await.unwrap().unwrap();
        assert!(!article.read);

        assert!(db.mark_article_read(article.id, true).await.unwrap());
        assert!(!db.mark_article_read(article.id, true).await.unwrap());
        assert!(db.get_article(article.id).await.unwrap().unwrap().read);

        assert!(db.mark_article_read(article.id, false).await.unwrap());
        assert!(!db.get_article(article.id).await.unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn test_mark_feed_read_only_touches_that_feed() {
        let db = test_db().await;
        let a = seeded(&db, "https://a.example.com/rss", &["1", "2", "3"]).await;
        let b = seeded(&db, "https://b.example.com/rss", &["4"]).await;

        assert_eq!(db.mark_feed_read(a).await.unwrap(), 3);
        assert_eq!(db.mark_feed_read(a).await.unwrap(), 0);

        let feeds = db.list_feeds().await.unwrap();
        let unread = |id: i64| feeds.iter().find(|f| f.id == id).unwrap().unread_count;
        assert_eq!(unread(a), 0);
        assert_eq!(unread(b), 1);
    }

    #[tokio::test]
    async fn test_delete_feed_cascades_to_articles() {
        let db = test_db().await;
        let feed_id = seeded(&db, "https://a.example.com/rss", &["1", "2"]).await;
        let article = db.find_article(feed_id, "1-0").await.unwrap().unwrap();

        db.delete_feed(feed_id).await.unwrap();
        assert!(db.get_article(article.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_article() {
        let db = test_db().await;
        let feed_id = seeded(&db, "https://a.example.com/rss", &["1"]).await;
        let article = db.find_article(feed_id, "1-0").await.unwrap().unwrap();
        assert!(db.delete_article(article.id).await.unwrap());
        assert!(!db.delete_article(article.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_article_attributes_round_trip() {
        let db = test_db().await;
        let feed_id = seeded(&db, "https://a.example.com/rss", &["1"]).await;
        let article = db.find_article(feed_id, "1-0").await.unwrap().unwrap();

        let mut attributes = crate::storage::Attributes::new();
        attributes.insert("flagged".into(), serde_json::Value::Bool(true));
        assert!(db.set_article_attributes(article.id, &attributes).await.unwrap());

        let stored = db.get_article(article.id).await.unwrap().unwrap();
        assert_eq!(stored.attributes, attributes);
    }

    struct Recording(std::sync::Mutex<Option<(String, usize)>>);

    impl QueryEvaluator for Recording {
        fn evaluate(&self, query: &str, universe: Vec<Article>) -> Vec<Article> {
            *self.0.lock().unwrap() = Some((query.to_string(), universe.len()));
            universe.into_iter().take(1).collect()
        }
    }

    #[tokio::test]
    async fn test_query_feed_reads_delegate_to_evaluator() {
        let db = test_db().await;
        seeded(&db, "https://a.example.com/rss", &["rust news", "cooking"]).await;
        seeded(&db, "https://b.example.com/rss", &["more rust"]).await;
        let query_feed = db
            .create_query_feed("Rust", "rust", "")
            .await
            .unwrap();

        let recorder = Recording(std::sync::Mutex::new(None));
        let hits = db.articles_for_feed(&query_feed, &recorder).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            recorder.0.lock().unwrap().clone(),
            Some(("rust".to_string(), 3))
        );

        let hits = db
            .articles_for_feed(&query_feed, &KeywordEvaluator)
            .await
            .unwrap();
        let mut titles: Vec<String> = hits.iter().map(|a| a.title.to_string()).collect();
        titles.sort();
        assert_eq!(titles, vec!["more rust", "rust news"]);
    }

    #[tokio::test]
    async fn test_url_feed_reads_ignore_evaluator() {
        let db = test_db().await;
        let feed_id = seeded(&db, "https://a.example.com/rss", &["x", "y"]).await;
        let feed = db.get_feed(feed_id).await.unwrap().unwrap();
        let recorder = Recording(std::sync::Mutex::new(None));
        let articles = db.articles_for_feed(&feed, &recorder).await.unwrap();
        assert_eq!(articles.len(), 2);
        assert!(recorder.0.lock().unwrap().is_none());
    }
}
