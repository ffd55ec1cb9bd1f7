use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::HashMap;

use super::schema::Database;
use super::types::{ParsedEnclosure, ParsedFeed, StoreError};
use crate::sync::merge::{plan_merge, ArticleSnapshot, MergePlan, MergeReport, PendingDownload};
use crate::util::{html_to_text, sanitize_name};

/// Snapshot row: id, identifier, title, link, summary, author, content, published, updated_at
type SnapshotRow = (
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    i64,
);

/// 10 bound columns per row keeps each statement far below SQLite's parameter limit
const INSERT_BATCH_SIZE: usize = 50;

impl Database {
    /// Apply a fetched document to a feed atomically.
    ///
    /// Within one transaction: refresh the feed's descriptive metadata, take a
    /// snapshot of its articles and enclosure URLs, plan the merge and apply
    /// the resulting creates, updates and enclosure inserts. Either all of it
    /// commits or none of it does, and a committed merge is on disk before
    /// this returns.
    ///
    /// The first statement is a write, so the transaction holds SQLite's
    /// write lock before it reads the snapshot. Two merges into the same feed
    /// therefore serialize instead of planning against the same stale state.
    pub async fn merge_feed(
        &self,
        feed_id: i64,
        document: &ParsedFeed,
        now: i64,
    ) -> Result<MergeReport, StoreError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE feeds SET last_fetched = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }

        refresh_feed_info(&mut tx, feed_id, document).await?;

        let snapshot = load_snapshot(&mut tx, feed_id).await?;
        let plan = plan_merge(&snapshot, &document.entries, now);

        let mut report = MergeReport {
            created: plan.creates.len(),
            updated: plan.updates.len(),
            warnings: plan.warnings.clone(),
            ..MergeReport::default()
        };

        if !plan.is_empty() {
            apply_plan(&mut tx, feed_id, &plan, &mut report).await?;
        }

        tx.commit().await?;

        tracing::debug!(
            feed_id = feed_id,
            created = report.created,
            updated = report.updated,
            enclosures = report.enclosures_added,
            warnings = report.warnings.len(),
            "Merged feed document"
        );
        Ok(report)
    }
}

/// Title is only replaced while it is still the URL placeholder, so a
/// user's rename survives later fetches.
async fn refresh_feed_info(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: i64,
    document: &ParsedFeed,
) -> Result<(), StoreError> {
    if let Some(title) = document.title.as_deref().and_then(sanitize_name) {
        sqlx::query("UPDATE feeds SET title = ? WHERE id = ? AND title = url")
            .bind(title)
            .bind(feed_id)
            .execute(&mut **tx)
            .await?;
    }

    let summary = document
        .summary
        .as_deref()
        .map(html_to_text)
        .filter(|s| !s.is_empty());
    let image_url = document.image_url.as_deref().filter(|u| !u.trim().is_empty());
    if summary.is_some() || image_url.is_some() {
        sqlx::query(
            "UPDATE feeds SET summary = COALESCE(?, summary), image_url = COALESCE(?, image_url) WHERE id = ?",
        )
        .bind(summary)
        .bind(image_url)
        .bind(feed_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn load_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: i64,
) -> Result<Vec<ArticleSnapshot>, StoreError> {
    let rows: Vec<SnapshotRow> = sqlx::query_as(
        r#"
        SELECT id, identifier, title, link, summary, author, content, published, updated_at
        FROM articles
        WHERE feed_id = ?
    "#,
    )
    .bind(feed_id)
    .fetch_all(&mut **tx)
    .await?;

    let enclosure_rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT e.article_id, e.url
        FROM enclosures e
        JOIN articles a ON a.id = e.article_id
        WHERE a.feed_id = ?
    "#,
    )
    .bind(feed_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut urls: HashMap<i64, Vec<String>> = HashMap::new();
    for (article_id, url) in enclosure_rows {
        urls.entry(article_id).or_default().push(url);
    }

    Ok(rows
        .into_iter()
        .map(
            |(id, identifier, title, link, summary, author, content, published, updated_at)| {
                ArticleSnapshot {
                    id,
                    identifier,
                    title,
                    link,
                    summary,
                    author,
                    content,
                    published,
                    updated_at,
                    enclosure_urls: urls.remove(&id).unwrap_or_default(),
                }
            },
        )
        .collect())
}

async fn apply_plan(
    tx: &mut Transaction<'_, Sqlite>,
    feed_id: i64,
    plan: &MergePlan,
    report: &mut MergeReport,
) -> Result<(), StoreError> {
    for chunk in plan.creates.chunks(INSERT_BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO articles (feed_id, identifier, title, link, summary, author, content, published, updated_at, read) ",
        );
        builder.push_values(chunk, |mut b, article| {
            b.push_bind(feed_id)
                .push_bind(&article.identifier)
                .push_bind(&article.title)
                .push_bind(&article.link)
                .push_bind(&article.summary)
                .push_bind(&article.author)
                .push_bind(&article.content)
                .push_bind(article.published)
                .push_bind(article.updated_at)
                .push_bind(false);
        });
        builder.push(" RETURNING id, identifier");

        let inserted: Vec<(i64, String)> = builder.build_query_as().fetch_all(&mut **tx).await?;
        let ids: HashMap<&str, i64> = inserted
            .iter()
            .map(|(id, identifier)| (identifier.as_str(), *id))
            .collect();

        for article in chunk {
            let Some(&article_id) = ids.get(article.identifier.as_str()) else {
                continue;
            };
            insert_enclosures(tx, article_id, &article.enclosures, report).await?;
        }
    }

    for update in &plan.updates {
        sqlx::query(
            r#"
            UPDATE articles
            SET title = ?, link = ?, summary = ?, author = ?, content = ?,
                published = ?, updated_at = ?
            WHERE id = ? AND feed_id = ?
        "#,
        )
        .bind(&update.title)
        .bind(&update.link)
        .bind(&update.summary)
        .bind(&update.author)
        .bind(&update.content)
        .bind(update.published)
        .bind(update.updated_at)
        .bind(update.id)
        .bind(feed_id)
        .execute(&mut **tx)
        .await?;

        insert_enclosures(tx, update.id, &update.new_enclosures, report).await?;
    }

    Ok(())
}

async fn insert_enclosures(
    tx: &mut Transaction<'_, Sqlite>,
    article_id: i64,
    enclosures: &[ParsedEnclosure],
    report: &mut MergeReport,
) -> Result<(), StoreError> {
    for enclosure in enclosures {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO enclosures (article_id, url, kind, downloaded)
            VALUES (?, ?, ?, 0)
            ON CONFLICT(article_id, url) DO NOTHING
            RETURNING id
        "#,
        )
        .bind(article_id)
        .bind(&enclosure.url)
        .bind(&enclosure.kind)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((enclosure_id,)) = row {
            report.enclosures_added += 1;
            report.new_enclosures.push(PendingDownload {
                enclosure_id,
                url: enclosure.url.clone(),
            });
        }
    }
    Ok(())
}
