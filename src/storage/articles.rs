use super::feeds::recount_unread;
use super::schema::Database;
use super::types::{Article, ArticleDbRow, DatabaseError};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

const ARTICLE_COLUMNS: &str = "id, feed_id, source_id, title, summary, content, url, published, \
     discovered_at, authors, categories, read, read_at, bookmarked, bookmarked_at, \
     content_fetched, content_fetched_at, lead_image_url";

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Get articles for a specific feed, newest first.
    /// Defaults to 500 rows and is hard-capped at `MAX_ARTICLES`.
    pub async fn get_articles_for_feed(
        &self,
        feed_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let limit = limit.unwrap_or(500).clamp(0, MAX_ARTICLES);
        tracing::debug!(limit, feed_id, "get_articles_for_feed with limit cap");

        let rows = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE feed_id = ? \
             ORDER BY published DESC, discovered_at DESC, id DESC LIMIT ?"
        ))
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    pub async fn get_article_by_id(&self, article_id: i64) -> Result<Option<Article>, DatabaseError> {
        let row = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?"
        ))
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArticleDbRow::into_article))
    }

    /// All bookmarked articles across feeds, newest first.
    pub async fn get_bookmarked_articles(&self) -> Result<Vec<Article>, DatabaseError> {
        let rows = sqlx::query_as::<_, ArticleDbRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE bookmarked = 1 \
             ORDER BY published DESC, id DESC LIMIT ?"
        ))
        .bind(MAX_ARTICLES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Set an article's read state and recompute its feed's unread count in
    /// the same transaction.
    ///
    /// Idempotent: setting the state an article already has changes nothing.
    /// Returns the feed's unread count after the change.
    pub async fn set_article_read(
        &self,
        article_id: i64,
        read: bool,
    ) -> Result<i64, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE articles SET \
                 read_at = CASE WHEN ? THEN COALESCE(read_at, ?) ELSE NULL END, \
                 read = ? \
             WHERE id = ? RETURNING feed_id",
        )
        .bind(read)
        .bind(now)
        .bind(read)
        .bind(article_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((feed_id,)) = row else {
            return Err(DatabaseError::article_not_found(article_id));
        };

        let unread = recount_unread(&mut tx, feed_id).await?;
        tx.commit().await?;
        Ok(unread)
    }

    /// Mark every article of a feed as read, returns count of articles marked
    pub async fn mark_all_read_for_feed(&self, feed_id: i64) -> Result<u64, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock().await;
        let mut tx = self.pool.begin().await?;

        let result =
            sqlx::query("UPDATE articles SET read = 1, read_at = ? WHERE feed_id = ? AND read = 0")
                .bind(now)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DatabaseError::feed_not_found(feed_id));
        }

        recount_unread(&mut tx, feed_id).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Atomically toggle bookmark status, returning the new value
    ///
    /// Uses SQLite's RETURNING clause to perform the toggle and get the
    /// new value in a single statement.
    pub async fn toggle_article_bookmarked(&self, article_id: i64) -> Result<bool, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock().await;
        let result: Option<(bool,)> = sqlx::query_as(
            "UPDATE articles SET \
                 bookmarked = NOT bookmarked, \
                 bookmarked_at = CASE WHEN bookmarked THEN NULL ELSE ? END \
             WHERE id = ? RETURNING bookmarked",
        )
        .bind(now)
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;

        result
            .map(|(bookmarked,)| bookmarked)
            .ok_or_else(|| DatabaseError::article_not_found(article_id))
    }

    /// Store the full content of an article and flag it as fetched.
    pub async fn set_article_content(
        &self,
        article_id: i64,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock().await;
        let result = sqlx::query(
            "UPDATE articles SET content = ?, content_fetched = 1, content_fetched_at = ? WHERE id = ?",
        )
        .bind(content)
        .bind(now)
        .bind(article_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::article_not_found(article_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::FeedFormat;
    use crate::storage::{Database, DatabaseError, Feed, FeedMetadata, NewArticle, NewFeed};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn feed_with_articles(db: &Database, n: usize, ids: &[&str]) -> Feed {
        let feed = db
            .insert_feed(&NewFeed {
                url: format!("https://feed{}.example.com/rss", n),
                title: format!("Test Feed {}", n),
                description: None,
                site_url: None,
                image_url: None,
                format: FeedFormat::Rss,
            })
            .await
            .unwrap();
        let articles: Vec<NewArticle> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| NewArticle {
                feed_id: feed.id,
                source_id: id.to_string(),
                title: format!("Article {}", id),
                summary: Some("Summary".into()),
                content: None,
                url: Some(format!("https://example.com/{}", id)),
                published: 1_704_067_200 + i as i64,
                discovered_at: 1_704_067_200,
                authors: vec![],
                categories: vec!["news".into()],
                lead_image_url: None,
            })
            .collect();
        db.complete_feed_refresh(feed.id, &FeedMetadata::default(), 1, move |_| articles)
            .await
            .unwrap();
        db.get_feed(feed.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_articles_newest_first_with_defaults() {
        let db = test_db().await;
        let feed = feed_with_articles(&db, 1, &["a", "b", "c"]).await;

        let articles = db.get_articles_for_feed(feed.id, None).await.unwrap();
        let ids: Vec<_> = articles.iter().map(|a| a.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let first = &articles[0];
        assert!(!first.read);
        assert!(!first.bookmarked);
        assert!(!first.content_fetched);
        assert!(first.is_summary_only());
        assert_eq!(first.categories, vec!["news".to_string()]);
    }

    #[tokio::test]
    async fn test_get_articles_pagination() {
        let db = test_db().await;
        let feed = feed_with_articles(&db, 1, &["a", "b", "c", "d"]).await;
        let limited = db.get_articles_for_feed(feed.id, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_read_state_updates_unread_count() {
        let db = test_db().await;
        let feed = feed_with_articles(&db, 1, &["a", "b", "c"]).await;
        assert_eq!(feed.unread_count, 3);

        let articles = db.get_articles_for_feed(feed.id, None).await.unwrap();
        let unread = db.set_article_read(articles[0].id, true).await.unwrap();
        assert_eq!(unread, 2);

        // Idempotent
        let unread = db.set_article_read(articles[0].id, true).await.unwrap();
        assert_eq!(unread, 2);

        let article = db.get_article_by_id(articles[0].id).await.unwrap().unwrap();
        assert!(article.read);
        assert!(article.read_at.is_some());

        let unread = db.set_article_read(articles[0].id, false).await.unwrap();
        assert_eq!(unread, 3);
        let article = db.get_article_by_id(articles[0].id).await.unwrap().unwrap();
        assert_eq!(article.read_at, None);

        assert_eq!(db.get_feed(feed.id).await.unwrap().unwrap().unread_count, 3);
    }

    #[tokio::test]
    async fn test_set_read_unknown_article() {
        let db = test_db().await;
        let err = db.set_article_read(42, true).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { id: 42, .. }));
    }

    #[tokio::test]
    async fn test_mark_all_read_for_feed() {
        let db = test_db().await;
        let feed1 = feed_with_articles(&db, 1, &["1", "2", "3"]).await;
        let feed2 = feed_with_articles(&db, 2, &["4"]).await;

        let articles = db.get_articles_for_feed(feed1.id, None).await.unwrap();
        db.set_article_read(articles[0].id, true).await.unwrap();

        assert_eq!(db.mark_all_read_for_feed(feed1.id).await.unwrap(), 2);
        assert_eq!(db.mark_all_read_for_feed(feed1.id).await.unwrap(), 0);

        let feed1 = db.get_feed(feed1.id).await.unwrap().unwrap();
        let feed2 = db.get_feed(feed2.id).await.unwrap().unwrap();
        assert_eq!(feed1.unread_count, 0);
        assert_eq!(feed2.unread_count, 1);
    }

    #[tokio::test]
    async fn test_toggle_bookmark() {
        let db = test_db().await;
        let feed = feed_with_articles(&db, 1, &["a"]).await;
        let id = db.get_articles_for_feed(feed.id, None).await.unwrap()[0].id;

        assert!(db.toggle_article_bookmarked(id).await.unwrap());
        let article = db.get_article_by_id(id).await.unwrap().unwrap();
        assert!(article.bookmarked_at.is_some());
        assert_eq!(db.get_bookmarked_articles().await.unwrap().len(), 1);

        assert!(!db.toggle_article_bookmarked(id).await.unwrap());
        assert!(db.get_bookmarked_articles().await.unwrap().is_empty());

        assert!(db.toggle_article_bookmarked(999).await.is_err());
    }

    #[tokio::test]
    async fn test_set_article_content_marks_fetched() {
        let db = test_db().await;
        let feed = feed_with_articles(&db, 1, &["a"]).await;
        let id = db.get_articles_for_feed(feed.id, None).await.unwrap()[0].id;

        db.set_article_content(id, "<p>Full text</p>").await.unwrap();
        let article = db.get_article_by_id(id).await.unwrap().unwrap();
        assert_eq!(article.content.as_deref(), Some("<p>Full text</p>"));
        assert!(article.content_fetched);
        assert!(article.content_fetched_at.is_some());
        assert!(!article.is_summary_only());
    }
}
