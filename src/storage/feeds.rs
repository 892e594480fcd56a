use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::schema::Database;
use super::types::{encode_list, DatabaseError, Feed, FeedDbRow, FeedMetadata, NewArticle, NewFeed};
use crate::feed::ExistingArticles;

const FEED_COLUMNS: &str = "id, url, title, description, site_url, image_url, format, enabled, \
     refresh_interval_minutes, last_fetched, last_attempted, last_error, unread_count";

/// Recomputes the cached unread count of a feed from its articles.
///
/// Must run inside the transaction that changed the articles' read state.
pub(crate) async fn recount_unread(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        "UPDATE feeds SET unread_count = \
             (SELECT COUNT(*) FROM articles WHERE feed_id = ? AND read = 0) \
         WHERE id = ? RETURNING unread_count",
    )
    .bind(feed_id)
    .bind(feed_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

impl Database {
    // ========================================================================
    // Feed Queries
    // ========================================================================

    /// All feeds, ordered by title.
    pub async fn get_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY title COLLATE NOCASE, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    /// Feeds eligible for refresh.
    pub async fn get_enabled_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE enabled = 1 ORDER BY title COLLATE NOCASE, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let row: Option<FeedDbRow> =
            sqlx::query_as(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"))
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(FeedDbRow::into_feed))
    }

    // ========================================================================
    // Feed Mutations
    // ========================================================================

    /// Insert a new feed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Duplicate` when a feed with the same URL exists.
    pub async fn insert_feed(&self, feed: &NewFeed) -> Result<Feed, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock().await;

        let result: Result<FeedDbRow, sqlx::Error> = sqlx::query_as(&format!(
            "INSERT INTO feeds (url, title, description, site_url, image_url, format, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {FEED_COLUMNS}"
        ))
        .bind(&feed.url)
        .bind(&feed.title)
        .bind(&feed.description)
        .bind(&feed.site_url)
        .bind(&feed.image_url)
        .bind(feed.format.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.into_feed()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(DatabaseError::Duplicate(feed.url.clone()))
            }
            Err(e) => Err(DatabaseError::from_sqlx(e)),
        }
    }

    /// Set or clear the error status for a feed.
    ///
    /// Setting an error also stamps `last_attempted`, so the failed feed is
    /// not due again until its refresh interval has passed.
    pub async fn set_feed_error(
        &self,
        feed_id: i64,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.write_lock().await;
        sqlx::query(
            "UPDATE feeds SET last_error = ?, \
                 last_attempted = CASE WHEN ? IS NULL THEN last_attempted ELSE ? END \
             WHERE id = ?",
        )
        .bind(error)
        .bind(error)
        .bind(now)
        .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Batch update feed error statuses in a single UPDATE statement.
    ///
    /// `updates` holds (feed_id, error_message) pairs from refresh attempts
    /// made just now; `None` clears the error. Every listed feed has
    /// `last_attempted` stamped.
    pub async fn batch_set_feed_errors(
        &self,
        updates: &[(i64, Option<String>)],
    ) -> Result<(), DatabaseError> {
        if updates.is_empty() {
            return Ok(());
        }

        // UPDATE feeds SET last_attempted = ?, last_error = CASE id WHEN 1 THEN 'e1'
        // WHEN 2 THEN NULL END WHERE id IN (1, 2)
        let now = chrono::Utc::now().timestamp();
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE feeds SET last_attempted = ");
        builder.push_bind(now);
        builder.push(", last_error = CASE id ");

        for (feed_id, error) in updates {
            builder.push("WHEN ");
            builder.push_bind(*feed_id);
            builder.push(" THEN ");
            builder.push_bind(error.as_deref());
            builder.push(" ");
        }

        builder.push("END WHERE id IN (");
        let mut separated = builder.separated(", ");
        for (feed_id, _) in updates {
            separated.push_bind(*feed_id);
        }
        separated.push_unseparated(")");

        let _guard = self.write_lock().await;
        builder.build().execute(&self.pool).await?;

        Ok(())
    }

    /// Enable or disable a feed; disabled feeds are skipped by refresh.
    pub async fn set_feed_enabled(&self, feed_id: i64, enabled: bool) -> Result<(), DatabaseError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query("UPDATE feeds SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::feed_not_found(feed_id));
        }
        Ok(())
    }

    /// Override the refresh interval of one feed. `None` reverts to the global default.
    pub async fn set_feed_refresh_interval(
        &self,
        feed_id: i64,
        minutes: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query("UPDATE feeds SET refresh_interval_minutes = ? WHERE id = ?")
            .bind(minutes.filter(|m| *m > 0))
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::feed_not_found(feed_id));
        }
        Ok(())
    }

    /// Delete a feed and, via cascade, all of its articles.
    pub async fn delete_feed(&self, feed_id: i64) -> Result<(), DatabaseError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::feed_not_found(feed_id));
        }
        Ok(())
    }

    /// Complete a feed refresh atomically.
    ///
    /// Inside one transaction this loads the identities of the feed's stored
    /// articles, hands them to `select` to pick the new articles, inserts
    /// those, recomputes the unread count, fills in missing metadata, stamps
    /// `last_fetched` and clears `last_error`. If any step fails, or the
    /// future is dropped before commit, nothing is persisted.
    ///
    /// Returns the number of inserted articles.
    pub async fn complete_feed_refresh<F>(
        &self,
        feed_id: i64,
        metadata: &FeedMetadata,
        fetched_at: i64,
        select: F,
    ) -> Result<usize, DatabaseError>
    where
        F: FnOnce(&ExistingArticles) -> Vec<NewArticle>,
    {
        let _guard = self.write_lock().await;
        let mut tx = self.pool.begin().await?;

        // Feed deleted while its document was in flight
        let present: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&mut *tx)
            .await?;
        if present.is_none() {
            return Err(DatabaseError::feed_not_found(feed_id));
        }

        let keys: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT source_id, url FROM articles WHERE feed_id = ?")
                .bind(feed_id)
                .fetch_all(&mut *tx)
                .await?;
        let existing = ExistingArticles::new(keys);
        let articles = select(&existing);

        // INSERT OR IGNORE: the UNIQUE(feed_id, source_id) constraint drops
        // anything the selection missed, and changes() counts real inserts.
        // 11 columns * 50 rows stays under SQLite's 999 parameter limit.
        const BATCH_SIZE: usize = 50;
        let mut inserted: usize = 0;

        for chunk in articles.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO articles (feed_id, source_id, title, summary, content, url, \
                 published, discovered_at, authors, categories, lead_image_url) ",
            );
            builder.push_values(chunk, |mut b, article| {
                b.push_bind(feed_id)
                    .push_bind(&article.source_id)
                    .push_bind(&article.title)
                    .push_bind(&article.summary)
                    .push_bind(&article.content)
                    .push_bind(&article.url)
                    .push_bind(article.published)
                    .push_bind(article.discovered_at)
                    .push_bind(encode_list(&article.authors))
                    .push_bind(encode_list(&article.categories))
                    .push_bind(&article.lead_image_url);
            });
            builder.build().execute(&mut *tx).await?;

            let (changes,): (i64,) = sqlx::query_as("SELECT changes()")
                .fetch_one(&mut *tx)
                .await?;
            inserted += usize::try_from(changes).unwrap_or(0);
        }

        recount_unread(&mut tx, feed_id).await?;

        sqlx::query(
            "UPDATE feeds SET \
                 last_fetched = ?, \
                 last_attempted = ?, \
                 last_error = NULL, \
                 format = COALESCE(?, format), \
                 description = COALESCE(description, ?), \
                 site_url = COALESCE(site_url, ?), \
                 image_url = COALESCE(image_url, ?) \
             WHERE id = ?",
        )
        .bind(fetched_at)
        .bind(fetched_at)
        .bind(metadata.format.map(|f| f.as_str()))
        .bind(&metadata.description)
        .bind(&metadata.site_url)
        .bind(&metadata.image_url)
        .bind(feed_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if existing.len() + inserted > 0 {
            tracing::debug!(
                feed_id,
                existing = existing.len(),
                inserted,
                "Feed refresh committed"
            );
        }

        Ok(inserted)
    }
}
