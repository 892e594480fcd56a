use serde::Serialize;
use thiserror::Error;

use crate::feed::FeedFormat;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("The feed database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A feed with this URL is already stored
    #[error("Feed already exists: {0}")]
    Duplicate(String),

    /// No row with the given id
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }

    pub(crate) fn feed_not_found(id: i64) -> Self {
        DatabaseError::NotFound { entity: "Feed", id }
    }

    pub(crate) fn article_not_found(id: i64) -> Self {
        DatabaseError::NotFound {
            entity: "Article",
            id,
        }
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
    pub format: String,
    pub enabled: bool,
    pub refresh_interval_minutes: Option<i64>,
    pub last_fetched: Option<i64>,
    pub last_attempted: Option<i64>,
    pub last_error: Option<String>,
    pub unread_count: i64,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        let format = self.format.parse().unwrap_or_else(|e| {
            tracing::warn!(feed_id = self.id, error = %e, "Unknown stored feed format, assuming RSS");
            FeedFormat::Rss
        });
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            site_url: self.site_url,
            image_url: self.image_url,
            format,
            enabled: self.enabled,
            refresh_interval_minutes: self.refresh_interval_minutes,
            last_fetched: self.last_fetched,
            last_attempted: self.last_attempted,
            last_error: self.last_error,
            unread_count: self.unread_count,
        }
    }
}

/// Internal row type for article queries.
/// Authors and categories are stored as JSON arrays.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub source_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub published: i64,
    pub discovered_at: i64,
    pub authors: String,
    pub categories: String,
    pub read: bool,
    pub read_at: Option<i64>,
    pub bookmarked: bool,
    pub bookmarked_at: Option<i64>,
    pub content_fetched: bool,
    pub content_fetched_at: Option<i64>,
    pub lead_image_url: Option<String>,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            source_id: self.source_id,
            title: self.title,
            summary: self.summary,
            content: self.content,
            url: self.url,
            published: self.published,
            discovered_at: self.discovered_at,
            authors: decode_list(&self.authors),
            categories: decode_list(&self.categories),
            read: self.read,
            read_at: self.read_at,
            bookmarked: self.bookmarked,
            bookmarked_at: self.bookmarked_at,
            content_fetched: self.content_fetched,
            content_fetched_at: self.content_fetched_at,
            lead_image_url: self.lead_image_url,
        }
    }
}

pub(crate) fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_owned())
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Malformed list column, treating as empty");
        Vec::new()
    })
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed.
///
/// `unread_count` is a cached projection over the feed's articles; it is
/// recomputed in the same transaction as every article-state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
    pub format: FeedFormat,
    pub enabled: bool,
    /// Overrides the global default when set
    pub refresh_interval_minutes: Option<i64>,
    /// Unix seconds of the last successful fetch
    pub last_fetched: Option<i64>,
    /// Unix seconds of the last refresh attempt, failed ones included
    pub last_attempted: Option<i64>,
    pub last_error: Option<String>,
    pub unread_count: i64,
}

impl Feed {
    pub fn effective_refresh_interval_minutes(&self, default_minutes: u64) -> i64 {
        self.refresh_interval_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or_else(|| i64::try_from(default_minutes).unwrap_or(i64::MAX))
    }

    /// Whether the feed should be polled at `now` (unix seconds).
    pub fn is_due(&self, now: i64, default_minutes: u64) -> bool {
        if !self.enabled {
            return false;
        }
        // A failing feed waits out its interval like a healthy one
        match self.last_fetched.max(self.last_attempted) {
            None => true,
            Some(last) => {
                let interval_secs = self
                    .effective_refresh_interval_minutes(default_minutes)
                    .saturating_mul(60);
                now.saturating_sub(last) >= interval_secs
            }
        }
    }
}

/// Data needed to subscribe to a feed.
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
    pub format: FeedFormat,
}

/// Feed-level data observed during a refresh.
///
/// Missing stored values are filled in; values already stored are kept.
#[derive(Debug, Clone, Default)]
pub struct FeedMetadata {
    pub format: Option<FeedFormat>,
    pub description: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
}

/// An article ready to be inserted, produced by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    pub feed_id: i64,
    /// Dedup key: feed id, else link, else synthesized hash
    pub source_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub published: i64,
    pub discovered_at: i64,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub lead_image_url: Option<String>,
}

/// A stored article.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub source_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
    pub published: i64,
    pub discovered_at: i64,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub read: bool,
    pub read_at: Option<i64>,
    pub bookmarked: bool,
    pub bookmarked_at: Option<i64>,
    pub content_fetched: bool,
    pub content_fetched_at: Option<i64>,
    pub lead_image_url: Option<String>,
}

impl Article {
    /// True when the feed supplied only a summary, not full content.
    pub fn is_summary_only(&self) -> bool {
        self.content.is_none()
    }
}
