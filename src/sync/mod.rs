//! Feed refresh orchestration.
//!
//! [`FeedSync`] ties the fetcher, parser, normalizer and store together:
//!
//! - **Add**: subscribe to a feed URL, or discover one from a website page
//! - **Refresh**: fetch → parse → dedup → persist for one feed or all of them
//! - **Read state**: article read/unread changes that keep unread counts exact
//!
//! A batch refresh never fails because one feed failed. Each feed's outcome
//! is collected into a [`RefreshReport`] and its error is stored on the feed.

mod locks;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::feed::{
    discover_feeds, discover_in_page, parse_document, select_new_articles, DiscoveryError,
    FeedCandidate, FetchError, FetchedDocument, Fetcher, ParseError, ParsedFeed,
};
use crate::storage::{Database, DatabaseError, Feed, FeedMetadata, NewFeed};
use crate::util::with_default_scheme;

pub use locks::FeedLocks;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The URL is already subscribed
    #[error("Already subscribed to {0}")]
    DuplicateFeed(String),

    /// Unknown feed or article id
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// The page at the URL is neither a feed nor links to one
    #[error("No feed found at {0}")]
    NoFeedFound(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Could not parse feed: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Duplicate(url) => SyncError::DuplicateFeed(url),
            DatabaseError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            other => SyncError::Database(other),
        }
    }
}

impl SyncError {
    fn feed_not_found(id: i64) -> Self {
        SyncError::NotFound { entity: "Feed", id }
    }
}

// ============================================================================
// Refresh Report
// ============================================================================

/// What happened to one feed during a refresh batch.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// Fetched and stored; carries the number of new articles
    Updated(usize),
    /// Fetch, parse or persistence failed; the error is also stored on the feed
    Failed(SyncError),
    /// Explicitly targeted but disabled
    Disabled,
    /// Not started because the batch was cancelled
    Cancelled,
}

/// Serialized as `{"status": "updated", "new_articles": n}`,
/// `{"status": "failed", "error": "..."}`, `{"status": "disabled"}` or
/// `{"status": "cancelled"}`.
impl Serialize for RefreshOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RefreshOutcome::Updated(n) => {
                let mut state = serializer.serialize_struct("RefreshOutcome", 2)?;
                state.serialize_field("status", "updated")?;
                state.serialize_field("new_articles", n)?;
                state.end()
            }
            RefreshOutcome::Failed(e) => {
                let mut state = serializer.serialize_struct("RefreshOutcome", 2)?;
                state.serialize_field("status", "failed")?;
                state.serialize_field("error", &e.to_string())?;
                state.end()
            }
            RefreshOutcome::Disabled | RefreshOutcome::Cancelled => {
                let status = if matches!(self, RefreshOutcome::Disabled) {
                    "disabled"
                } else {
                    "cancelled"
                };
                let mut state = serializer.serialize_struct("RefreshOutcome", 1)?;
                state.serialize_field("status", status)?;
                state.end()
            }
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct FeedRefresh {
    pub feed_id: i64,
    pub title: String,
    pub outcome: RefreshOutcome,
}

impl FeedRefresh {
    fn new(feed: &Feed, outcome: RefreshOutcome) -> Self {
        Self {
            feed_id: feed.id,
            title: feed.title.clone(),
            outcome,
        }
    }
}

/// Per-feed outcomes of a refresh batch, in feed order.
#[derive(Debug, Default, serde::Serialize)]
pub struct RefreshReport {
    pub feeds: Vec<FeedRefresh>,
}

impl RefreshReport {
    /// Total new articles across the batch. Zero when every feed failed.
    pub fn new_articles(&self) -> usize {
        self.feeds
            .iter()
            .map(|f| match f.outcome {
                RefreshOutcome::Updated(n) => n,
                _ => 0,
            })
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&FeedRefresh, &SyncError)> {
        self.feeds.iter().filter_map(|f| match &f.outcome {
            RefreshOutcome::Failed(e) => Some((f, e)),
            _ => None,
        })
    }

    pub fn was_cancelled(&self) -> bool {
        self.feeds
            .iter()
            .any(|f| matches!(f.outcome, RefreshOutcome::Cancelled))
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The feed-sync engine.
///
/// Cheap to clone; clones share the database pool, HTTP client and
/// per-feed locks.
#[derive(Debug, Clone)]
pub struct FeedSync {
    db: Database,
    fetcher: Fetcher,
    config: Arc<Config>,
    locks: FeedLocks,
}

impl FeedSync {
    pub fn new(db: Database, fetcher: Fetcher, config: Config) -> Self {
        Self {
            db,
            fetcher,
            config: Arc::new(config),
            locks: FeedLocks::new(),
        }
    }

    /// Builds the engine with an HTTP client configured from `config`.
    pub fn from_config(db: Database, config: Config) -> Result<Self, SyncError> {
        let fetcher = Fetcher::from_config(&config)?;
        Ok(Self::new(db, fetcher, config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Subscribe / discover
    // ------------------------------------------------------------------------

    /// Subscribes to `url`.
    ///
    /// A URL serving a feed is subscribed directly. A URL serving an HTML
    /// page is scanned for feeds and the first validated candidate is
    /// subscribed. The new feed is refreshed right away; a failure of that
    /// first refresh is stored on the feed rather than returned.
    ///
    /// # Errors
    ///
    /// - [`SyncError::DuplicateFeed`] - URL (or discovered feed URL) already subscribed
    /// - [`SyncError::Fetch`] - URL rejected or not retrievable
    /// - [`SyncError::Parse`] - Non-HTML document that is not a feed
    /// - [`SyncError::NoFeedFound`] - HTML page without any valid feed
    pub async fn add_feed_by_url(&self, url: &str) -> Result<Feed, SyncError> {
        let url = self.normalize_url(url)?;
        self.ensure_not_subscribed(&url).await?;

        let doc = self.fetcher.fetch(&url).await?;
        match parse_document(&doc.body, None, Some(&doc.url)) {
            Ok(parsed) => self.subscribe_parsed(&url, parsed).await,
            Err(err @ ParseError::Unrecognized(_)) => {
                self.subscribe_discovered(&url, &doc, err).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn subscribe_parsed(&self, url: &str, parsed: ParsedFeed) -> Result<Feed, SyncError> {
        let feed = self
            .db
            .insert_feed(&NewFeed {
                url: url.to_owned(),
                title: parsed.title.clone(),
                description: parsed.description.clone(),
                site_url: parsed.site_url.clone(),
                image_url: parsed.image_url.clone(),
                format: parsed.format,
            })
            .await?;
        tracing::info!(feed_id = feed.id, url = %feed.url, format = %feed.format, "Subscribed to feed");

        let fetched_at = Utc::now().timestamp();
        if let Err(e) = self.ingest(&feed, parsed, fetched_at).await {
            self.record_failure(&feed, &e).await;
        }
        self.reload(feed.id).await
    }

    async fn subscribe_discovered(
        &self,
        url: &str,
        page: &FetchedDocument,
        parse_err: ParseError,
    ) -> Result<Feed, SyncError> {
        let candidates = discover_in_page(&self.fetcher, page).await;
        let Some(candidate) = candidates.into_iter().next() else {
            return Err(if page.is_html() {
                SyncError::NoFeedFound(url.to_owned())
            } else {
                SyncError::Parse(parse_err)
            });
        };

        self.ensure_not_subscribed(&candidate.url).await?;
        let feed = self
            .db
            .insert_feed(&NewFeed {
                url: candidate.url,
                title: candidate.title,
                description: candidate.description,
                site_url: candidate.site_url,
                image_url: None,
                format: candidate.format,
            })
            .await?;
        tracing::info!(feed_id = feed.id, url = %feed.url, page = %url, "Subscribed to discovered feed");

        if let Err(e) = self.refresh_one(&feed).await {
            self.record_failure(&feed, &e).await;
        }
        self.reload(feed.id).await
    }

    /// Lists the validated feeds a website advertises.
    pub async fn discover_feeds(&self, site_url: &str) -> Result<Vec<FeedCandidate>, SyncError> {
        Ok(discover_feeds(&self.fetcher, site_url).await?)
    }

    fn normalize_url(&self, input: &str) -> Result<String, SyncError> {
        let url = with_default_scheme(input.trim());
        let validated = self
            .fetcher
            .policy()
            .validate(&url)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        Ok(validated.to_string())
    }

    async fn ensure_not_subscribed(&self, url: &str) -> Result<(), SyncError> {
        if self.db.get_feed_by_url(url).await?.is_some() {
            return Err(SyncError::DuplicateFeed(url.to_owned()));
        }
        Ok(())
    }

    async fn reload(&self, feed_id: i64) -> Result<Feed, SyncError> {
        self.db
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| SyncError::feed_not_found(feed_id))
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    /// Refreshes one feed (`Some(id)`) or every enabled feed (`None`).
    ///
    /// # Errors
    ///
    /// Only caller-level failures: [`SyncError::NotFound`] for an unknown id,
    /// [`SyncError::Database`] when the feed list cannot be read. Per-feed
    /// failures are reported in the [`RefreshReport`].
    pub async fn refresh_feeds(&self, feed_id: Option<i64>) -> Result<RefreshReport, SyncError> {
        let (_tx, rx) = watch::channel(false);
        self.refresh_feeds_with_cancel(feed_id, rx).await
    }

    /// Like [`refresh_feeds`](Self::refresh_feeds), but stops starting new
    /// feeds once `cancel` reads `true`. Feeds already in flight finish or
    /// fail on their own; unstarted ones are reported as cancelled.
    pub async fn refresh_feeds_with_cancel(
        &self,
        feed_id: Option<i64>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RefreshReport, SyncError> {
        let feeds = match feed_id {
            Some(id) => {
                let feed = self
                    .db
                    .get_feed(id)
                    .await?
                    .ok_or_else(|| SyncError::feed_not_found(id))?;
                if !feed.enabled {
                    tracing::info!(feed_id = id, "Feed is disabled, skipping refresh");
                    return Ok(RefreshReport {
                        feeds: vec![FeedRefresh::new(&feed, RefreshOutcome::Disabled)],
                    });
                }
                vec![feed]
            }
            None => self.db.get_enabled_feeds().await?,
        };

        Ok(self.run_batch(feeds, cancel).await)
    }

    /// Refreshes enabled feeds whose refresh interval has elapsed.
    pub async fn refresh_due_feeds(&self) -> Result<RefreshReport, SyncError> {
        let (_tx, rx) = watch::channel(false);
        self.refresh_due_feeds_with_cancel(rx).await
    }

    pub async fn refresh_due_feeds_with_cancel(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<RefreshReport, SyncError> {
        let now = Utc::now().timestamp();
        let default_minutes = self.config.default_refresh_interval_minutes;
        let due: Vec<Feed> = self
            .db
            .get_enabled_feeds()
            .await?
            .into_iter()
            .filter(|feed| feed.is_due(now, default_minutes))
            .collect();
        tracing::debug!(due = due.len(), "Selected feeds due for refresh");

        Ok(self.run_batch(due, cancel).await)
    }

    async fn run_batch(&self, feeds: Vec<Feed>, cancel: watch::Receiver<bool>) -> RefreshReport {
        if feeds.is_empty() {
            return RefreshReport::default();
        }

        let total = feeds.len();
        let concurrency = self.config.max_concurrent_fetches.max(1);

        let mut results: Vec<(usize, FeedRefresh)> = stream::iter(feeds.into_iter().enumerate())
            .map(|(index, feed)| {
                let cancel = cancel.clone();
                async move {
                    // Checked when the feed gets a worker slot, not when queued
                    if *cancel.borrow() {
                        return (index, FeedRefresh::new(&feed, RefreshOutcome::Cancelled));
                    }
                    let outcome = match self.refresh_one(&feed).await {
                        Ok(new_articles) => RefreshOutcome::Updated(new_articles),
                        Err(e) => {
                            tracing::warn!(feed_id = feed.id, url = %feed.url, error = %e, "Feed refresh failed");
                            RefreshOutcome::Failed(e)
                        }
                    };
                    (index, FeedRefresh::new(&feed, outcome))
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        // Successful refreshes clear their error inside the refresh
        // transaction; failures are written in one statement here
        let failures: Vec<(i64, Option<String>)> = results
            .iter()
            .filter_map(|(_, r)| match &r.outcome {
                RefreshOutcome::Failed(e) => Some((r.feed_id, Some(e.to_string()))),
                _ => None,
            })
            .collect();
        if let Err(e) = self.db.batch_set_feed_errors(&failures).await {
            tracing::warn!(error = %e, "Failed to batch update feed error statuses");
        }

        let report = RefreshReport {
            feeds: results.into_iter().map(|(_, r)| r).collect(),
        };
        tracing::info!(
            feeds = total,
            failed = failures.len(),
            new_articles = report.new_articles(),
            cancelled = report.was_cancelled(),
            "Refresh batch finished"
        );
        report
    }

    /// Refreshes one feed and propagates any failure.
    pub async fn refresh_one(&self, feed: &Feed) -> Result<usize, SyncError> {
        let doc = self.fetcher.fetch(&feed.url).await?;
        let parsed = parse_document(&doc.body, Some(feed.format), Some(&doc.url))?;
        let fetched_at = Utc::now().timestamp();
        self.ingest(feed, parsed, fetched_at).await
    }

    /// Dedups and stores a parsed document under the feed's lock.
    async fn ingest(&self, feed: &Feed, parsed: ParsedFeed, now: i64) -> Result<usize, SyncError> {
        let metadata = FeedMetadata {
            format: Some(parsed.format),
            description: parsed.description,
            site_url: parsed.site_url,
            image_url: parsed.image_url,
        };

        // Relative item links resolve against the website once it is known
        let mut target = feed.clone();
        if target.site_url.is_none() {
            target.site_url = metadata.site_url.clone();
        }
        let items = parsed.items;

        let _guard = self.locks.lock(feed.id).await;
        let inserted = self
            .db
            .complete_feed_refresh(feed.id, &metadata, now, |existing| {
                select_new_articles(&target, items, existing, now)
            })
            .await?;

        tracing::info!(feed_id = feed.id, new_articles = inserted, "Feed refreshed");
        Ok(inserted)
    }

    async fn record_failure(&self, feed: &Feed, error: &SyncError) {
        tracing::warn!(feed_id = feed.id, url = %feed.url, error = %error, "Initial refresh failed");
        if let Err(e) = self.db.set_feed_error(feed.id, Some(&error.to_string())).await {
            tracing::warn!(feed_id = feed.id, error = %e, "Failed to store feed error");
        }
    }

    // ------------------------------------------------------------------------
    // Read state and feed management
    // ------------------------------------------------------------------------

    /// Marks an article read or unread. Returns the feed's new unread count.
    pub async fn set_article_read(&self, article_id: i64, read: bool) -> Result<i64, SyncError> {
        let article = self.db.get_article_by_id(article_id).await?.ok_or(
            SyncError::NotFound {
                entity: "Article",
                id: article_id,
            },
        )?;
        let _guard = self.locks.lock(article.feed_id).await;
        Ok(self.db.set_article_read(article_id, read).await?)
    }

    /// Marks every article of a feed read. Returns how many changed.
    pub async fn mark_feed_read(&self, feed_id: i64) -> Result<u64, SyncError> {
        let _guard = self.locks.lock(feed_id).await;
        Ok(self.db.mark_all_read_for_feed(feed_id).await?)
    }

    /// Unsubscribes from a feed and deletes its articles.
    pub async fn remove_feed(&self, feed_id: i64) -> Result<(), SyncError> {
        {
            let _guard = self.locks.lock(feed_id).await;
            self.db.delete_feed(feed_id).await?;
        }
        self.locks.forget(feed_id);
        tracing::info!(feed_id, "Removed feed");
        Ok(())
    }
}
