//! Maps parsed items onto new article records and filters out the ones a
//! feed already has.
//!
//! Identity is feed-scoped: articles of other feeds are never consulted,
//! even when they share a URL.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::discovery::resolve_url;
use super::parser::ParsedItem;
use crate::storage::{Feed, NewArticle};

/// The identity used to decide whether an incoming item is already known.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Feed-provided guid/id
    SourceId(String),
    /// Item link, used when the feed gives no id
    Link(String),
    /// Hash over title, summary and date when there is neither id nor link
    Synthesized(String),
}

impl DedupKey {
    /// Computes the key for an item whose link has already been resolved.
    pub fn for_item(item: &ParsedItem) -> Self {
        if let Some(id) = item.source_id.as_deref().map(str::trim) {
            if !id.is_empty() {
                return DedupKey::SourceId(id.to_owned());
            }
        }
        if let Some(link) = item.link.as_deref().map(str::trim) {
            if !link.is_empty() {
                return DedupKey::Link(link.to_owned());
            }
        }
        DedupKey::Synthesized(synthesize_id(item))
    }

    pub fn as_str(&self) -> &str {
        match self {
            DedupKey::SourceId(s) | DedupKey::Link(s) | DedupKey::Synthesized(s) => s,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            DedupKey::SourceId(s) | DedupKey::Link(s) | DedupKey::Synthesized(s) => s,
        }
    }
}

fn synthesize_id(item: &ParsedItem) -> String {
    // A fallback publish time changes on every fetch and must stay out of the hash
    let published = if item.published_is_fallback {
        String::new()
    } else {
        item.published.to_string()
    };
    let input = format!(
        "{}|{}|{}",
        item.title,
        item.summary.as_deref().unwrap_or(""),
        published
    );
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Identities of the articles a feed already holds.
#[derive(Debug, Default, Clone)]
pub struct ExistingArticles {
    source_ids: HashSet<String>,
    urls: HashSet<String>,
}

impl ExistingArticles {
    pub fn new<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<String>)>,
    {
        let mut existing = Self::default();
        for (source_id, url) in rows {
            existing.remember(source_id, url);
        }
        existing
    }

    pub fn len(&self) -> usize {
        self.source_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_ids.is_empty()
    }

    fn remember(&mut self, source_id: String, url: Option<String>) {
        self.source_ids.insert(source_id);
        if let Some(url) = url.filter(|u| !u.is_empty()) {
            self.urls.insert(url);
        }
    }

    /// Whether an item with `key` (and `url`) is already known.
    ///
    /// Link-keyed items also match an existing article with the same URL,
    /// whatever that article's own key is.
    pub fn contains(&self, key: &DedupKey, url: Option<&str>) -> bool {
        if self.source_ids.contains(key.as_str()) {
            return true;
        }
        match (key, url) {
            (DedupKey::Link(_), Some(url)) => self.urls.contains(url),
            _ => false,
        }
    }
}

/// Selects the items of `items` that are new to `feed` and maps them to
/// article records.
///
/// Relative item links are resolved against the feed's website URL, else
/// the feed URL. Items repeated within the document collapse to their
/// first occurrence. New articles carry `discovered_at = now` and start
/// unread, unbookmarked and without fetched content.
pub fn select_new_articles(
    feed: &Feed,
    items: Vec<ParsedItem>,
    existing: &ExistingArticles,
    now: i64,
) -> Vec<NewArticle> {
    let base = feed.site_url.as_deref().unwrap_or(&feed.url);
    let mut known = existing.clone();
    let mut fresh = Vec::new();

    for mut item in items {
        item.link = item
            .link
            .as_deref()
            .and_then(|link| resolve_url(link, base).or_else(|| Some(link.to_owned())));

        let key = DedupKey::for_item(&item);
        if known.contains(&key, item.link.as_deref()) {
            continue;
        }

        let source_id = key.into_string();
        known.remember(source_id.clone(), item.link.clone());

        fresh.push(NewArticle {
            feed_id: feed.id,
            source_id,
            title: item.title,
            summary: item.summary,
            content: item.content,
            url: item.link,
            published: item.published,
            discovered_at: now,
            authors: item.authors,
            categories: item.categories,
            lead_image_url: item.lead_image,
        });
    }

    fresh
}
