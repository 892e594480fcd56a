use feed_rs::model::{self, FeedType};
use feed_rs::parser;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

use crate::util::{clean_label, strip_control_chars};

const UNTITLED_FEED: &str = "Untitled Feed";
const UNTITLED_ITEM: &str = "Untitled";

static IMG_SRC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("valid img regex")
});

/// Syndication format of a feed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    Rss,
    Atom,
    Json,
}

/// Errors produced while turning a payload into a [`ParsedFeed`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// No feed root could be located and no format hint was supplied
    #[error("unrecognized document: {0}")]
    Unrecognized(String),
    /// The document looked like a feed but could not be parsed
    #[error("malformed {format} document: {reason}")]
    Malformed { format: FeedFormat, reason: String },
}

impl FeedFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedFormat::Rss => "rss",
            FeedFormat::Atom => "atom",
            FeedFormat::Json => "json",
        }
    }

    /// Guesses the format from the payload structure.
    ///
    /// A JSON object is a JSON Feed; an XML document is classified by its
    /// root element (`rss` / `rdf:RDF` versus `feed`). Anything else,
    /// including HTML pages, yields `None`.
    pub fn sniff(payload: &str) -> Option<FeedFormat> {
        let trimmed = payload.trim_start_matches('\u{feff}').trim_start();
        match trimmed.as_bytes().first()? {
            b'{' => Some(FeedFormat::Json),
            b'<' => match root_element_name(trimmed)?.as_str() {
                "rss" | "rdf" => Some(FeedFormat::Rss),
                "feed" => Some(FeedFormat::Atom),
                _ => None,
            },
            _ => None,
        }
    }

    /// Maps a MIME type from a `<link type=...>` or `Content-Type` header.
    pub fn from_mime(mime: &str) -> Option<FeedFormat> {
        let mime = mime.trim().to_ascii_lowercase();
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence {
            "application/rss+xml" | "application/rdf+xml" => Some(FeedFormat::Rss),
            "application/atom+xml" => Some(FeedFormat::Atom),
            "application/feed+json" | "application/json" => Some(FeedFormat::Json),
            _ => None,
        }
    }

    fn from_feed_type(feed_type: &FeedType) -> FeedFormat {
        match feed_type {
            FeedType::Atom => FeedFormat::Atom,
            FeedType::JSON => FeedFormat::Json,
            FeedType::RSS0 | FeedType::RSS1 | FeedType::RSS2 => FeedFormat::Rss,
        }
    }

    /// Parses a payload believed to be in this format.
    ///
    /// `base_url` resolves relative links inside the document.
    pub fn parse(self, payload: &str, base_url: Option<&str>) -> Result<ParsedFeed, ParseError> {
        // Item ids are left empty when the document has none, so that the
        // normalizer can fall back to the link rather than a parser hash.
        let parser = parser::Builder::new()
            .base_uri(base_url)
            .id_generator(|_, _, _| String::new())
            .build();

        let feed = parser
            .parse(without_xml_declaration(payload).as_bytes())
            .map_err(|e| ParseError::Malformed {
                format: self,
                reason: e.to_string(),
            })?;

        let format = FeedFormat::from_feed_type(&feed.feed_type);
        if format != self {
            tracing::debug!(
                expected = %self,
                actual = %format,
                "Feed format differs from detected format"
            );
        }

        Ok(ParsedFeed::from_model(format, feed))
    }
}

impl fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rss" => Ok(FeedFormat::Rss),
            "atom" => Ok(FeedFormat::Atom),
            "json" => Ok(FeedFormat::Json),
            other => Err(format!("unknown feed format: {other}")),
        }
    }
}

/// Feed-level data and items extracted from one document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    /// Link to the website the feed belongs to
    pub site_url: Option<String>,
    pub items: Vec<ParsedItem>,
}

/// One entry of a feed, before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    /// Unix seconds. Set to the parse time when the document has no usable date.
    pub published: i64,
    pub published_is_fallback: bool,
    /// Feed-provided guid/id, if any
    pub source_id: Option<String>,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub lead_image: Option<String>,
}

/// Parses a feed document, auto-detecting its format.
///
/// The payload structure decides the format. A document whose root element
/// is not a feed (an HTML page, say) is rejected as
/// [`ParseError::Unrecognized`]; `hint` is consulted only when no root can
/// be identified at all.
pub fn parse_document(
    payload: &str,
    hint: Option<FeedFormat>,
    base_url: Option<&str>,
) -> Result<ParsedFeed, ParseError> {
    if let Some(format) = FeedFormat::sniff(payload) {
        return format.parse(payload, base_url);
    }

    let trimmed = payload.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with('<') {
        if let Some(root) = root_element_name(trimmed) {
            return Err(ParseError::Unrecognized(format!(
                "root element <{root}> is not a feed"
            )));
        }
    }

    match hint {
        Some(format) => format.parse(payload, base_url),
        None => Err(ParseError::Unrecognized(
            "no feed root element found".to_string(),
        )),
    }
}

impl ParsedFeed {
    fn from_model(format: FeedFormat, feed: model::Feed) -> Self {
        let now = chrono::Utc::now().timestamp();

        let title = feed
            .title
            .as_ref()
            .and_then(|t| clean_label(&t.content))
            .unwrap_or_else(|| UNTITLED_FEED.to_owned());

        let description = feed
            .description
            .map(|d| strip_control_chars(d.content.trim()).into_owned())
            .filter(|d| !d.is_empty());

        let image_url = feed.logo.or(feed.icon).map(|image| image.uri);

        let site_url = feed
            .links
            .iter()
            .find(|link| link.rel.as_deref() == Some("alternate"))
            .or_else(|| feed.links.iter().find(|link| link.rel.is_none()))
            .map(|link| link.href.clone());

        let items = feed
            .entries
            .into_iter()
            .map(|entry| ParsedItem::from_entry(entry, now))
            .collect();

        Self {
            format,
            title,
            description,
            image_url,
            site_url,
            items,
        }
    }
}

impl ParsedItem {
    fn from_entry(entry: model::Entry, now: i64) -> Self {
        let link = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| entry.links.first())
            .map(|l| l.href.trim().to_owned())
            .filter(|href| !href.is_empty());

        let (published, published_is_fallback) = match entry.published.or(entry.updated) {
            Some(dt) => (dt.timestamp(), false),
            None => (now, true),
        };

        let content = entry
            .content
            .and_then(|c| c.body)
            .filter(|body| !body.trim().is_empty());

        let summary = entry
            .summary
            .map(|s| s.content)
            .filter(|s| !s.trim().is_empty())
            .or_else(|| content.clone());

        let title = entry
            .title
            .as_ref()
            .and_then(|t| clean_label(&t.content))
            .unwrap_or_else(|| UNTITLED_ITEM.to_owned());

        let source_id = Some(entry.id.trim().to_owned()).filter(|id| !id.is_empty());

        let authors = entry
            .authors
            .into_iter()
            .filter_map(|person| clean_label(&person.name))
            .collect();

        let categories = entry
            .categories
            .into_iter()
            .filter_map(|category| {
                let label = category.label.as_deref().unwrap_or(&category.term);
                clean_label(label)
            })
            .collect();

        let thumbnail = entry
            .media
            .iter()
            .flat_map(|media| media.thumbnails.iter())
            .map(|thumb| thumb.image.uri.clone())
            .find(|uri| !uri.is_empty());

        let lead_image = thumbnail.or_else(|| {
            content
                .as_deref()
                .and_then(extract_lead_image)
                .or_else(|| summary.as_deref().and_then(extract_lead_image))
        });

        Self {
            title,
            summary,
            content,
            link,
            published,
            published_is_fallback,
            source_id,
            authors,
            categories,
            lead_image,
        }
    }
}

/// Returns the `src` of the first `<img>` tag in an HTML fragment.
pub fn extract_lead_image(html: &str) -> Option<String> {
    IMG_SRC
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_owned())
        .filter(|src| !src.is_empty() && !src.starts_with("data:"))
}

/// Drops a leading `<?xml ...?>` declaration.
///
/// Payloads reach the parser already decoded to UTF-8, so an `encoding`
/// attribute naming a legacy charset would be wrong if honored again.
fn without_xml_declaration(payload: &str) -> &str {
    let trimmed = payload.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    trimmed
}

/// Name of the first element in an XML/HTML document, lowercased and
/// without namespace prefix. Skips the XML declaration, comments and
/// doctype.
fn root_element_name(doc: &str) -> Option<String> {
    let mut rest = doc;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if let Some(after) = rest.strip_prefix("!--") {
            rest = &after[after.find("-->")? + 3..];
            continue;
        }
        if rest.starts_with('?') || rest.starts_with('!') {
            rest = &rest[rest.find('>')? + 1..];
            continue;
        }
        let name: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '>' && *c != '/')
            .collect();
        if name.is_empty() {
            return None;
        }
        let local = name.rsplit(':').next().unwrap_or(&name);
        return Some(local.to_ascii_lowercase());
    }
}
