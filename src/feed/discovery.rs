use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

use super::fetcher::{FetchError, FetchedDocument, Fetcher};
use super::parser::{parse_document, FeedFormat, ParsedFeed};
use crate::util::{clean_label, with_default_scheme};

/// Candidate feeds validated concurrently per discovery run
const VALIDATION_CONCURRENCY: usize = 4;

/// Substrings in an anchor's href or text that suggest a feed
const FEED_HINTS: [&str; 3] = ["rss", "feed", "atom"];

/// A feed found on a website and confirmed to parse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedCandidate {
    pub title: String,
    /// URL of the feed document itself
    pub url: String,
    /// URL of the associated website, if known
    pub site_url: Option<String>,
    pub format: FeedFormat,
    pub description: Option<String>,
}

/// Errors that can occur during feed discovery.
///
/// Only the initial page is fatal; candidates that fail to fetch or parse
/// are dropped.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The provided URL failed validation
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// The page itself could not be fetched
    #[error("could not fetch page: {0}")]
    Fetch(#[from] FetchError),
}

/// A feed-looking link found in HTML, before validation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LinkCandidate {
    pub url: String,
    pub title: Option<String>,
    pub format: Option<FeedFormat>,
}

/// Discovers feeds advertised by a web page.
///
/// `https://` is assumed when `site_url` has no scheme. The page is
/// scanned for `<link rel="alternate">` feed links first, then for
/// anchors that look like feed links. Every candidate is fetched and
/// parsed; only those that parse are returned, in discovery order.
///
/// # Errors
///
/// [`DiscoveryError::InvalidUrl`] if the URL cannot be parsed or is
/// rejected by the fetcher's URL policy, [`DiscoveryError::Fetch`] if the
/// page cannot be retrieved.
pub async fn discover_feeds(
    fetcher: &Fetcher,
    site_url: &str,
) -> Result<Vec<FeedCandidate>, DiscoveryError> {
    let url = with_default_scheme(site_url);
    let page = fetcher.fetch(&url).await.map_err(|e| match e {
        FetchError::InvalidUrl(reason) => DiscoveryError::InvalidUrl(reason),
        other => DiscoveryError::Fetch(other),
    })?;

    Ok(discover_in_page(fetcher, &page).await)
}

/// Scans an already-fetched page and validates every feed link in it.
pub async fn discover_in_page(fetcher: &Fetcher, page: &FetchedDocument) -> Vec<FeedCandidate> {
    let links = find_feed_links(&page.body, &page.url);
    tracing::debug!(page = %page.url, links = links.len(), "Scanned page for feed links");

    let candidates: Vec<FeedCandidate> = stream::iter(links)
        .map(|link| async move {
            match validate_candidate(fetcher, &link).await {
                Ok(parsed) => Some(candidate_from(parsed, link, &page.url)),
                Err(reason) => {
                    tracing::debug!(url = %link.url, reason = %reason, "Discarding feed candidate");
                    None
                }
            }
        })
        .buffered(VALIDATION_CONCURRENCY)
        .filter_map(|candidate| async move { candidate })
        .collect()
        .await;

    tracing::info!(page = %page.url, found = candidates.len(), "Feed discovery finished");
    candidates
}

async fn validate_candidate(fetcher: &Fetcher, link: &LinkCandidate) -> Result<ParsedFeed, String> {
    let doc = fetcher.fetch(&link.url).await.map_err(|e| e.to_string())?;
    parse_document(&doc.body, link.format, Some(&doc.url)).map_err(|e| e.to_string())
}

fn candidate_from(parsed: ParsedFeed, link: LinkCandidate, page_url: &str) -> FeedCandidate {
    // A document-less title is less useful than the page's own label for the link
    let title = match link.title {
        Some(label) if parsed.title == "Untitled Feed" => label,
        _ => parsed.title,
    };

    FeedCandidate {
        title,
        site_url: parsed
            .site_url
            .filter(|site| site != &link.url)
            .or_else(|| Some(page_url.to_owned())),
        url: link.url,
        format: parsed.format,
        description: parsed.description,
    }
}

/// Collects feed links from HTML, `<link rel="alternate">` first.
///
/// Uses plain string scanning (no HTML parser dependency). Attribute order
/// and quoting style do not matter. URLs are resolved against `base_url`
/// and duplicates are dropped.
pub(crate) fn find_feed_links(html: &str, base_url: &str) -> Vec<LinkCandidate> {
    // ASCII lowercasing keeps byte offsets aligned with the original text
    let lower = html.to_ascii_lowercase();
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for (start, end) in tag_spans(&lower, "link") {
        let tag = &html[start..end];
        let rel_is_alternate = attr_value(tag, "rel")
            .map(|rel| {
                rel.split_whitespace()
                    .any(|r| r.eq_ignore_ascii_case("alternate"))
            })
            .unwrap_or(false);
        let Some(format) = attr_value(tag, "type").and_then(FeedFormat::from_mime) else {
            continue;
        };
        if !rel_is_alternate {
            continue;
        }
        let Some(url) = attr_value(tag, "href").and_then(|href| resolve_url(href, base_url))
        else {
            continue;
        };
        if seen.insert(url.clone()) {
            found.push(LinkCandidate {
                url,
                title: attr_value(tag, "title").and_then(clean_label),
                format: Some(format),
            });
        }
    }

    for (start, end) in tag_spans(&lower, "a") {
        let tag = &html[start..end];
        let Some(href) = attr_value(tag, "href") else {
            continue;
        };
        let text = anchor_text(html, &lower, end);
        if !looks_like_feed(href, &text) {
            continue;
        }
        let Some(url) = resolve_url(href, base_url) else {
            continue;
        };
        if seen.insert(url.clone()) {
            found.push(LinkCandidate {
                url,
                title: clean_label(&text),
                format: None,
            });
        }
    }

    found
}

/// Byte spans `[start, end)` of every opening tag named `name`.
fn tag_spans(lower: &str, name: &str) -> Vec<(usize, usize)> {
    let needle = format!("<{name}");
    let mut spans = Vec::new();
    let mut search_from = 0;

    while let Some(pos) = lower[search_from..].find(&needle) {
        let start = search_from + pos;
        let after = start + needle.len();
        // `<a` must not match `<abbr>` or `<article>`
        let boundary = lower[after..]
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(false);
        let Some(close) = lower[after..].find('>') else {
            break;
        };
        let end = after + close + 1;
        if boundary {
            spans.push((start, end));
        }
        search_from = end;
    }

    spans
}

/// Extracts an attribute value from a single tag (case-preserving).
///
/// Handles double, single and unquoted values; the name must be preceded
/// by whitespace so that `data-href` never matches `href`.
fn attr_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let lower = tag.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(pos) = lower[search_from..].find(name) {
        let start = search_from + pos;
        search_from = start + name.len();

        let preceded_by_space = lower[..start]
            .chars()
            .next_back()
            .map(char::is_whitespace)
            .unwrap_or(false);
        if !preceded_by_space {
            continue;
        }

        let rest = tag[start + name.len()..].trim_start();
        let Some(rest) = rest.strip_prefix('=') else {
            continue;
        };
        let rest = rest.trim_start();

        return match rest.chars().next()? {
            quote @ ('"' | '\'') => {
                let inner = &rest[1..];
                inner.find(quote).map(|end| inner[..end].trim())
            }
            _ => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(rest.len());
                Some(rest[..end].trim_end_matches('/'))
            }
        };
    }

    None
}

/// Visible text of an anchor whose opening tag ends at `tag_end`.
fn anchor_text(html: &str, lower: &str, tag_end: usize) -> String {
    let close = lower[tag_end..]
        .find("</a")
        .map(|p| tag_end + p)
        .unwrap_or(html.len());
    let inner = &html[tag_end..close];

    let mut text = String::with_capacity(inner.len());
    let mut in_tag = false;
    for c in inner.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text
}

fn looks_like_feed(href: &str, text: &str) -> bool {
    let href_lower = href.to_ascii_lowercase();
    if href_lower.starts_with("mailto:")
        || href_lower.starts_with("javascript:")
        || href_lower.starts_with('#')
    {
        return false;
    }
    let text_lower = text.to_lowercase();
    let path = href_lower.split(['?', '#']).next().unwrap_or("");

    FEED_HINTS
        .iter()
        .any(|hint| href_lower.contains(hint) || text_lower.contains(hint))
        || path.ends_with(".xml")
}

/// Resolves a possibly relative href against the page URL.
///
/// Returns `None` for hrefs that do not resolve to an http(s) URL.
pub(crate) fn resolve_url(href: &str, base_url: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let resolved = match url::Url::parse(base_url) {
        Ok(base) => base.join(href).ok()?,
        Err(_) => url::Url::parse(href).ok()?,
    };

    match resolved.scheme() {
        "http" | "https" => Some(resolved.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fetcher::FetchOptions;
    use crate::util::UrlPolicy;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS_WITH_METADATA: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Example Blog</title>
    <link>https://example.com</link>
    <description>An example blog about things</description>
    <item>
      <guid>1</guid>
      <title>First Post</title>
      <link>https://example.com/post/1</link>
    </item>
  </channel>
</rss>"#;

    const ATOM_FEED: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Atom</title>
  <entry><id>1</id><title>Entry</title><updated>2024-01-01T00:00:00Z</updated></entry>
</feed>"#;

    fn test_fetcher() -> Fetcher {
        Fetcher::new(
            reqwest::Client::new(),
            FetchOptions {
                max_retries: 0,
                ..FetchOptions::default()
            },
            UrlPolicy::permissive(),
        )
    }

    // --- HTML link discovery tests ---

    #[test]
    fn test_find_rss_link_in_html() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/feed.xml" title="RSS">
        </head><body></body></html>"#;
        let links = find_feed_links(html, "https://example.com");
        assert_eq!(
            links,
            vec![LinkCandidate {
                url: "https://example.com/feed.xml".to_owned(),
                title: Some("RSS".to_owned()),
                format: Some(FeedFormat::Rss),
            }]
        );
    }

    #[test]
    fn test_find_atom_and_json_links() {
        let html = r#"<head>
            <link rel="alternate" type="application/atom+xml" href="https://example.com/atom.xml">
            <link rel="alternate" type="application/feed+json" href="/feed.json">
        </head>"#;
        let links = find_feed_links(html, "https://example.com/");
        let formats: Vec<_> = links.iter().map(|l| l.format).collect();
        assert_eq!(
            formats,
            vec![Some(FeedFormat::Atom), Some(FeedFormat::Json)]
        );
        assert_eq!(links[1].url, "https://example.com/feed.json");
    }

    #[test]
    fn test_find_feed_link_reversed_attrs_and_quotes() {
        let html = r#"<LINK href='/rss' TYPE='application/rss+xml' rel='alternate'>"#;
        let links = find_feed_links(html, "https://example.com");
        assert_eq!(links[0].url, "https://example.com/rss");
    }

    #[test]
    fn test_stylesheet_and_non_alternate_links_ignored() {
        let html = r#"<head>
            <link rel="stylesheet" href="/style.css">
            <link rel="self" type="application/rss+xml" href="/self.xml">
        </head>"#;
        assert!(find_feed_links(html, "https://example.com").is_empty());
    }

    #[test]
    fn test_anchor_heuristics() {
        let html = r#"<body>
            <a href="/about">About</a>
            <a href="/subscribe">Subscribe via RSS</a>
            <a href="/posts/index.xml">Posts</a>
            <a href="mailto:feed@example.com">Mail</a>
            <abbr title="feed">x</abbr>
            <a data-href="/feed" href="/contact">Contact</a>
        </body>"#;
        let urls: Vec<_> = find_feed_links(html, "https://example.com/blog/")
            .into_iter()
            .map(|l| l.url)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/subscribe".to_owned(),
                "https://example.com/posts/index.xml".to_owned(),
            ]
        );
    }

    #[test]
    fn test_anchor_duplicate_of_link_tag_skipped() {
        let html = r#"<head>
            <link rel="alternate" type="application/rss+xml" href="/feed">
        </head><body><a href="https://example.com/feed">RSS</a></body>"#;
        let links = find_feed_links(html, "https://example.com");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].format, Some(FeedFormat::Rss));
    }

    #[test]
    fn test_anchor_text_with_nested_markup() {
        let html = r#"<a href="/x"><span>Atom</span> feed</a>"#;
        let links = find_feed_links(html, "https://example.com");
        assert_eq!(links[0].title.as_deref(), Some("Atom feed"));
    }

    #[test]
    fn test_attr_value_unquoted() {
        assert_eq!(
            attr_value("<link rel=alternate href=/feed.xml>", "href"),
            Some("/feed.xml")
        );
    }

    // --- URL resolution tests ---

    #[test]
    fn test_resolve_absolute_url() {
        assert_eq!(
            resolve_url("https://other.com/feed", "https://example.com"),
            Some("https://other.com/feed".to_owned())
        );
    }

    #[test]
    fn test_resolve_relative_url() {
        assert_eq!(
            resolve_url("/feed.xml", "https://example.com/page"),
            Some("https://example.com/feed.xml".to_owned())
        );
        assert_eq!(
            resolve_url("feed.xml", "https://example.com/blog/"),
            Some("https://example.com/blog/feed.xml".to_owned())
        );
    }

    #[test]
    fn test_resolve_protocol_relative() {
        assert_eq!(
            resolve_url("//cdn.example.com/feed", "https://example.com"),
            Some("https://cdn.example.com/feed".to_owned())
        );
    }

    #[test]
    fn test_resolve_normalizes_path() {
        let resolved = resolve_url("//evil.com/../../../etc/passwd", "https://example.com").unwrap();
        let parsed = url::Url::parse(&resolved).unwrap();
        assert_eq!(parsed.host_str(), Some("evil.com"));
        assert!(!parsed.path().contains(".."));
    }

    #[test]
    fn test_resolve_rejects_non_http() {
        assert_eq!(resolve_url("javascript:alert(1)", "https://example.com"), None);
        assert_eq!(resolve_url("", "https://example.com"), None);
    }

    // --- End-to-end discovery with wiremock ---

    #[tokio::test]
    async fn test_discover_validates_candidates() {
        let mock_server = MockServer::start().await;
        let page = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/feed.xml" title="Main">
            <link rel="alternate" type="application/atom+xml" href="/broken.xml">
        </head><body><a href="/atom">Atom</a></body></html>"#;

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page)
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS_WITH_METADATA))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.xml"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>not a feed</body></html>"),
            )
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/atom"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ATOM_FEED))
            .mount(&mock_server)
            .await;

        let candidates = discover_feeds(&test_fetcher(), &format!("{}/", mock_server.uri()))
            .await
            .unwrap();

        let urls: Vec<_> = candidates.iter().map(|c| c.url.clone()).collect();
        assert_eq!(
            urls,
            vec![
                format!("{}/feed.xml", mock_server.uri()),
                format!("{}/atom", mock_server.uri()),
            ]
        );
        assert_eq!(candidates[0].title, "Example Blog");
        assert_eq!(candidates[0].format, FeedFormat::Rss);
        assert_eq!(
            candidates[0].description.as_deref(),
            Some("An example blog about things")
        );
        assert_eq!(candidates[1].format, FeedFormat::Atom);
        assert_eq!(
            candidates[1].site_url.as_deref(),
            Some(format!("{}/", mock_server.uri()).as_str())
        );
    }

    #[tokio::test]
    async fn test_discover_page_without_feeds_is_empty() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>Just a page</body></html>")
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&mock_server)
            .await;

        let candidates = discover_feeds(&test_fetcher(), &mock_server.uri())
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_discover_page_fetch_failure_is_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let result = discover_feeds(&test_fetcher(), &mock_server.uri()).await;
        assert!(matches!(
            result,
            Err(DiscoveryError::Fetch(FetchError::HttpStatus(404)))
        ));
    }

    #[tokio::test]
    async fn test_discover_rejected_url_is_invalid() {
        let fetcher = Fetcher::new(
            reqwest::Client::new(),
            FetchOptions::default(),
            UrlPolicy::default(),
        );
        let result = discover_feeds(&fetcher, "http://192.168.1.1/blog").await;
        assert!(matches!(result, Err(DiscoveryError::InvalidUrl(_))));
    }
}
