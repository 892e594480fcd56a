//! Feed retrieval and interpretation.
//!
//! - [`fetcher`] - HTTP GET with retries, size cap and charset decoding
//! - [`parser`] - RSS, Atom and JSON Feed documents via `feed-rs`
//! - [`discovery`] - Finding feeds linked from an HTML page
//! - [`normalize`] - Mapping items to articles and dropping known ones
//!
//! # Example
//!
//! ```ignore
//! use feedsync::feed::{parse_document, Fetcher};
//!
//! let doc = fetcher.fetch("https://example.com/feed.xml").await?;
//! let parsed = parse_document(&doc.body, None, Some(&doc.url))?;
//! ```

mod discovery;
mod fetcher;
mod normalize;
mod parser;

pub use discovery::{discover_feeds, discover_in_page, DiscoveryError, FeedCandidate};
pub use fetcher::{FetchError, FetchOptions, FetchedDocument, Fetcher};
pub use normalize::{select_new_articles, DedupKey, ExistingArticles};
pub use parser::{extract_lead_image, parse_document, FeedFormat, ParseError, ParsedFeed, ParsedItem};
