//! Feed-sync engine for RSS, Atom and JSON feeds.
//!
//! Fetches feed documents, parses them into a common shape, discovers feeds
//! linked from web pages, drops articles a feed already has and keeps each
//! feed's unread count exact. State lives in SQLite.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::Config;
pub use storage::Database;
pub use sync::{FeedSync, RefreshOutcome, RefreshReport, SyncError};
