use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use feedsync::storage::{Database, DatabaseError};
use feedsync::{Config, FeedSync, RefreshOutcome, RefreshReport};

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("feedsync");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(name = "feedsync", version, about = "Fetch, dedup and refresh RSS/Atom/JSON feeds")]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database (default: ~/.config/feedsync/feeds.db)
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed URL, or to the first feed a website links to
    Add { url: String },
    /// List the feeds a website advertises
    Discover { url: String },
    /// Refresh all enabled feeds, or one feed
    Refresh {
        #[arg(long, value_name = "ID")]
        feed: Option<i64>,
    },
    /// List subscribed feeds with unread counts
    List,
    /// List the newest articles of a feed
    Articles {
        feed_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Mark an article read (or unread with --unread)
    Read {
        article_id: i64,
        #[arg(long)]
        unread: bool,
    },
    /// Mark every article of a feed read
    ReadAll { feed_id: i64 },
    /// Toggle an article's bookmark
    Bookmark { article_id: i64 },
    /// List bookmarked articles across feeds
    Bookmarks,
    /// Enable a feed for refresh
    Enable { feed_id: i64 },
    /// Exclude a feed from refresh
    Disable { feed_id: i64 },
    /// Set a feed's refresh interval in minutes (omit to use the default)
    Interval { feed_id: i64, minutes: Option<i64> },
    /// Unsubscribe from a feed and delete its articles
    Remove { feed_id: i64 },
    /// Refresh due feeds periodically until interrupted
    Watch {
        /// Seconds between due-feed checks
        #[arg(long, default_value_t = 60)]
        tick_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // Config directory holds the database; keep it user-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .db
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("feeds.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: The feed database is in use by another process. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let engine = FeedSync::from_config(db, config).context("Failed to create HTTP client")?;
    run(&engine, args.command, args.json).await
}

async fn run(engine: &FeedSync, command: Command, json: bool) -> Result<()> {
    let db = engine.database();

    match command {
        Command::Add { url } => {
            let feed = engine.add_feed_by_url(&url).await?;
            if json {
                print_json(&feed)?;
            } else {
                println!(
                    "Subscribed to \"{}\" ({}) as feed {}, {} unread",
                    feed.title, feed.url, feed.id, feed.unread_count
                );
                if let Some(error) = &feed.last_error {
                    println!("  first refresh failed: {error}");
                }
            }
        }
        Command::Discover { url } => {
            let candidates = engine.discover_feeds(&url).await?;
            if json {
                print_json(&candidates)?;
            } else if candidates.is_empty() {
                println!("No feeds found at {url}");
            } else {
                for candidate in candidates {
                    println!("[{}] {}  {}", candidate.format, candidate.title, candidate.url);
                }
            }
        }
        Command::Refresh { feed } => {
            let report = engine.refresh_feeds(feed).await?;
            print_report(&report, json)?;
        }
        Command::List => {
            let feeds = db.get_feeds().await.context("Failed to load feeds")?;
            if json {
                print_json(&feeds)?;
            } else {
                for feed in feeds {
                    let status = if !feed.enabled {
                        " (disabled)"
                    } else if feed.last_error.is_some() {
                        " (error)"
                    } else {
                        ""
                    };
                    println!(
                        "{:>5}  {:>4} unread  {}{}  {}",
                        feed.id, feed.unread_count, feed.title, status, feed.url
                    );
                }
            }
        }
        Command::Articles { feed_id, limit } => {
            let articles = db
                .get_articles_for_feed(feed_id, Some(limit))
                .await
                .context("Failed to load articles")?;
            if json {
                print_json(&articles)?;
            } else {
                for article in articles {
                    let published = Utc
                        .timestamp_opt(article.published, 0)
                        .single()
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default();
                    let marker = if article.read { ' ' } else { '*' };
                    println!("{:>6} {marker} {published}  {}", article.id, article.title);
                }
            }
        }
        Command::Read { article_id, unread } => {
            let remaining = engine.set_article_read(article_id, !unread).await?;
            if json {
                print_json(&json!({
                    "article_id": article_id,
                    "read": !unread,
                    "feed_unread_count": remaining,
                }))?;
            } else {
                let state = if unread { "unread" } else { "read" };
                println!("Article {article_id} marked {state}; {remaining} unread in feed");
            }
        }
        Command::ReadAll { feed_id } => {
            let changed = engine.mark_feed_read(feed_id).await?;
            if json {
                print_json(&json!({ "feed_id": feed_id, "marked_read": changed }))?;
            } else {
                println!("Marked {changed} articles read");
            }
        }
        Command::Bookmark { article_id } => {
            let bookmarked = db.toggle_article_bookmarked(article_id).await?;
            if json {
                print_json(&json!({ "article_id": article_id, "bookmarked": bookmarked }))?;
            } else {
                println!(
                    "Article {article_id} {}",
                    if bookmarked { "bookmarked" } else { "unbookmarked" }
                );
            }
        }
        Command::Bookmarks => {
            let articles = db
                .get_bookmarked_articles()
                .await
                .context("Failed to load bookmarks")?;
            if json {
                print_json(&articles)?;
            } else {
                for article in articles {
                    println!(
                        "{:>6}  {}  {}",
                        article.id,
                        article.title,
                        article.url.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Command::Enable { feed_id } => {
            db.set_feed_enabled(feed_id, true).await?;
            print_feed_change(db, feed_id, json, "enabled").await?;
        }
        Command::Disable { feed_id } => {
            db.set_feed_enabled(feed_id, false).await?;
            print_feed_change(db, feed_id, json, "disabled").await?;
        }
        Command::Interval { feed_id, minutes } => {
            db.set_feed_refresh_interval(feed_id, minutes).await?;
            if json {
                print_feed_change(db, feed_id, true, "").await?;
            } else {
                match minutes {
                    Some(m) => println!("Feed {feed_id} refreshes every {m} minutes"),
                    None => println!("Feed {feed_id} uses the default refresh interval"),
                }
            }
        }
        Command::Remove { feed_id } => {
            engine.remove_feed(feed_id).await?;
            if json {
                print_json(&json!({ "feed_id": feed_id, "removed": true }))?;
            } else {
                println!("Feed {feed_id} removed");
            }
        }
        Command::Watch { tick_secs } => {
            watch_loop(engine, Duration::from_secs(tick_secs.max(1)), json).await?;
        }
    }

    Ok(())
}

/// Refreshes due feeds every `tick` until Ctrl-C.
///
/// Ctrl-C stops new feeds from starting; feeds already in flight finish.
async fn watch_loop(engine: &FeedSync, tick: Duration, json: bool) -> Result<()> {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing in-flight refreshes");
            let _ = cancel_tx.send(true);
        }
    });

    tracing::info!(tick_secs = tick.as_secs(), "Watching feeds");
    loop {
        let report = engine
            .refresh_due_feeds_with_cancel(cancel_rx.clone())
            .await?;
        if !report.feeds.is_empty() {
            print_report(&report, json)?;
        }
        if *cancel_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = cancel_rx.changed() => break,
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints the feed after a settings change: the whole row as JSON, or a
/// one-line confirmation.
async fn print_feed_change(db: &Database, feed_id: i64, json: bool, what: &str) -> Result<()> {
    if json {
        let feed = db
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Feed {feed_id} not found"))?;
        print_json(&feed)
    } else {
        println!("Feed {feed_id} {what}");
        Ok(())
    }
}

fn print_report(report: &RefreshReport, json: bool) -> Result<()> {
    if json {
        // One compact object per batch so `watch --json` emits JSON lines
        println!(
            "{}",
            serde_json::to_string(&json!({
                "new_articles": report.new_articles(),
                "failed": report.failures().count(),
                "feeds": &report.feeds,
            }))?
        );
        return Ok(());
    }
    for feed in &report.feeds {
        match &feed.outcome {
            RefreshOutcome::Updated(n) => println!("  {:<40} {n} new", feed.title),
            RefreshOutcome::Failed(e) => println!("  {:<40} failed: {e}", feed.title),
            RefreshOutcome::Disabled => println!("  {:<40} disabled, skipped", feed.title),
            RefreshOutcome::Cancelled => println!("  {:<40} cancelled", feed.title),
        }
    }
    println!(
        "{} new articles from {} feeds ({} failed)",
        report.new_articles(),
        report.feeds.len(),
        report.failures().count()
    );
    Ok(())
}
