//! End-to-end refresh tests: HTTP (wiremock) → parser → dedup → SQLite.
//!
//! Every test gets its own mock server and in-memory database.

use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedsync::feed::{FeedFormat, FetchOptions, Fetcher};
use feedsync::storage::{Database, Feed, NewFeed};
use feedsync::util::UrlPolicy;
use feedsync::{Config, FeedSync, RefreshOutcome, SyncError};

// ============================================================================
// Helpers
// ============================================================================

async fn engine() -> FeedSync {
    let db = Database::open(":memory:").await.unwrap();
    let fetcher = Fetcher::new(
        reqwest::Client::new(),
        FetchOptions {
            max_retries: 0,
            retry_base_delay: Duration::ZERO,
            ..FetchOptions::default()
        },
        UrlPolicy::permissive(),
    );
    FeedSync::new(db, fetcher, Config::default())
}

/// RSS document with one item per (guid, link) pair.
fn rss(items: &[(&str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, link)| {
            format!(
                "<item><guid isPermaLink=\"false\">{guid}</guid><title>Item {guid}</title>\
                 <link>{link}</link><description>About {guid}</description>\
                 <pubDate>Mon, 01 Jan 2024 12:00:00 GMT</pubDate></item>"
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <rss version=\"2.0\"><channel><title>Test Feed</title>\
         <link>https://example.com/</link>{items}</channel></rss>"
    )
}

async fn serve(server: &MockServer, route: &str, body: String, content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.into_bytes(), content_type))
        .mount(server)
        .await;
}

async fn serve_rss(server: &MockServer, route: &str, items: &[(&str, &str)]) {
    serve(server, route, rss(items), "application/rss+xml").await;
}

async fn reload(engine: &FeedSync, feed: &Feed) -> Feed {
    engine.database().get_feed(feed.id).await.unwrap().unwrap()
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn test_second_refresh_of_unchanged_feed_inserts_nothing() {
    let server = MockServer::start().await;
    serve_rss(
        &server,
        "/feed.xml",
        &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
    )
    .await;
    let engine = engine().await;

    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    assert_eq!(feed.unread_count, 2);

    let report = engine.refresh_feeds(Some(feed.id)).await.unwrap();
    assert_eq!(report.new_articles(), 0);

    let articles = engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap();
    assert_eq!(articles.len(), 2);
    assert_eq!(reload(&engine, &feed).await.unread_count, 2);
}

#[tokio::test]
async fn test_only_new_item_is_inserted_and_counted() {
    let server = MockServer::start().await;
    serve_rss(
        &server,
        "/feed.xml",
        &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
    )
    .await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let before = reload(&engine, &feed).await.unread_count;

    server.reset().await;
    serve_rss(
        &server,
        "/feed.xml",
        &[
            ("a", "https://example.com/a"),
            ("b", "https://example.com/b"),
            ("c", "https://example.com/c"),
        ],
    )
    .await;

    let report = engine.refresh_feeds(Some(feed.id)).await.unwrap();
    assert_eq!(report.new_articles(), 1);
    assert_eq!(reload(&engine, &feed).await.unread_count, before + 1);

    let articles = engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap();
    let mut ids: Vec<_> = articles.iter().map(|a| a.source_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_source_id_match_survives_link_change() {
    let server = MockServer::start().await;
    serve_rss(&server, "/feed.xml", &[("a", "https://example.com/old")]).await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    server.reset().await;
    serve_rss(&server, "/feed.xml", &[("a", "https://example.com/new")]).await;

    let report = engine.refresh_feeds(Some(feed.id)).await.unwrap();
    assert_eq!(report.new_articles(), 0);

    // Existing articles are never rewritten
    let article = &engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap()[0];
    assert_eq!(article.url.as_deref(), Some("https://example.com/old"));
}

#[tokio::test]
async fn test_items_without_guid_dedup_by_link() {
    let server = MockServer::start().await;
    let doc = "<rss version=\"2.0\"><channel><title>No guids</title>\
               <item><title>One</title><link>https://example.com/1</link></item>\
               <item><title>Two</title><link>https://example.com/2</link></item>\
               </channel></rss>";
    serve(&server, "/feed.xml", doc.to_string(), "application/rss+xml").await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    assert_eq!(feed.unread_count, 2);

    let report = engine.refresh_feeds(Some(feed.id)).await.unwrap();
    assert_eq!(report.new_articles(), 0);

    let articles = engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap();
    assert!(articles
        .iter()
        .all(|a| a.url.as_deref() == Some(a.source_id.as_str())));
}

#[tokio::test]
async fn test_same_item_in_two_feeds_is_stored_for_both() {
    let server = MockServer::start().await;
    serve_rss(&server, "/one.xml", &[("shared", "https://example.com/shared")]).await;
    serve_rss(&server, "/two.xml", &[("shared", "https://example.com/shared")]).await;
    let engine = engine().await;

    let one = engine
        .add_feed_by_url(&format!("{}/one.xml", server.uri()))
        .await
        .unwrap();
    let two = engine
        .add_feed_by_url(&format!("{}/two.xml", server.uri()))
        .await
        .unwrap();

    assert_eq!(one.unread_count, 1);
    assert_eq!(two.unread_count, 1);
}

#[tokio::test]
async fn test_concurrent_refreshes_of_one_feed_insert_once() {
    let server = MockServer::start().await;
    serve_rss(
        &server,
        "/feed.xml",
        &[("a", "https://example.com/a"), ("b", "https://example.com/b")],
    )
    .await;
    let engine = engine().await;
    let feed = engine
        .database()
        .insert_feed(&feedsync::storage::NewFeed {
            url: format!("{}/feed.xml", server.uri()),
            title: "Pending".into(),
            description: None,
            site_url: None,
            image_url: None,
            format: feedsync::feed::FeedFormat::Rss,
        })
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        engine.refresh_feeds(Some(feed.id)),
        engine.refresh_feeds(Some(feed.id))
    );
    let total = first.unwrap().new_articles() + second.unwrap().new_articles();
    assert_eq!(total, 2);
    assert_eq!(reload(&engine, &feed).await.unread_count, 2);
}

// ============================================================================
// Batch behavior
// ============================================================================

#[tokio::test]
async fn test_failing_feed_does_not_abort_batch() {
    let server = MockServer::start().await;
    serve_rss(&server, "/one.xml", &[("1", "https://example.com/1")]).await;
    serve_rss(&server, "/two.xml", &[("2", "https://example.com/2")]).await;
    serve_rss(
        &server,
        "/three.xml",
        &[("3a", "https://example.com/3a"), ("3b", "https://example.com/3b")],
    )
    .await;

    let engine = engine().await;
    let mut feeds = Vec::new();
    for route in ["/one.xml", "/two.xml", "/three.xml"] {
        let feed = engine
            .add_feed_by_url(&format!("{}{}", server.uri(), route))
            .await
            .unwrap();
        feeds.push(feed);
    }

    // Upstream: one gains an item, two starts failing, three gains an item
    server.reset().await;
    serve_rss(
        &server,
        "/one.xml",
        &[("1", "https://example.com/1"), ("1b", "https://example.com/1b")],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/two.xml"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    serve_rss(
        &server,
        "/three.xml",
        &[
            ("3a", "https://example.com/3a"),
            ("3b", "https://example.com/3b"),
            ("3c", "https://example.com/3c"),
        ],
    )
    .await;

    let report = engine.refresh_feeds(None).await.unwrap();
    assert_eq!(report.feeds.len(), 3);
    assert_eq!(report.new_articles(), 2);

    let failed: Vec<i64> = report.failures().map(|(f, _)| f.feed_id).collect();
    assert_eq!(failed, vec![feeds[1].id]);

    let two = reload(&engine, &feeds[1]).await;
    assert!(two.last_error.as_deref().is_some_and(|e| !e.is_empty()));
    assert_eq!(two.unread_count, 1);

    assert_eq!(reload(&engine, &feeds[0]).await.last_error, None);
    assert_eq!(reload(&engine, &feeds[2]).await.unread_count, 3);
}

#[tokio::test]
async fn test_malformed_document_records_error() {
    let server = MockServer::start().await;
    serve_rss(&server, "/good.xml", &[("g", "https://example.com/g")]).await;
    serve_rss(&server, "/bad.xml", &[("x", "https://example.com/x")]).await;
    let engine = engine().await;
    let good = engine
        .add_feed_by_url(&format!("{}/good.xml", server.uri()))
        .await
        .unwrap();
    let bad = engine
        .add_feed_by_url(&format!("{}/bad.xml", server.uri()))
        .await
        .unwrap();

    server.reset().await;
    serve_rss(
        &server,
        "/good.xml",
        &[("g", "https://example.com/g"), ("h", "https://example.com/h")],
    )
    .await;
    serve(
        &server,
        "/bad.xml",
        "<?xml version=\"1.0\"?><nothing><here/></nothing>".to_string(),
        "application/xml",
    )
    .await;

    let report = engine.refresh_feeds(None).await.unwrap();
    assert_eq!(report.new_articles(), 1);

    let bad_outcome = report
        .feeds
        .iter()
        .find(|f| f.feed_id == bad.id)
        .unwrap();
    assert!(matches!(
        bad_outcome.outcome,
        RefreshOutcome::Failed(SyncError::Parse(_))
    ));

    let bad = reload(&engine, &bad).await;
    assert!(bad.last_error.is_some());
    assert_eq!(bad.unread_count, 1);
    assert_eq!(reload(&engine, &good).await.last_error, None);
}

#[tokio::test]
async fn test_every_feed_failing_still_returns_report() {
    let server = MockServer::start().await;
    serve_rss(&server, "/feed.xml", &[("a", "https://example.com/a")]).await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let report = engine.refresh_feeds(None).await.unwrap();
    assert_eq!(report.new_articles(), 0);
    assert_eq!(report.failures().count(), 1);
    assert!(reload(&engine, &feed)
        .await
        .last_error
        .unwrap()
        .contains("404"));
}

#[tokio::test]
async fn test_disabled_feeds_are_skipped() {
    let server = MockServer::start().await;
    serve_rss(&server, "/feed.xml", &[("a", "https://example.com/a")]).await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    engine
        .database()
        .set_feed_enabled(feed.id, false)
        .await
        .unwrap();

    let all = engine.refresh_feeds(None).await.unwrap();
    assert!(all.feeds.is_empty());

    let one = engine.refresh_feeds(Some(feed.id)).await.unwrap();
    assert!(matches!(one.feeds[0].outcome, RefreshOutcome::Disabled));
}

#[tokio::test]
async fn test_refresh_unknown_feed_is_not_found() {
    let engine = engine().await;
    let err = engine.refresh_feeds(Some(404)).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound { id: 404, .. }));
}

#[tokio::test]
async fn test_cancelled_batch_starts_no_feeds() {
    let server = MockServer::start().await;
    serve_rss(&server, "/feed.xml", &[("a", "https://example.com/a")]).await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let report = engine.refresh_feeds_with_cancel(None, rx).await.unwrap();

    assert!(report.was_cancelled());
    assert_eq!(report.new_articles(), 0);
    assert_eq!(reload(&engine, &feed).await.last_error, None);
}

#[tokio::test]
async fn test_due_feeds_skip_recently_fetched() {
    let server = MockServer::start().await;
    serve_rss(&server, "/feed.xml", &[("a", "https://example.com/a")]).await;
    let engine = engine().await;
    engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    // Just fetched during subscribe; default interval is an hour
    let report = engine.refresh_due_feeds().await.unwrap();
    assert!(report.feeds.is_empty());
}

#[tokio::test]
async fn test_failed_feed_is_not_due_again_until_interval_passes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    let engine = engine().await;
    let feed = engine
        .database()
        .insert_feed(&NewFeed {
            url: format!("{}/broken.xml", server.uri()),
            title: "Broken".into(),
            description: None,
            site_url: None,
            image_url: None,
            format: FeedFormat::Rss,
        })
        .await
        .unwrap();

    let first = engine.refresh_due_feeds().await.unwrap();
    assert_eq!(first.failures().count(), 1);

    let stored = reload(&engine, &feed).await;
    assert!(stored.last_error.is_some());
    assert_eq!(stored.last_fetched, None);
    assert!(stored.last_attempted.is_some());

    // Next tick, same hour: the failing feed is left alone
    let second = engine.refresh_due_feeds().await.unwrap();
    assert!(second.feeds.is_empty());
}

// ============================================================================
// Normalization through the pipeline
// ============================================================================

#[tokio::test]
async fn test_missing_publish_date_uses_ingest_time() {
    let server = MockServer::start().await;
    let doc = "<rss version=\"2.0\"><channel><title>Dates</title>\
               <item><guid>undated</guid><title>No date</title></item>\
               </channel></rss>";
    serve(&server, "/feed.xml", doc.to_string(), "application/rss+xml").await;
    let engine = engine().await;

    let before = chrono::Utc::now().timestamp();
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let after = chrono::Utc::now().timestamp();

    let article = &engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap()[0];
    assert!(article.published >= before && article.published <= after);
    assert!(article.discovered_at >= before && article.discovered_at <= after);
}

#[tokio::test]
async fn test_relative_links_are_made_absolute() {
    let server = MockServer::start().await;
    let doc = format!(
        "<rss version=\"2.0\"><channel><title>Relative</title>\
         <link>{}/</link>\
         <item><guid>r1</guid><title>Post</title><link>/posts/1</link></item>\
         </channel></rss>",
        server.uri()
    );
    serve(&server, "/feed.xml", doc, "application/rss+xml").await;
    let engine = engine().await;
    let feed = engine
        .add_feed_by_url(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();

    let article = &engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap()[0];
    assert_eq!(
        article.url.as_deref(),
        Some(format!("{}/posts/1", server.uri()).as_str())
    );
}

#[tokio::test]
async fn test_json_feed_is_ingested() {
    let server = MockServer::start().await;
    let doc = r#"{
        "version": "https://jsonfeed.org/version/1.1",
        "title": "JSON Example",
        "home_page_url": "https://example.org/",
        "items": [
            {"id": "j1", "url": "https://example.org/1", "title": "First",
             "content_html": "<p>Hi <img src=\"https://example.org/a.png\"></p>",
             "date_published": "2024-01-01T00:00:00Z"}
        ]
    }"#;
    serve(&server, "/feed.json", doc.to_string(), "application/feed+json").await;
    let engine = engine().await;

    let feed = engine
        .add_feed_by_url(&format!("{}/feed.json", server.uri()))
        .await
        .unwrap();
    assert_eq!(feed.format, feedsync::feed::FeedFormat::Json);
    assert_eq!(feed.title, "JSON Example");

    let article = &engine
        .database()
        .get_articles_for_feed(feed.id, None)
        .await
        .unwrap()[0];
    assert_eq!(article.source_id, "j1");
    assert_eq!(article.published, 1_704_067_200);
    assert_eq!(
        article.lead_image_url.as_deref(),
        Some("https://example.org/a.png")
    );
    assert!(!article.content_fetched);
}
