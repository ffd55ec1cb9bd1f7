//! End-to-end sync tests: a wiremock server plays the publisher, and the
//! coordinator fetches through the real HTTP source into an in-memory store.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tidings::config::SyncConfig;
use tidings::feed::HttpFeedSource;
use tidings::storage::Database;
use tidings::sync::{
    ChannelReporter, FeedStatus, ManualClock, SyncCoordinator, SyncEvent, SyncTrigger,
};
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NOW: i64 = 1_700_000_000;

fn rss(items: &[(&str, &str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(guid, title, description)| {
            format!(
                "<item><guid>{guid}</guid><title>{title}</title>\
                 <link>https://example.com/{guid}</link>\
                 <description>{description}</description></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Mock Feed</title><link>https://example.com</link><description>Test</description>
{items}
</channel></rss>"#
    )
}

fn podcast(guid: &str, audio_url: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Mock Podcast</title><link>https://example.com</link><description>Audio</description>
<item><guid>{guid}</guid><title>Episode</title>
<enclosure url="{audio_url}" length="4" type="audio/mpeg"/></item>
</channel></rss>"#
    )
}

fn config() -> SyncConfig {
    SyncConfig {
        min_wait_period: 2,
        max_wait_period: 16,
        retry_delay: 1,
        failure_alert_threshold: 2,
        ..SyncConfig::default()
    }
}

async fn coordinator(config: &SyncConfig) -> (SyncCoordinator, Database) {
    let db = Database::open(":memory:").await.unwrap();
    let source = HttpFeedSource::new(config)
        .unwrap()
        .with_retry_base(Duration::from_millis(1));
    let coordinator = SyncCoordinator::new(db.clone(), Arc::new(source), config)
        .with_clock(Arc::new(ManualClock::new(NOW)));
    (coordinator, db)
}

async fn serve(server: &MockServer, route: &str, body: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_subscribe_then_sync_over_http() {
    let server = MockServer::start().await;
    serve(
        &server,
        "/feed.xml",
        rss(&[("1", "One", "a"), ("2", "Two", "b"), ("3", "Three", "c")]),
    )
    .await;
    let url = format!("{}/feed.xml", server.uri());
    let (coordinator, db) = coordinator(&config()).await;

    let feed = coordinator.subscribe(&url).await.unwrap();
    assert_eq!(&*feed.title, "Mock Feed");
    assert_eq!(feed.unread_count, 3);
    assert_eq!(feed.wait_period, 2);

    // Nothing new upstream: unchanged, wait doubles
    let report = coordinator
        .run_session(SyncTrigger::Forced)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcomes[0].status, FeedStatus::Unchanged);
    assert_eq!(db.get_feed(feed.id).await.unwrap().unwrap().wait_period, 4);

    // One description edited, one item added
    serve(
        &server,
        "/feed.xml",
        rss(&[
            ("1", "One", "a"),
            ("2", "Two", "edited"),
            ("3", "Three", "c"),
            ("4", "Four", "d"),
        ]),
    )
    .await;
    let report = coordinator
        .run_session(SyncTrigger::Forced)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((report.articles_created, report.articles_updated), (1, 1));

    let stored = db.get_feed(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.wait_period, 2);
    assert_eq!(stored.unread_count, 4);
}

#[tokio::test]
async fn test_subscribe_failure_stores_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let (coordinator, db) = coordinator(&config()).await;

    let result = coordinator
        .subscribe(&format!("{}/missing.xml", server.uri()))
        .await;
    assert!(result.is_err());
    assert!(db.list_feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_server_errors_become_retry_and_alert() {
    let server = MockServer::start().await;
    serve(&server, "/feed.xml", rss(&[("1", "One", "a")])).await;
    let url = format!("{}/feed.xml", server.uri());
    let (coordinator, db) = coordinator(&config()).await;
    let feed = coordinator.subscribe(&url).await.unwrap();

    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let first = coordinator
        .run_session(SyncTrigger::Forced)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.feeds_failed, 1);
    assert!(first.alerts.is_empty());

    let stored = db.get_feed(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.wait_period, 2);
    assert_eq!(stored.remaining_wait, 1);
    assert_eq!(stored.unread_count, 1);

    let second = coordinator
        .run_session(SyncTrigger::Forced)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.alerts.len(), 1);
    assert_eq!(second.alerts[0].consecutive_failures, 2);
}

#[tokio::test]
async fn test_garbage_document_is_a_fetch_failure() {
    let server = MockServer::start().await;
    serve(&server, "/feed.xml", rss(&[("1", "One", "a")])).await;
    let url = format!("{}/feed.xml", server.uri());
    let (coordinator, db) = coordinator(&config()).await;
    let feed = coordinator.subscribe(&url).await.unwrap();

    serve(&server, "/feed.xml", "this is not a feed".to_string()).await;
    let report = coordinator
        .run_session(SyncTrigger::Forced)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.feeds_failed, 1);
    assert_eq!(db.articles_in_feed(feed.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reporter_sees_progress_and_finish() {
    let server = MockServer::start().await;
    serve(&server, "/feed.xml", rss(&[("1", "One", "a")])).await;
    let (tx, mut rx) = mpsc::channel(16);
    let config = config();
    let (coordinator, db) = coordinator(&config).await;
    let coordinator = coordinator.with_reporter(Arc::new(ChannelReporter::new(tx)));
    db.create_feed(&format!("{}/feed.xml", server.uri()), "", 2)
        .await
        .unwrap();

    coordinator.run_session(SyncTrigger::Manual).await.unwrap();

    assert_eq!(
        rx.recv().await,
        Some(SyncEvent::Started {
            trigger: SyncTrigger::Manual,
            total: 1
        })
    );
    match rx.recv().await {
        Some(SyncEvent::Progress { done, total, outcome }) => {
            assert_eq!((done, total), (1, 1));
            assert_eq!(outcome.status, FeedStatus::Changed);
        }
        other => panic!("expected progress, got {other:?}"),
    }
    match rx.recv().await {
        Some(SyncEvent::Finished(report)) => assert_eq!(report.articles_created, 1),
        other => panic!("expected finish, got {other:?}"),
    }
}

#[tokio::test]
async fn test_new_enclosures_are_downloaded_in_background() {
    let server = MockServer::start().await;
    let audio_url = format!("{}/episode.mp3", server.uri());
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(podcast("ep1", &audio_url)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/episode.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3\x04".to_vec()))
        .mount(&server)
        .await;

    let config = config();
    let db = Database::open(":memory:").await.unwrap();
    let source = Arc::new(HttpFeedSource::new(&config).unwrap());
    let coordinator = SyncCoordinator::new(db.clone(), source.clone(), &config)
        .with_enclosure_source(source);

    let feed = coordinator
        .subscribe(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    let article = db.find_article(feed.id, "ep1").await.unwrap().unwrap();

    let mut downloaded = None;
    for _ in 0..50 {
        let enclosures = db.enclosures_for_article(article.id).await.unwrap();
        if enclosures.iter().all(|e| e.downloaded) {
            downloaded = Some(enclosures);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let enclosures = downloaded.expect("enclosure download never finished");
    assert_eq!(enclosures.len(), 1);
    assert_eq!(enclosures[0].data.as_deref(), Some(&b"ID3\x04"[..]));
}

#[tokio::test]
async fn test_guidless_items_are_not_duplicated_across_fetches() {
    let server = MockServer::start().await;
    let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>No Guids</title><link>https://example.com</link><description>Test</description>
<item><title>Only a title</title><description>body</description></item>
<item><title>Linked</title><link>https://example.com/linked</link></item>
<item><description>nothing to identify</description></item>
</channel></rss>"#;
    serve(&server, "/feed.xml", body.to_string()).await;
    let (coordinator, db) = coordinator(&config()).await;
    let feed = coordinator
        .subscribe(&format!("{}/feed.xml", server.uri()))
        .await
        .unwrap();
    assert_eq!(db.articles_in_feed(feed.id).await.unwrap().len(), 2);

    let report = coordinator
        .run_session(SyncTrigger::Forced)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((report.articles_created, report.articles_updated), (0, 0));
    assert_eq!(report.decode_warnings, 1);
    assert_eq!(report.outcomes[0].status, FeedStatus::Unchanged);
    assert_eq!(db.articles_in_feed(feed.id).await.unwrap().len(), 2);
}
