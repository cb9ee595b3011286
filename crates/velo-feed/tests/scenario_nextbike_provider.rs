//! Scenario: Nextbike provider against a local HTTP mock.
//!
//! Every failure mode maps to a typed `FeedError` so the poller can skip the
//! tick; a good payload normalizes into a snapshot.

use std::time::Duration;

use chrono::Utc;
use httpmock::prelude::*;
use velo_feed::{normalize, FeedError, FeedProvider, NextbikeFeedProvider, NormalizeOptions};

const BODY: &str = r#"{"countries":[{"cities":[{"places":[
  {"uid":4001,"lat":51.05,"lng":13.74,"name":"Altmarkt","spot":true,
   "bike_list":[{"number":"93001"},{"number":"93002"}]},
  {"uid":4002,"lat":51.04,"lng":13.73,"name":"Postplatz","spot":true,"bike_list":[]},
  {"uid":9999,"lat":51.06,"lng":13.75,"name":"BIKE 93003","spot":false,
   "bike_list":[{"number":"93003"}]}
]}]}]}"#;

#[tokio::test]
async fn fetches_and_normalizes_live_payload() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/maps/nextbike-live.json");
            then.status(200)
                .header("content-type", "application/json")
                .body(BODY);
        })
        .await;

    let provider =
        NextbikeFeedProvider::new(server.url("/maps/nextbike-live.json"), Duration::from_secs(5))
            .unwrap();
    assert_eq!(provider.source_name(), "nextbike");

    let raw = provider.fetch().await.unwrap();
    mock.assert_async().await;

    let (snap, report) = normalize(&raw, Utc::now(), NormalizeOptions::default()).unwrap();
    assert_eq!(snap.stations.len(), 2);
    assert_eq!(snap.bike_count(), 2);
    assert_eq!(report.skipped_free_floating, 1);
}

#[tokio::test]
async fn non_success_status_is_http_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/feed");
            then.status(503).body("maintenance");
        })
        .await;

    let provider = NextbikeFeedProvider::new(server.url("/feed"), Duration::from_secs(5)).unwrap();
    match provider.fetch().await {
        Err(FeedError::Http { status }) => assert_eq!(status, 503),
        other => panic!("expected http error, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_body_is_decode_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/feed");
            then.status(200).body("<html>not json</html>");
        })
        .await;

    let provider = NextbikeFeedProvider::new(server.url("/feed"), Duration::from_secs(5)).unwrap();
    assert!(matches!(provider.fetch().await, Err(FeedError::Decode(_))));
}

#[tokio::test]
async fn slow_endpoint_times_out_as_transport_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/feed");
            then.status(200)
                .delay(Duration::from_millis(500))
                .body(BODY);
        })
        .await;

    let provider =
        NextbikeFeedProvider::new(server.url("/feed"), Duration::from_millis(50)).unwrap();
    assert!(matches!(provider.fetch().await, Err(FeedError::Transport(_))));
}

#[tokio::test]
async fn unreachable_endpoint_is_transport_error() {
    // Port 9 (discard) on localhost is expected to refuse connections.
    let provider =
        NextbikeFeedProvider::new("http://127.0.0.1:9/feed", Duration::from_secs(2)).unwrap();
    assert!(matches!(provider.fetch().await, Err(FeedError::Transport(_))));
}
