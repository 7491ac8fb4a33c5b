//! Integration tests for the HTTP client and the per-item retry loop.
//!
//! These tests run against wiremock servers on localhost.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use shardfetch::download::{
    DISALLOWED_MESSAGE, DownloadError, HttpClient, ItemFetcher, fetch_with_retry,
};
use shardfetch::user_agent::download_user_agent;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

fn directives(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(ToString::to_string).collect()
}

fn client(token: Option<&str>, disallowed: &[&str]) -> HttpClient {
    HttpClient::new(
        Duration::from_secs(5),
        token.map(ToString::to_string),
        directives(disallowed),
    )
    .expect("client should build")
}

#[tokio::test]
async fn test_fetch_returns_body() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/cat.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg bytes".to_vec()))
        .mount(&mock_server)
        .await;

    let body = client(None, &[])
        .fetch(&format!("{}/cat.jpg", mock_server.uri()))
        .await
        .expect("fetch should succeed");

    assert_eq!(&body[..], b"jpeg bytes");
}

#[tokio::test]
async fn test_fetch_error_status_has_code_and_reason() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let err = client(None, &[])
        .fetch(&format!("{}/missing.jpg", mock_server.uri()))
        .await
        .expect_err("404 should fail");

    assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    assert_eq!(err.to_string(), "HTTP Error 404: Not Found");
}

#[tokio::test]
async fn test_unscoped_noai_header_disallows_for_any_token() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/guarded.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Robots-Tag", "noai")
                .set_body_bytes(b"jpeg bytes".to_vec()),
        )
        .mount(&mock_server)
        .await;
    let url = format!("{}/guarded.jpg", mock_server.uri());

    for token in [None, Some("mybot")] {
        let err = client(token, &["noai"])
            .fetch(&url)
            .await
            .expect_err("noai should disallow");
        assert!(matches!(err, DownloadError::Disallowed { .. }));
        assert_eq!(err.to_string(), DISALLOWED_MESSAGE);
    }
}

#[tokio::test]
async fn test_directive_scoped_to_other_bot_is_ignored() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/scoped.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Robots-Tag", "otherbot: noai")
                .set_body_bytes(b"jpeg bytes".to_vec()),
        )
        .mount(&mock_server)
        .await;

    let result = client(Some("mybot"), &["noai"])
        .fetch(&format!("{}/scoped.jpg", mock_server.uri()))
        .await;

    assert!(result.is_ok(), "scoped directive should not apply: {result:?}");
}

#[tokio::test]
async fn test_empty_disallow_set_ignores_directives() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/guarded.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Robots-Tag", "noai, noindex")
                .set_body_bytes(b"jpeg bytes".to_vec()),
        )
        .mount(&mock_server)
        .await;

    let result = client(None, &[])
        .fetch(&format!("{}/guarded.jpg", mock_server.uri()))
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn test_user_agent_announces_token() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ua.jpg"))
        .and(header("user-agent", download_user_agent(Some("mybot")).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&mock_server)
        .await;

    let result = client(Some("mybot"), &[])
        .fetch(&format!("{}/ua.jpg", mock_server.uri()))
        .await;

    assert!(result.is_ok(), "request should carry the token user agent: {result:?}");
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/slow.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(2))
                .set_body_bytes(b"late".to_vec()),
        )
        .mount(&mock_server)
        .await;

    let client = HttpClient::new(Duration::from_millis(200), None, BTreeSet::new())
        .expect("client should build");
    let err = client
        .fetch(&format!("{}/slow.jpg", mock_server.uri()))
        .await
        .expect_err("request should time out");

    assert!(matches!(err, DownloadError::Timeout { .. }));
    assert_eq!(err.to_string(), "The read operation timed out");
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failure() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second time".to_vec()))
        .mount(&mock_server)
        .await;

    let mut fetcher = ItemFetcher::new(Arc::new(client(None, &[])), None, 0);
    let outcome = fetch_with_retry(
        &mut fetcher,
        4,
        &format!("{}/flaky.jpg", mock_server.uri()),
        2,
    )
    .await;

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.payload.as_deref(), Some(&b"second time"[..]));
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn test_retry_budget_exhausted_keeps_last_error() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(410))
        .expect(3)
        .mount(&mock_server)
        .await;

    let mut fetcher = ItemFetcher::new(Arc::new(client(None, &[])), None, 0);
    let outcome = fetch_with_retry(
        &mut fetcher,
        0,
        &format!("{}/gone.jpg", mock_server.uri()),
        2,
    )
    .await;

    assert!(outcome.payload.is_none());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.error.as_deref(), Some("HTTP Error 410: Gone"));
}
