//! Integration tests for the reqwest transport and session pool.
//!
//! These tests use wiremock to stand in for news sites.

use std::time::Duration;

use tidings_client::{SessionConfig, SessionPool};
use tidings_core::error::AppError;
use tidings_core::models::{DiscoveryMethod, SourceDescriptor};
use tidings_core::traits::{Transport, TransportProvider};
use tidings_core::{EngineConfig, Services, SourceFactory, SourceRegistry};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn pool(agent: &str) -> SessionPool {
    SessionPool::new(SessionConfig {
        user_agents: vec![agent.to_string()],
        ..Default::default()
    })
    .expect("valid session config")
}

#[tokio::test]
async fn test_any_status_is_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<rss/>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let transport = pool("tidings-test").session("bbc").unwrap();

    let ok = transport
        .get(&format!("{}/feed.xml", server.uri()), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body, "<rss/>");
    assert!(ok.is_success());

    let missing = transport
        .get(&format!("{}/missing", server.uri()), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn test_retry_after_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "10"))
        .mount(&server)
        .await;

    let transport = pool("tidings-test").session("bbc").unwrap();
    let response = transport.get(&server.uri(), TIMEOUT).await.unwrap();

    assert_eq!(response.status, 429);
    assert_eq!(response.retry_after, Some(Duration::from_secs(10)));
}

#[tokio::test]
async fn test_session_sends_its_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("user-agent", "agent-under-test"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = pool("agent-under-test").session("npr").unwrap();
    let response = transport.get(&server.uri(), TIMEOUT).await.unwrap();
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let transport = pool("tidings-test").session("slow").unwrap();
    let err = transport
        .get(&server.uri(), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_refused_connection_is_network_error() {
    let transport = pool("tidings-test").session("gone").unwrap();
    let err = transport
        .get("http://127.0.0.1:1/feed.xml", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NetworkError(_)), "{err:?}");
}

#[tokio::test]
async fn test_connection_dropped_mid_body_is_network_error() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        // Promise 1000 bytes, send a handful, then hang up.
        let head = "HTTP/1.1 200 OK\r\ncontent-length: 1000\r\n\r\n<rss>";
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let transport = pool("tidings-test").session("reset").unwrap();
    let err = transport
        .get(&format!("http://{addr}/feed.xml"), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NetworkError(_)), "{err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_batch_discover_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rss.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<rss><channel>\
             <item><title>First</title><link>{0}/news/1</link></item>\
             <item><title>Second</title><link>{0}/news/2</link></item>\
             </channel></rss>",
            server.uri()
        )))
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = SourceDescriptor::new("local", server.uri(), DiscoveryMethod::Rss)
        .with_display_name("Local feed")
        .with_feed_urls(vec![
            format!("{}/private/rss.xml", server.uri()),
            format!("{}/rss.xml", server.uri()),
        ]);
    let mut registry = SourceRegistry::new();
    registry.register_descriptor(descriptor, "test");

    let factory = SourceFactory::new(
        registry,
        pool("tidings-test"),
        Services::new(&EngineConfig::default()),
    );
    let report = factory
        .batch_discover(&["local".to_string()], 5, 1)
        .await;

    let articles = &report.articles()["local"];
    assert_eq!(articles.len(), 2);
    assert_eq!(articles[0].title, "First");
    assert!(report.skip_report().is_empty());
    assert_eq!(factory.services().policy.policy_fetches(), 1);
}
