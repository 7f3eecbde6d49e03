//! Remote store tests against a mock artifact API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use cachet_cache::remote::{ArtifactSigner, DURATION_HEADER, TAG_HEADER};
use cachet_cache::{
    CacheSource, Error, RemoteCacheConfig, RemoteStore, RetryConfig, RunState, SignatureConfig,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "test-token-0123";

fn config(server: &MockServer) -> RemoteCacheConfig {
    let mut config = RemoteCacheConfig::new(server.uri(), TOKEN);
    config.team_id = Some("team_1".into());
    config.retry = RetryConfig {
        max_retries: 2,
        min_backoff_ms: 5,
        max_backoff_ms: 20,
        multiplier: 2.0,
    };
    config
}

fn store(config: &RemoteCacheConfig, max_failures: u64) -> RemoteStore {
    RemoteStore::new(config, Arc::new(RunState::new(max_failures))).unwrap()
}

// ============================================================================
// Request shape
// ============================================================================

#[tokio::test]
async fn test_put_sends_auth_duration_and_team() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v8/artifacts/abc123"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .and(header(DURATION_HEADER, "1200"))
        .and(header("content-type", "application/octet-stream"))
        .and(query_param("teamId", "team_1"))
        .and(body_bytes(b"archive".to_vec()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&config(&server), 3);
    store
        .put("abc123", Bytes::from_static(b"archive"), 1200)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fetch_404_is_a_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/abc123"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&config(&server), 3);
    assert!(store.fetch("abc123").await.unwrap().is_none());
    assert_eq!(store.run_state().failures(), 0);
}

#[tokio::test]
async fn test_fetch_reads_body_and_duration() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/abc123"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(DURATION_HEADER, "777")
                .set_body_bytes(b"payload".to_vec()),
        )
        .mount(&server)
        .await;

    let artifact = store(&config(&server), 3)
        .fetch("abc123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(artifact.body.as_ref(), b"payload");
    assert_eq!(artifact.duration, 777);
}

#[tokio::test]
async fn test_exists_uses_head() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/v8/artifacts/present"))
        .respond_with(ResponseTemplate::new(200).insert_header(DURATION_HEADER, "42"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/v8/artifacts/absent"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = store(&config(&server), 3);
    let meta = store.exists("present").await.unwrap().unwrap();
    assert_eq!(meta.source, CacheSource::Remote);
    assert_eq!(meta.time_saved, 42);
    assert!(store.exists("absent").await.unwrap().is_none());
}

// ============================================================================
// Retries and the circuit breaker
// ============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/abc123"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&config(&server), 10);
    let artifact = store.fetch("abc123").await.unwrap().unwrap();
    assert_eq!(artifact.body.as_ref(), b"ok");
    assert_eq!(store.run_state().failures(), 2);
}

/// Serve TLS with a certificate no client trusts, counting connections.
fn untrusted_tls_server() -> (String, Arc<AtomicUsize>) {
    let cert = CertificateDer::from(include_bytes!("fixtures/self-signed-cert.der").to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        include_bytes!("fixtures/self-signed-key.der").to_vec(),
    ));
    let tls = Arc::new(
        rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("https://{}", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            counter.fetch_add(1, Ordering::SeqCst);
            let conn = rustls::ServerConnection::new(Arc::clone(&tls)).unwrap();
            let mut stream = rustls::StreamOwned::new(conn, stream);
            // The client aborts the handshake once it sees the certificate.
            let _ = stream.read(&mut [0; 1]);
        }
    });
    (url, connections)
}

#[tokio::test]
async fn test_rejected_certificate_is_not_retried() {
    let (url, connections) = untrusted_tls_server();
    let mut config = RemoteCacheConfig::new(url, TOKEN);
    config.retry = RetryConfig {
        max_retries: 3,
        min_backoff_ms: 30_000,
        max_backoff_ms: 30_000,
        multiplier: 1.0,
    };

    let store = store(&config, 10);
    // A retry would sleep out the backoff and hit the timeout.
    let err = tokio::time::timeout(Duration::from_secs(10), store.fetch("abc123"))
        .await
        .expect("certificate failure must not back off")
        .unwrap_err();
    assert!(matches!(err, Error::Http { .. }));
    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(store.run_state().failures(), 1);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/abc123"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let err = store(&config(&server), 10)
        .fetch("abc123")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatus { status: 403, .. }));
}

#[tokio::test]
async fn test_breaker_short_circuits_after_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.retry.max_retries = 0;
    let store = store(&config, 3);

    for hash in ["a1", "a2", "a3"] {
        let err = store.fetch(hash).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus { status: 500, .. }));
    }
    let err = store.fetch("a4").await.unwrap_err();
    assert!(err.is_too_many_failures());
    assert!(store.run_state().is_tripped());
}

#[tokio::test]
async fn test_breaker_is_shared_between_stores_of_one_run() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.retry.max_retries = 0;
    let run_state = Arc::new(RunState::new(1));
    let first = RemoteStore::new(&config, Arc::clone(&run_state)).unwrap();
    let second = RemoteStore::new(&config, Arc::clone(&run_state)).unwrap();

    assert!(first.put("h1", Bytes::from_static(b"x"), 1).await.is_err());
    let err = second
        .put("h2", Bytes::from_static(b"x"), 1)
        .await
        .unwrap_err();
    assert!(err.is_too_many_failures());
}

#[tokio::test]
async fn test_connection_refused_counts_as_failure() {
    let server = MockServer::start().await;
    let mut config = config(&server);
    drop(server);
    config.retry.max_retries = 1;

    let store = store(&config, 10);
    let err = store.fetch("abc123").await.unwrap_err();
    assert!(matches!(err, Error::Http { .. }));
    assert_eq!(store.run_state().failures(), 2);
}

// ============================================================================
// Signatures
// ============================================================================

fn signed_config(server: &MockServer) -> RemoteCacheConfig {
    let mut config = config(server);
    config.signature = Some(SignatureConfig {
        key: "signing-key-xyz".into(),
    });
    config
}

#[tokio::test]
async fn test_signed_put_carries_tag() {
    let server = MockServer::start().await;
    let expected = ArtifactSigner::new("signing-key-xyz", "team_1")
        .unwrap()
        .tag("abc123", b"archive");
    Mock::given(method("PUT"))
        .and(path("/v8/artifacts/abc123"))
        .and(header(TAG_HEADER, expected.as_str()))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    store(&signed_config(&server), 3)
        .put("abc123", Bytes::from_static(b"archive"), 5)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_signed_fetch_verifies_tag() {
    let server = MockServer::start().await;
    let signer = ArtifactSigner::new("signing-key-xyz", "team_1").unwrap();
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/good"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(TAG_HEADER, signer.tag("good", b"body").as_str())
                .set_body_bytes(b"body".to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/tampered"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(TAG_HEADER, signer.tag("tampered", b"body").as_str())
                .set_body_bytes(b"b0dy".to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v8/artifacts/unsigned"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"body".to_vec()))
        .mount(&server)
        .await;

    let store = store(&signed_config(&server), 10);
    assert!(store.fetch("good").await.unwrap().is_some());
    assert!(matches!(
        store.fetch("tampered").await.unwrap_err(),
        Error::InvalidTag { .. }
    ));
    assert!(matches!(
        store.fetch("unsigned").await.unwrap_err(),
        Error::ArtifactTagMissing { .. }
    ));
}
