mod support;

use std::sync::Arc;

use support::client;
use support::harness::{TestProxy, proxy_settings};
use support::upstream::{TestUpstream, http_response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn tls_terminates_with_a_locally_rooted_certificate() {
    let upstream = TestUpstream::start(|_, _| {
        http_response("200 OK", &[("Content-Type", "text/plain")], b"over tls")
    })
    .await;
    let storage = tempfile::TempDir::new().unwrap();
    let mut settings = proxy_settings(upstream.port());
    settings.tls_domain = "localhost".to_string();
    settings.tls_local = true;
    settings.storage_path = storage.path().to_path_buf();
    let proxy = TestProxy::start(settings).await;

    // Trust the generated authority, exactly like a provisioned dev box.
    let ca_pem = std::fs::read(storage.path().join("authority.crt")).expect("authority on disk");
    let ca_der = rustls_pemfile::certs(&mut ca_pem.as_slice())
        .next()
        .expect("authority certificate")
        .expect("valid PEM");
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_der).expect("trust authority");

    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(proxy.https_addr.expect("https listener"))
        .await
        .unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(server_name, tcp).await.expect("TLS handshake");

    tls.write_all(b"GET /secure HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    let _ = tls.read_to_end(&mut raw).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("over tls"), "{text}");

    // Termination happened here; the upstream saw the original scheme.
    assert_eq!(upstream.seen()[0].header("x-forwarded-proto"), Some("https"));

    proxy.stop().await;
}

#[tokio::test]
async fn cleartext_requests_redirect_to_https_when_tls_is_enabled() {
    let upstream = TestUpstream::start(|_, _| {
        http_response("200 OK", &[("Content-Type", "text/plain")], b"never reached")
    })
    .await;
    let storage = tempfile::TempDir::new().unwrap();
    let mut settings = proxy_settings(upstream.port());
    settings.tls_domain = "localhost".to_string();
    settings.tls_local = true;
    settings.storage_path = storage.path().to_path_buf();
    let proxy = TestProxy::start(settings).await;

    let response = client::get(proxy.http_addr, "/admin?x=1", &[]).await;
    assert_eq!(response.status, 301);
    assert_eq!(
        response.header("location"),
        Some("https://proxy.test/admin?x=1")
    );
    assert_eq!(response.header("connection"), Some("close"));
    assert_eq!(upstream.request_count(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn redirect_strips_the_port_from_the_host() {
    let upstream = TestUpstream::start(|_, _| {
        http_response("200 OK", &[("Content-Type", "text/plain")], b"never reached")
    })
    .await;
    let storage = tempfile::TempDir::new().unwrap();
    let mut settings = proxy_settings(upstream.port());
    settings.tls_domain = "localhost".to_string();
    settings.tls_local = true;
    settings.storage_path = storage.path().to_path_buf();
    let proxy = TestProxy::start(settings).await;

    let raw = client::raw_request("GET", "/", &[], b"");
    let raw = String::from_utf8(raw)
        .unwrap()
        .replace("Host: proxy.test", "Host: proxy.test:8080");
    let response = client::send(proxy.http_addr, raw.as_bytes()).await;
    assert_eq!(response.header("location"), Some("https://proxy.test/"));

    proxy.stop().await;
}

#[tokio::test]
async fn h2c_serves_prior_knowledge_http2() {
    let upstream = TestUpstream::start(|_, _| {
        http_response("200 OK", &[("Content-Type", "text/plain")], b"hello h2c")
    })
    .await;
    let mut settings = proxy_settings(upstream.port());
    settings.h2c_enabled = true;
    let proxy = TestProxy::start(settings).await;

    let tcp = TcpStream::connect(proxy.http_addr).await.unwrap();
    let (client, connection) = h2::client::handshake(tcp).await.expect("h2 handshake");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let mut client = client.ready().await.expect("h2 client ready");

    let request = http::Request::builder()
        .method("GET")
        .uri("http://proxy.test/")
        .body(())
        .unwrap();
    let (response, _) = client.send_request(request, true).expect("send h2 request");
    let response = response.await.expect("h2 response");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok()),
        Some("miss")
    );

    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.expect("h2 body chunk");
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"hello h2c");

    proxy.stop().await;
}

#[tokio::test]
async fn h2c_disabled_treats_preface_as_bad_request() {
    let upstream = TestUpstream::start(|_, _| {
        http_response("200 OK", &[("Content-Type", "text/plain")], b"plain only")
    })
    .await;
    let proxy = TestProxy::start(proxy_settings(upstream.port())).await;

    let mut tcp = TcpStream::connect(proxy.http_addr).await.unwrap();
    tcp.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();
    let mut raw = Vec::new();
    let _ = tcp.read_to_end(&mut raw).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 400"), "{text}");

    proxy.stop().await;
}
