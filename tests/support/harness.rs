use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use thrust::proxy::AppContext;
use thrust::server::{RunningServer, Server};
use thrust::settings::Settings;
use thrust::tls::TlsProvider;

use super::{find_free_port, wait_for_listener};

/// Settings for an in-process proxy aimed at a scripted upstream. Requests
/// logging is off to keep test output readable.
pub fn proxy_settings(target_port: u16) -> Settings {
    Settings {
        target_port,
        cache_size: 64 * 1024 * 1024,
        max_cache_item_size: 1024 * 1024,
        x_sendfile_enabled: true,
        gzip_compression_enabled: true,
        gzip_compression_disable_on_auth: false,
        gzip_compression_jitter: 0,
        max_request_body: 0,
        tls_domain: String::new(),
        tls_local: false,
        acme_directory: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
        eab_kid: String::new(),
        eab_hmac_key: String::new(),
        storage_path: PathBuf::from("./storage/thruster"),
        bad_gateway_page: PathBuf::from("./does-not-exist/502.html"),
        http_port: 0,
        https_port: 0,
        http_idle_timeout: 5,
        http_read_timeout: 5,
        http_write_timeout: 5,
        http_health_host: "127.0.0.1".to_string(),
        http_health_path: String::new(),
        http_health_interval: 1,
        http_health_timeout: 1,
        http_health_deadline: 120,
        h2c_enabled: false,
        forward_headers: None,
        active_storage_secret: String::new(),
        debug: false,
        log_level: None,
        log_requests: false,
    }
}

pub struct TestProxy {
    pub http_addr: SocketAddr,
    pub https_addr: Option<SocketAddr>,
    server: Option<RunningServer>,
}

impl TestProxy {
    /// Starts the full listener stack against the given settings; TLS is
    /// derived from the settings like production wiring does.
    pub async fn start(mut settings: Settings) -> Self {
        settings.http_port = find_free_port().await;
        let has_tls = settings.has_tls();
        if has_tls {
            settings.https_port = find_free_port().await;
        }
        let http_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.http_port));
        let https_addr =
            has_tls.then(|| SocketAddr::from((Ipv4Addr::LOCALHOST, settings.https_port)));

        let tls = if has_tls {
            Some(Arc::new(
                TlsProvider::from_settings(&settings)
                    .await
                    .expect("build TLS provider"),
            ))
        } else {
            None
        };

        let app = AppContext::new(Arc::new(settings));
        let server = Server::new(app, tls);
        let running = server.start().await.expect("start proxy server");

        wait_for_listener(http_addr).await;
        if let Some(addr) = https_addr {
            wait_for_listener(addr).await;
        }

        Self {
            http_addr,
            https_addr,
            server: Some(running),
        }
    }

    pub async fn stop(mut self) {
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
    }
}
