use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::proxy::codec::read_http1_request_head;
use crate::proxy::pipeline;
use crate::proxy::request::Scheme;
use crate::proxy::respond::write_simple_response;
use crate::proxy::{AppContext, http2};
use crate::tls::TlsProvider;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// The listening half of the assembly: a plain HTTP listener, plus an HTTPS
/// listener when TLS is configured (in which case the HTTP side only
/// terminates ACME challenges and redirects).
pub struct Server {
    app: AppContext,
    tls: Option<Arc<TlsProvider>>,
}

pub struct RunningServer {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(app: AppContext, tls: Option<Arc<TlsProvider>>) -> Self {
        Self { app, tls }
    }

    pub async fn start(&self) -> Result<RunningServer> {
        let settings = &self.app.settings;
        let http_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.http_port));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let http_listener = TcpListener::bind(http_addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;

        match &self.tls {
            Some(provider) => {
                let https_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.https_port));
                let https_listener = TcpListener::bind(https_addr)
                    .await
                    .with_context(|| format!("failed to bind HTTPS listener on {https_addr}"))?;

                provider.start();
                let acceptor = TlsAcceptor::from(provider.server_config());

                handles.push(tokio::spawn(redirect_loop(
                    http_listener,
                    self.app.clone(),
                    provider.clone(),
                    shutdown_rx.clone(),
                )));
                handles.push(tokio::spawn(tls_loop(
                    https_listener,
                    self.app.clone(),
                    acceptor,
                    shutdown_rx,
                )));
                info!(
                    http = %http_addr,
                    https = %https_addr,
                    tls_domain = %settings.tls_domain,
                    "server started"
                );
            }
            None => {
                handles.push(tokio::spawn(plain_loop(
                    http_listener,
                    self.app.clone(),
                    shutdown_rx,
                )));
                info!(http = %http_addr, "server started");
            }
        }

        Ok(RunningServer { shutdown, handles })
    }
}

impl RunningServer {
    /// Stops accepting and gives in-flight requests a bounded grace to
    /// finish before the connection tasks are torn down.
    pub async fn stop(self) {
        info!("server stopping");
        let _ = self.shutdown.send(true);
        for mut handle in self.handles {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
                debug!("listener did not drain within the shutdown budget");
                handle.abort();
            }
        }
        info!("server stopped");
    }
}

async fn plain_loop(listener: TcpListener, app: AppContext, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "could not accept an incoming connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let app = app.clone();
                connections.spawn(async move {
                    if let Err(err) = serve_plain(stream, peer, app).await {
                        debug!(peer = %peer, error = %err, "connection ended with an error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_plain(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    if app.settings.h2c_enabled && starts_with_h2_preface(&stream).await? {
        debug!(peer = %peer, "serving cleartext HTTP/2 connection");
        return http2::serve_connection(stream, peer, Scheme::Http, app).await;
    }
    pipeline::serve_connection(stream, peer, Scheme::Http, app).await
}

/// Prior-knowledge h2c detection: peek at the first bytes without consuming
/// them and compare against the client connection preface.
async fn starts_with_h2_preface(stream: &TcpStream) -> Result<bool> {
    let mut buffer = [0u8; H2_PREFACE.len()];
    loop {
        let peeked = stream.peek(&mut buffer).await?;
        if peeked == 0 {
            return Ok(false);
        }
        if buffer[..peeked] != H2_PREFACE[..peeked] {
            return Ok(false);
        }
        if peeked == H2_PREFACE.len() {
            return Ok(true);
        }
        // A preface prefix: wait for more bytes to disambiguate.
        stream.readable().await?;
    }
}

async fn tls_loop(
    listener: TcpListener,
    app: AppContext,
    acceptor: TlsAcceptor,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "could not accept an incoming connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let app = app.clone();
                let acceptor = acceptor.clone();
                connections.spawn(async move {
                    if let Err(err) = serve_tls(stream, peer, acceptor, app).await {
                        debug!(peer = %peer, error = %err, "TLS connection ended with an error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_tls(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    app: AppContext,
) -> Result<()> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .with_context(|| format!("TLS handshake with {peer} failed"))?;

    let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    match alpn.as_deref() {
        Some(b"acme-tls/1") => {
            // Challenge validation needs only the completed handshake.
            debug!(peer = %peer, "completed acme-tls/1 validation handshake");
            Ok(())
        }
        Some(b"h2") => http2::serve_connection(tls_stream, peer, Scheme::Https, app).await,
        _ => pipeline::serve_connection(tls_stream, peer, Scheme::Https, app).await,
    }
}

/// The cleartext side of a TLS deployment: ACME HTTP-01 answers and a
/// permanent redirect for everything else.
async fn redirect_loop(
    listener: TcpListener,
    app: AppContext,
    provider: Arc<TlsProvider>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "could not accept an incoming connection");
                        continue;
                    }
                };
                let app = app.clone();
                let provider = provider.clone();
                connections.spawn(async move {
                    if let Err(err) = serve_redirect(stream, peer, app, provider).await {
                        debug!(peer = %peer, error = %err, "redirect connection ended with an error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_redirect(
    stream: TcpStream,
    peer: SocketAddr,
    app: AppContext,
    provider: Arc<TlsProvider>,
) -> Result<()> {
    let write_timeout = app.settings.http_write_timeout();
    let mut reader = BufReader::new(stream);
    let Some(head) = read_http1_request_head(
        &mut reader,
        peer,
        app.settings.http_idle_timeout(),
        app.settings.http_read_timeout(),
    )
    .await?
    else {
        return Ok(());
    };

    let (path, _) = head
        .target
        .split_once('?')
        .unwrap_or((head.target.as_str(), ""));
    if let Some(body) = provider.challenge_response(path) {
        debug!(peer = %peer, path, "answering ACME challenge");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        write_simple_response(
            reader.get_mut(),
            StatusCode::OK,
            &headers,
            &body,
            true,
            write_timeout,
        )
        .await?;
        return Ok(());
    }

    let host = strip_port(head.host());
    let location = format!("https://{host}{}", head.target);
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, HeaderValue::from_str(&location)?);
    write_simple_response(
        reader.get_mut(),
        StatusCode::MOVED_PERMANENTLY,
        &headers,
        b"",
        true,
        write_timeout,
    )
    .await?;
    Ok(())
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets; everything else loses a :port.
    if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::strip_port;

    #[test]
    fn strip_port_handles_common_hosts() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
