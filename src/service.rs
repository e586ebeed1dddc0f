use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use http::StatusCode;
use nix::sys::signal::Signal;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::process::UpstreamProcess;
use crate::proxy::AppContext;
use crate::proxy::codec::read_http1_response_head;
use crate::server::Server;
use crate::settings::Settings;
use crate::tls::TlsProvider;

const SIGNAL_GRACE: Duration = Duration::from_secs(10);

/// Wires the pipeline, the listeners, and the supervised upstream into one
/// unit and runs it to completion. The returned code is the process exit
/// code for `main`.
pub struct Service {
    settings: Arc<Settings>,
}

type UpstreamResult = Result<i32>;

impl Service {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub async fn run(&self, command: &str, args: &[String]) -> Result<i32> {
        let app = AppContext::new(self.settings.clone());
        let tls = if self.settings.has_tls() {
            Some(Arc::new(TlsProvider::from_settings(&self.settings).await?))
        } else {
            None
        };
        let server = Server::new(app, tls);

        let env = vec![("PORT".to_string(), self.settings.target_port.to_string())];
        let upstream = Arc::new(UpstreamProcess::new(command, args, env));

        // One-slot channel: both the health gate and the termination wait
        // select on the single upstream-exit event.
        let (result_tx, mut result_rx) = mpsc::channel::<UpstreamResult>(1);
        {
            let upstream = upstream.clone();
            tokio::spawn(async move {
                let result = upstream.run().await;
                let _ = result_tx.send(result).await;
            });
        }

        if !self.settings.http_health_path.is_empty() {
            if let Err(err) = self.wait_until_healthy(&mut result_rx).await {
                error!(error = %err, "upstream health check failed");
                if let Err(err) = upstream.signal(Signal::SIGTERM) {
                    error!(error = %err, "failed to signal upstream process");
                }
                return Ok(1);
            }
            info!("upstream is healthy, starting proxy server");
        }

        let running = server.start().await?;
        let code = await_termination(&upstream, &mut result_rx).await;
        running.stop().await;
        Ok(code)
    }

    /// Polls the upstream's health endpoint until it answers 200, the
    /// deadline passes, or the child exits underneath us.
    async fn wait_until_healthy(
        &self,
        result_rx: &mut mpsc::Receiver<UpstreamResult>,
    ) -> Result<()> {
        let settings = &self.settings;
        let deadline = Instant::now() + settings.http_health_deadline();
        let mut ticker = interval(settings.http_health_interval());
        ticker.tick().await;

        info!(
            host = %settings.http_health_host,
            port = settings.target_port,
            path = %settings.http_health_path,
            "starting health checks"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(anyhow!(
                        "health check timed out after {:?}",
                        settings.http_health_deadline()
                    ));
                }
                result = result_rx.recv() => {
                    return match result {
                        Some(Ok(code)) => {
                            Err(anyhow!("upstream process exited prematurely with code {code}"))
                        }
                        Some(Err(err)) => Err(err.context("upstream process failed to start")),
                        None => Err(anyhow!("upstream process result channel closed")),
                    };
                }
                _ = ticker.tick() => {
                    match health_probe(
                        &settings.http_health_host,
                        settings.target_port,
                        &settings.http_health_path,
                        settings.http_health_timeout(),
                    )
                    .await
                    {
                        Ok(StatusCode::OK) => return Ok(()),
                        Ok(status) => {
                            debug!(status = status.as_u16(), "health check received non-200 status");
                        }
                        Err(err) => {
                            // Expected while the upstream is still binding.
                            debug!(error = %err, "health check attempt failed, retrying");
                        }
                    }
                }
            }
        }
    }
}

async fn health_probe(
    host: &str,
    port: u16,
    path: &str,
    probe_timeout: Duration,
) -> Result<StatusCode> {
    let attempt = async {
        let stream = TcpStream::connect((host, port))
            .await
            .context("failed to connect to health endpoint")?;
        let peer = stream.peer_addr().context("health endpoint has no peer address")?;
        let mut reader = BufReader::new(stream);

        let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        reader
            .get_mut()
            .write_all(request.as_bytes())
            .await
            .context("failed to send health check request")?;

        let head = read_http1_response_head(&mut reader, probe_timeout, peer).await?;
        Ok(head.status)
    };

    match timeout(probe_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("health check timed out")),
    }
}

/// After startup: wait for either the upstream to exit on its own or for a
/// termination signal to relay.
async fn await_termination(
    upstream: &UpstreamProcess,
    result_rx: &mut mpsc::Receiver<UpstreamResult>,
) -> i32 {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(error = %err, "failed to install SIGINT handler");
            return 1;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            return 1;
        }
    };

    let relayed = tokio::select! {
        result = result_rx.recv() => {
            return match result {
                Some(Ok(code)) => {
                    info!(code, "upstream process exited on its own");
                    code
                }
                Some(Err(err)) => {
                    error!(error = %err, "upstream process failed");
                    1
                }
                None => 1,
            };
        }
        _ = sigint.recv() => Signal::SIGINT,
        _ = sigterm.recv() => Signal::SIGTERM,
    };

    info!(signal = %relayed, "received signal, relaying to upstream process");
    if let Err(err) = upstream.signal(relayed) {
        error!(error = %err, "failed to signal upstream process");
    }

    match timeout(SIGNAL_GRACE, result_rx.recv()).await {
        Ok(_) => info!("upstream process terminated after signal"),
        Err(_) => warn!(
            "upstream process did not terminate within {:?} of signal",
            SIGNAL_GRACE
        ),
    }

    1
}
