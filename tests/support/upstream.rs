use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A request as the scripted upstream saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

type Handler = dyn Fn(&SeenRequest, usize) -> Vec<u8> + Send + Sync;

/// Scripted loopback upstream: hands every parsed request (plus a running
/// request count) to the handler and writes whatever bytes come back.
pub struct TestUpstream {
    addr: SocketAddr,
    counter: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&SeenRequest, usize) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind upstream listener");
        let addr = listener.local_addr().expect("upstream addr");
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let loop_counter = counter.clone();
        let loop_seen = seen.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let counter = loop_counter.clone();
                let seen = loop_seen.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, handler, counter, seen).await;
                });
            }
        });

        Self {
            addr,
            counter,
            seen,
            handle,
        }
    }

    /// Serves the same response (headers + body) for every request, closing
    /// the connection each time.
    pub async fn with_static_response(response: impl Into<Vec<u8>>) -> Self {
        let response = response.into();
        Self::start(move |_, _| response.clone()).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn request_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    stream: TcpStream,
    handler: Arc<Handler>,
    counter: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    loop {
        let Some(request) = read_request(&mut reader).await? else {
            return Ok(());
        };
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        seen.lock().push(request.clone());

        let response = handler(&request, count);
        reader.get_mut().write_all(&response).await?;
        reader.get_mut().flush().await?;

        if response_closes(&response) {
            return Ok(());
        }
    }
}

async fn read_request(
    reader: &mut BufReader<TcpStream>,
) -> std::io::Result<Option<SeenRequest>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    let mut chunked = false;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).await? == 0 {
            return Ok(None);
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            }
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                chunked = true;
            }
            headers.push((name, value));
        }
    }

    let mut body = Vec::new();
    if chunked {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).await?;
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
            if size == 0 {
                let mut tail = String::new();
                reader.read_line(&mut tail).await?;
                break;
            }
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).await?;
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
        }
    } else if content_length > 0 {
        let mut fixed = vec![0u8; content_length];
        reader.read_exact(&mut fixed).await?;
        body = fixed;
    }

    Ok(Some(SeenRequest {
        method,
        target,
        headers,
        body,
    }))
}

fn response_closes(response: &[u8]) -> bool {
    let head_end = response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .unwrap_or(response.len());
    let head = String::from_utf8_lossy(&response[..head_end]).to_ascii_lowercase();
    head.contains("connection: close")
}

/// Convenience builder for simple upstream responses.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {status}\r\n");
    let mut has_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            has_length = true;
        }
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_length {
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    response.push_str("Connection: close\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}
