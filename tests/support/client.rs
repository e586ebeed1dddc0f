use std::io::Read;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body with any Content-Encoding undone.
    pub fn decoded_body(&self) -> Vec<u8> {
        match self.header("content-encoding") {
            Some("gzip") => {
                let mut decoder = flate2::read::GzDecoder::new(self.body.as_slice());
                let mut decoded = Vec::new();
                decoder.read_to_end(&mut decoded).expect("gzip decode");
                decoded
            }
            Some("zstd") => zstd::stream::decode_all(self.body.as_slice()).expect("zstd decode"),
            _ => self.body.clone(),
        }
    }
}

/// Sends one raw HTTP/1.1 request and reads the full response.
pub async fn send(addr: SocketAddr, raw_request: &[u8]) -> TestResponse {
    let stream = TcpStream::connect(addr).await.expect("connect to proxy");
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(raw_request)
        .await
        .expect("write request");

    read_response(&mut reader).await
}

pub async fn read_response(reader: &mut BufReader<TcpStream>) -> TestResponse {
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .expect("read status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {status_line:?}"));

    let mut headers = Vec::new();
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read header line");
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().ok();
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
            reader.read_line(&mut size_line).await.expect("read chunk size");
            let size_str = size_line.trim();
            let size = usize::from_str_radix(
                size_str.split(';').next().unwrap_or(size_str),
                16,
            )
            .unwrap_or_else(|_| panic!("bad chunk size: {size_line:?}"));
            if size == 0 {
                let mut tail = String::new();
                reader.read_line(&mut tail).await.expect("read trailer");
                break;
            }
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).await.expect("read chunk");
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
        }
    } else if let Some(length) = content_length {
        let mut fixed = vec![0u8; length];
        reader.read_exact(&mut fixed).await.expect("read body");
        body = fixed;
    } else {
        reader.read_to_end(&mut body).await.expect("read body");
    }

    TestResponse {
        status,
        headers,
        body,
    }
}

/// Builds a raw request with sensible defaults; extra headers come as
/// `name: value` lines.
pub fn raw_request(method: &str, target: &str, extra_headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut request = format!("{method} {target} HTTP/1.1\r\nHost: proxy.test\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("Connection: close\r\n\r\n");
    let mut bytes = request.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub async fn get(addr: SocketAddr, target: &str, extra_headers: &[(&str, &str)]) -> TestResponse {
    send(addr, &raw_request("GET", target, extra_headers, b"")).await
}

pub async fn post(
    addr: SocketAddr,
    target: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> TestResponse {
    send(addr, &raw_request("POST", target, extra_headers, body)).await
}
