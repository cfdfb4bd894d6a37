//! HTTP pull ingest (§6): redirect-following GET over a raw `TcpStream`,
//! built the way the teacher's `RTSPConnection` is built — hand-rolled
//! header scanning rather than a full HTTP client crate, generalized from
//! RTSP's double-CRLF response detector to `Content-Length`/chunked framing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TsRelayError};

use super::Inbound;

const MAX_REDIRECTS: u32 = 8;
const READ_CHUNK: usize = 64 * 1024;

enum Framing {
    ContentLength(usize),
    Chunked,
    UntilClose,
}

/// Pulls an MPEG-TS (or any octet-stream) body over HTTP/1.1, following
/// redirects and reusing the connection while the server advertises
/// Keep-Alive. One `#ua=...` URL fragment overrides the configured
/// `User-Agent` for that stream only (§6).
pub struct HttpPullClient {
    host: String,
    port: u16,
    path: String,
    user_agent: String,
    range_offset: Option<u64>,
    keep_alive: bool,
    stream: Option<TcpStream>,
    framing: Option<Framing>,
    pending: BytesMut,
}

impl HttpPullClient {
    /// Parses `url` (scheme `http://host[:port]/path[?query][#ua=...]`) and
    /// prepares a client. Does not connect until the first `next_chunk`.
    pub fn new(url: &str, default_user_agent: &str) -> Result<Self> {
        let (base, fragment) = match url.split_once('#') {
            Some((b, f)) => (b, Some(f)),
            None => (url, None),
        };
        let rest = base
            .strip_prefix("http://")
            .ok_or_else(|| TsRelayError::InputError(format!("unsupported url scheme: {}", url)))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap_or(80)),
            None => (authority.to_string(), 80),
        };

        let mut user_agent = default_user_agent.to_string();
        if let Some(frag) = fragment {
            for kv in frag.split('&') {
                if let Some(ua) = kv.strip_prefix("ua=") {
                    user_agent = ua.to_string();
                }
            }
        }

        Ok(HttpPullClient {
            host,
            port,
            path: path.to_string(),
            user_agent,
            range_offset: None,
            keep_alive: true,
            stream: None,
            framing: None,
            pending: BytesMut::new(),
        })
    }

    /// Resumes from a byte offset via `Range: bytes=<off>-` on the next connect.
    pub fn with_range_offset(mut self, offset: u64) -> Self {
        self.range_offset = Some(offset);
        self
    }

    pub fn disable_keep_alive(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.connect_and_request(0).await
    }

    async fn connect_and_request(&mut self, redirects: u32) -> Result<()> {
        if redirects > MAX_REDIRECTS {
            return Err(TsRelayError::InputError("too many redirects".into()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TsRelayError::InputError(format!("connect {} failed: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\n",
            self.path, self.host, self.user_agent
        );
        if self.keep_alive {
            request.push_str("Connection: Keep-Alive\r\n");
        } else {
            request.push_str("Connection: close\r\n");
        }
        if let Some(offset) = self.range_offset {
            request.push_str(&format!("Range: bytes={}-\r\n", offset));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes()).await?;

        let (status, headers, leftover) = read_headers(&mut stream).await?;

        if matches!(status, 301 | 302 | 303 | 307) {
            let location = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("location"))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| TsRelayError::InputError("redirect with no Location".into()))?;
            let redirected = HttpPullClient::new(&location, &self.user_agent)?;
            self.host = redirected.host;
            self.port = redirected.port;
            self.path = redirected.path;
            return Box::pin(self.connect_and_request(redirects + 1)).await;
        }

        if status != 200 && status != 206 {
            return Err(TsRelayError::InputError(format!("unexpected status {}", status)));
        }

        let transfer_chunked = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.to_lowercase().contains("chunked"));
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok());

        self.framing = Some(if transfer_chunked {
            Framing::Chunked
        } else if let Some(len) = content_length {
            Framing::ContentLength(len)
        } else {
            Framing::UntilClose
        });
        self.pending.clear();
        self.pending.extend_from_slice(&leftover);
        self.stream = Some(stream);
        Ok(())
    }

    async fn fill_more(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().expect("connected");
        let mut buf = [0u8; READ_CHUNK];
        let n = stream.read(&mut buf).await?;
        if n > 0 {
            self.pending.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }

    /// Pulls one complete chunk off the front of `pending`, if a full
    /// `<size>\r\n<data>\r\n` frame is already buffered.
    fn take_chunked_frame(&mut self) -> Option<Bytes> {
        let text = std::str::from_utf8(&self.pending).ok()?;
        let line_end = text.find("\r\n")?;
        let size_str = text[..line_end].split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).ok()?;
        let header_len = line_end + 2;
        if size == 0 {
            self.pending.clear();
            return None;
        }
        if self.pending.len() < header_len + size + 2 {
            return None;
        }
        let data = self.pending.split_to(header_len + size + 2);
        Some(Bytes::copy_from_slice(&data[header_len..header_len + size]))
    }
}

async fn read_headers(stream: &mut TcpStream) -> Result<(u16, Vec<(String, String)>, Bytes)> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(pos) = find_double_crlf(&buf) {
            let header_bytes = buf.split_to(pos + 4);
            let text = String::from_utf8_lossy(&header_bytes);
            let mut lines = text.split("\r\n");
            let status_line = lines.next().unwrap_or("");
            let status = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| TsRelayError::InputError("malformed status line".into()))?;
            let mut headers = Vec::new();
            for line in lines {
                if let Some((k, v)) = line.split_once(':') {
                    headers.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
            return Ok((status, headers, buf.freeze()));
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(TsRelayError::InputError("connection closed before headers completed".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[async_trait]
impl Inbound for HttpPullClient {
    async fn next_chunk(&mut self) -> Result<Bytes> {
        self.ensure_connected().await?;

        loop {
            match self.framing.as_ref().expect("framing set on connect") {
                Framing::ContentLength(remaining) => {
                    let remaining = *remaining;
                    if remaining == 0 {
                        self.stream = None;
                        return Err(TsRelayError::InputError("response body exhausted".into()));
                    }
                    if !self.pending.is_empty() {
                        let take = self.pending.len().min(remaining);
                        let data = self.pending.split_to(take);
                        if let Some(Framing::ContentLength(r)) = self.framing.as_mut() {
                            *r -= take;
                        }
                        return Ok(data.freeze());
                    }
                    self.fill_more().await?;
                }
                Framing::Chunked => {
                    if let Some(chunk) = self.take_chunked_frame() {
                        return Ok(chunk);
                    }
                    if self.fill_more().await? == 0 {
                        self.stream = None;
                        return Err(TsRelayError::InputError("connection closed mid-chunk".into()));
                    }
                }
                Framing::UntilClose => {
                    if !self.pending.is_empty() {
                        let data = std::mem::take(&mut self.pending);
                        return Ok(data.freeze());
                    }
                    if self.fill_more().await? == 0 {
                        self.stream = None;
                        return Err(TsRelayError::InputError("connection closed".into()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ua_fragment_overrides_default_user_agent() {
        let client = HttpPullClient::new("http://example.com/stream.ts#ua=MyAgent/1.0", "default-ua").unwrap();
        assert_eq!(client.user_agent, "MyAgent/1.0");
        assert_eq!(client.host, "example.com");
        assert_eq!(client.path, "/stream.ts");
    }

    #[test]
    fn default_user_agent_used_without_fragment() {
        let client = HttpPullClient::new("http://example.com:8080/live", "default-ua").unwrap();
        assert_eq!(client.user_agent, "default-ua");
        assert_eq!(client.port, 8080);
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(HttpPullClient::new("rtsp://example.com/stream", "ua").is_err());
    }

    #[test]
    fn double_crlf_scan_finds_header_boundary() {
        let buf = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let pos = find_double_crlf(buf).unwrap();
        assert_eq!(&buf[pos..pos + 4], b"\r\n\r\n");
        assert_eq!(&buf[pos + 4..], b"body");
    }
}
