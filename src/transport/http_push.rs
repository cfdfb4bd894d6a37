//! HTTP push output (§6): writes the `200 OK` response headers, then
//! streams raw TS read straight off a `ring::RingBuffer` reader, the same
//! reader API a live client connection uses internally.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::ring::{ReadOutcome, RingBuffer};

/// Streams one client's worth of raw TS over an already-accepted
/// `TcpStream`, anchored at the ring buffer's smart-start position.
pub struct HttpPushServer {
    stream: TcpStream,
    content_type: &'static str,
}

impl HttpPushServer {
    pub fn new(stream: TcpStream, generic_octet_stream: bool) -> Self {
        HttpPushServer {
            stream,
            content_type: if generic_octet_stream { "application/octet-stream" } else { "video/MP2T" },
        }
    }

    /// Writes the response header line, then streams packets from `ring`
    /// until the client disconnects or the stream closes. Blocks the
    /// calling task; callers spawn one of these per accepted connection.
    pub async fn serve(mut self, ring: Arc<RingBuffer>) -> Result<()> {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\nCache-Control: no-cache\r\n\r\n",
            self.content_type
        );
        self.stream.write_all(header.as_bytes()).await?;

        let mut reader = ring.acquire_reader();
        loop {
            if ring.is_closing() {
                return Ok(());
            }
            match ring.read_next(&mut reader) {
                ReadOutcome::Packet(packet) => {
                    if let Err(e) = self.stream.write_all(&packet).await {
                        if e.kind() == std::io::ErrorKind::BrokenPipe || e.kind() == std::io::ErrorKind::ConnectionReset {
                            return Ok(());
                        }
                        return Err(e.into());
                    }
                }
                ReadOutcome::LagDrop(skipped) => {
                    log::warn!("http push client lagged, dropped {} packets", skipped);
                }
                ReadOutcome::Resynced => {
                    log::warn!("http push client resynced to current write position");
                }
                ReadOutcome::Wait => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    #[tokio::test]
    async fn writes_mp2t_content_type_header_before_streaming() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ring = Arc::new(RingBuffer::new(StreamConfig::default()));
            ring.close();
            let server = HttpPushServer::new(stream, false);
            let _ = server.serve(ring).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 256];
        use tokio::io::AsyncReadExt;
        let n = client.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("video/MP2T"));
        assert!(text.contains("200 OK"));

        server_task.await.unwrap();
    }
}
