//! External interfaces (§6): the traits every ingest/output transport
//! implements, plus the four concrete transports the relay core ships with.
//! `HttpPullClient` is built the way the teacher's
//! `format::rtsp::connection::RTSPConnection` is built — a raw `TcpStream`
//! plus a hand-rolled header scanner — generalized from RTSP's double-CRLF
//! response detector to HTTP chunked/`Content-Length` framing.

pub mod http_pull;
pub mod http_push;
pub mod rtp_output;
pub mod udp_multicast;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use http_pull::HttpPullClient;
pub use http_push::HttpPushServer;
pub use rtp_output::UdpRtpOutput;
pub use udp_multicast::UdpMulticastIngest;

/// One chunk of raw bytes pulled from an inbound transport. Chunk boundaries
/// carry no TS-alignment guarantee; `ring::RingBuffer::feed` resyncs on the
/// 0x47 sync byte regardless of how chunks are split.
#[async_trait]
pub trait Inbound: Send {
    /// Reads the next available chunk, blocking until data arrives or the
    /// transport is closed/errors.
    async fn next_chunk(&mut self) -> Result<Bytes>;
}

/// One outbound datagram/write. Mirrors the teacher's `av::Demuxer`/`Muxer`
/// split: a single `send` method, transport framing is the implementor's
/// concern.
#[async_trait]
pub trait Outbound: Send {
    /// Sends one fully-framed datagram (or buffer, for stream transports).
    async fn send(&mut self, datagram: &[u8]) -> Result<()>;
}
