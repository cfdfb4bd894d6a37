//! UDP/RTP sync output (§4.6, §6): packs seven 188-byte TS packets into one
//! 1316-byte datagram, optionally prefixed with a 12-byte RTP header
//! (version 2, payload type 33/MP2T, wallclock-ms timestamp, fixed SSRC).
//! Shaped after the teacher's `format::rtp::RTPPacket` header layout, but
//! written directly rather than going through that struct: the sync path
//! only ever emits MP2T payloads, never needs `RTPPacket::parse`'s jitter
//! buffer or extension-header handling.

use std::net::SocketAddr;

use rand::Rng;
use tokio::net::UdpSocket;

use crate::error::Result;
use crate::sync::BatchSender;
use crate::ts::PACKET_SIZE;

const PACKETS_PER_DATAGRAM: usize = 7;
const RTP_VERSION: u8 = 2;
const RTP_PAYLOAD_TYPE_MP2T: u8 = 33;

/// Sends paced TS batches as UDP datagrams, optionally RTP-framed.
pub struct UdpRtpOutput {
    socket: UdpSocket,
    dest: SocketAddr,
    rtp_enabled: bool,
    ssrc: u32,
    sequence: u16,
}

impl UdpRtpOutput {
    /// Binds an ephemeral local socket and targets `dest`. `ttl` sets the
    /// outgoing multicast/unicast TTL; `send_buffer_bytes`, when given,
    /// widens the kernel send buffer for bursty batches.
    pub async fn connect(dest: SocketAddr, ttl: u32, send_buffer_bytes: Option<u32>, rtp_enabled: bool) -> Result<Self> {
        let bind_addr: SocketAddr = if dest.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_ttl(ttl)?;

        if let Some(bytes) = send_buffer_bytes {
            set_send_buffer_size(&socket, bytes)?;
        }

        let ssrc: u32 = rand::thread_rng().gen();

        Ok(UdpRtpOutput { socket, dest, rtp_enabled, ssrc, sequence: 0 })
    }

    fn build_rtp_header(&mut self, timestamp_ms: u32) -> [u8; 12] {
        let mut header = [0u8; 12];
        header[0] = (RTP_VERSION << 6) & 0xc0;
        header[1] = RTP_PAYLOAD_TYPE_MP2T & 0x7f;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp_ms.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    fn pack_datagram(&mut self, packets: &[[u8; PACKET_SIZE]]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(12 + packets.len() * PACKET_SIZE);
        if self.rtp_enabled {
            let timestamp_ms = now_ms();
            datagram.extend_from_slice(&self.build_rtp_header(timestamp_ms));
        }
        for packet in packets {
            datagram.extend_from_slice(packet);
        }
        datagram
    }
}

fn now_ms() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

#[cfg(unix)]
fn set_send_buffer_size(socket: &UdpSocket, bytes: u32) -> Result<()> {
    use std::os::unix::io::{AsRawFd, FromRawFd};
    let sock2 = unsafe { socket2::Socket::from_raw_fd(socket.as_raw_fd()) };
    sock2.set_send_buffer_size(bytes as usize).map_err(crate::error::TsRelayError::Io)?;
    std::mem::forget(sock2); // borrowed fd, don't let Socket close it on drop.
    Ok(())
}

#[cfg(not(unix))]
fn set_send_buffer_size(_socket: &UdpSocket, _bytes: u32) -> Result<()> {
    Ok(())
}

impl BatchSender for UdpRtpOutput {
    fn send_batch(&mut self, packets: &[[u8; PACKET_SIZE]]) -> Result<()> {
        for chunk in packets.chunks(PACKETS_PER_DATAGRAM) {
            let datagram = self.pack_datagram(chunk);
            let dest = self.dest;
            let socket = &self.socket;
            let send = socket.try_send_to(&datagram, dest);
            if let Err(e) = send {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_header_carries_version_payload_type_and_monotonic_sequence() {
        let mut out = UdpRtpOutput {
            socket: {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async { UdpSocket::bind("127.0.0.1:0").await.unwrap() })
            },
            dest: "127.0.0.1:9999".parse().unwrap(),
            rtp_enabled: true,
            ssrc: 0xdeadbeef,
            sequence: 0,
        };
        let h0 = out.build_rtp_header(1000);
        let h1 = out.build_rtp_header(1000);
        assert_eq!(h0[0] >> 6, 2);
        assert_eq!(h0[1] & 0x7f, 33);
        assert_eq!(u16::from_be_bytes([h0[2], h0[3]]), 0);
        assert_eq!(u16::from_be_bytes([h1[2], h1[3]]), 1);
        assert_eq!(u32::from_be_bytes([h0[8], h0[9], h0[10], h0[11]]), 0xdeadbeef);
    }

    #[test]
    fn pack_datagram_without_rtp_is_bare_ts_packets() {
        let mut out = UdpRtpOutput {
            socket: {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async { UdpSocket::bind("127.0.0.1:0").await.unwrap() })
            },
            dest: "127.0.0.1:9999".parse().unwrap(),
            rtp_enabled: false,
            ssrc: 0,
            sequence: 0,
        };
        let packets = [[0x47u8; PACKET_SIZE]; 7];
        let datagram = out.pack_datagram(&packets);
        assert_eq!(datagram.len(), 7 * PACKET_SIZE);
    }

    #[test]
    fn pack_datagram_with_rtp_prefixes_twelve_byte_header() {
        let mut out = UdpRtpOutput {
            socket: {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async { UdpSocket::bind("127.0.0.1:0").await.unwrap() })
            },
            dest: "127.0.0.1:9999".parse().unwrap(),
            rtp_enabled: true,
            ssrc: 1,
            sequence: 0,
        };
        let packets = [[0x47u8; PACKET_SIZE]; 7];
        let datagram = out.pack_datagram(&packets);
        assert_eq!(datagram.len(), 12 + 7 * PACKET_SIZE);
    }
}
