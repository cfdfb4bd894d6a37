//! CSA decryption pipeline (§4.5): per-ECM-PID key schedule, CAM dispatch
//! with primary/backup hedging, key-guard candidate validation, and batch
//! descrambling. One [`DecryptContext`] corresponds to one `DecryptConfig`
//! entry (one ECM PID; BISS clear-key streams skip the CAM entirely).

pub mod batch;
pub mod cam;
pub mod cipher;
pub mod key_guard;
pub mod key_state;
pub mod shift;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::DecryptConfig;
use crate::error::Result;
use crate::ts::header::TsHeader;
use crate::ts::PACKET_SIZE;

use cam::{CamDispatcher, DispatchResult, EcmResponse};
use cipher::CsaCipher;
use key_state::CaStream;
use shift::ShiftBuffer;

pub use cam::CamClient;
pub use cipher::{NullCsaCipher, Parity};
pub use key_state::{CaStreamStats, ProbeOutcome, RttHistogram};

fn parse_biss_hex(s: &str) -> Option<[u8; 8]> {
    if s.len() != 16 {
        return None;
    }
    let mut key = [0u8; 8];
    for i in 0..8 {
        key[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key)
}

/// One decrypt context: the CA stream for a single ECM PID, the CAM
/// dispatcher behind it, and the cipher backend used for key-guard probing
/// and batch descrambling.
pub struct DecryptContext {
    config: DecryptConfig,
    cam: CamDispatcher,
    cipher: Arc<dyn CsaCipher>,
    stream: Mutex<CaStream>,
    shift: Option<Mutex<ShiftBuffer>>,
}

impl DecryptContext {
    /// `assumed_bitrate_bps` only sizes the optional shift buffer (§4.5); it
    /// plays no other role in decryption.
    pub fn new(config: DecryptConfig, cam: CamDispatcher, cipher: Arc<dyn CsaCipher>, assumed_bitrate_bps: u64) -> Self {
        let mut stream = CaStream::new(config.ecm_pid);
        if let Some(biss) = config.biss.as_deref().and_then(parse_biss_hex) {
            stream.install_static_key(biss);
        }
        let shift = ShiftBuffer::new(config.shift_ms, assumed_bitrate_bps).map(Mutex::new);
        DecryptContext { config, cam, cipher, stream: Mutex::new(stream), shift }
    }

    pub fn ecm_pid(&self) -> u16 {
        self.config.ecm_pid
    }

    pub fn stats(&self) -> CaStreamStats {
        self.stream.lock().stats
    }

    /// Handles one ECM section observed on `ecm_pid` (table_id 0x80/0x81,
    /// CA descriptor already matched by the caller): respects the adaptive
    /// retry/keepalive window, dispatches through the CAM, and stages or
    /// applies the resulting CWs (§3 steps 1-4).
    pub async fn handle_ecm(&self, ecm_data: &[u8]) -> Result<()> {
        if self.config.biss.is_some() {
            return Ok(());
        }

        let now = Instant::now();
        if !self.stream.lock().should_send_ecm(now) {
            return Ok(());
        }
        self.stream.lock().note_ecm_sent(now);

        match self.cam.dispatch_ecm(self.config.ecm_pid, ecm_data).await {
            Ok(DispatchResult { response: EcmResponse::Found { even_cw, odd_cw }, via_backup, rtt }) => {
                let mut cws = [0u8; 16];
                cws[0..8].copy_from_slice(&even_cw);
                cws[8..16].copy_from_slice(&odd_cw);
                let mut stream = self.stream.lock();
                stream.note_ecm_success(rtt, via_backup);
                stream.offer_cws(cws, self.config.key_guard);
            }
            Ok(DispatchResult { response: EcmResponse::NotFound, .. }) => {
                self.stream.lock().note_ecm_not_found();
            }
            Err(_) => {
                self.stream.lock().note_ecm_not_found();
            }
        }
        Ok(())
    }

    /// Runs the key-guard probe (when a candidate is staged) over the
    /// batch, then descrambles every scrambled packet in place with the
    /// current active key. Returns the number of packets descrambled.
    pub fn process_packets(&self, packets: &mut [[u8; PACKET_SIZE]]) -> Result<usize> {
        let (even_key, odd_key, has_key) = {
            let mut stream = self.stream.lock();
            for packet in packets.iter() {
                let header = TsHeader::parse(packet)?;
                if key_guard::is_probe_candidate(&header) {
                    key_guard::probe(self.cipher.as_ref(), &mut stream, &header, packet);
                }
            }
            (stream.even_key(), stream.odd_key(), stream.has_active_key())
        };

        if !has_key {
            return Ok(0);
        }
        batch::decrypt_batch(self.cipher.as_ref(), &even_key, &odd_key, packets)
    }

    /// Releases `incoming` through the shift buffer (when `shift_ms > 0`)
    /// and runs `process_packets` on whatever comes out the other end this
    /// round. Without a configured shift buffer, every incoming packet is
    /// released immediately (§4.5 "packets traverse shift buffer before
    /// entering the decrypt stage").
    pub fn shift_and_process(&self, incoming: &[[u8; PACKET_SIZE]]) -> Result<Vec<[u8; PACKET_SIZE]>> {
        let mut released: Vec<[u8; PACKET_SIZE]> = match &self.shift {
            Some(shift) => {
                let mut shift = shift.lock();
                incoming.iter().filter_map(|p| shift.push(*p)).collect()
            }
            None => incoming.to_vec(),
        };
        self.process_packets(&mut released)?;
        Ok(released)
    }

    /// Flushes any packets still held in the shift buffer (stream close),
    /// running them through decrypt on the way out.
    pub fn flush_shift(&self) -> Result<Vec<[u8; PACKET_SIZE]>> {
        let Some(shift) = &self.shift else { return Ok(Vec::new()) };
        let mut drained = shift.lock().drain();
        self.process_packets(&mut drained)?;
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubCam {
        response: EcmResponse,
    }

    #[async_trait]
    impl CamClient for StubCam {
        async fn send_ecm(&self, _ecm_pid: u16, _ecm_data: &[u8]) -> Result<EcmResponse> {
            Ok(self.response.clone())
        }
    }

    fn ctx_with_response(response: EcmResponse, key_guard: bool) -> DecryptContext {
        let cam = CamDispatcher::new(Arc::new(StubCam { response }), None, 0);
        let config = DecryptConfig { ecm_pid: 0x100, key_guard, ..Default::default() };
        DecryptContext::new(config, cam, Arc::new(NullCsaCipher), 4_000_000)
    }

    #[tokio::test]
    async fn found_response_without_key_guard_applies_key_immediately() {
        let ctx = ctx_with_response(EcmResponse::Found { even_cw: [1; 8], odd_cw: [2; 8] }, false);
        ctx.handle_ecm(&[0u8; 4]).await.unwrap();
        assert!(ctx.stream.lock().has_active_key());
        assert_eq!(ctx.stats().ecm_ok_primary, 1);
    }

    #[tokio::test]
    async fn not_found_response_increments_counter_without_key() {
        let ctx = ctx_with_response(EcmResponse::NotFound, false);
        ctx.handle_ecm(&[0u8; 4]).await.unwrap();
        assert!(!ctx.stream.lock().has_active_key());
        assert_eq!(ctx.stats().ecm_not_found, 1);
    }

    #[test]
    fn biss_context_installs_static_key_and_skips_cam() {
        let cam = CamDispatcher::new(Arc::new(StubCam { response: EcmResponse::NotFound }), None, 0);
        let config = DecryptConfig { ecm_pid: 0x100, biss: Some("0011223344556677".to_string()), ..Default::default() };
        let ctx = DecryptContext::new(config, cam, Arc::new(NullCsaCipher), 4_000_000);
        assert!(ctx.stream.lock().has_active_key());
    }

    #[test]
    fn shift_buffer_delays_packets_before_they_reach_decrypt() {
        let cam = CamDispatcher::new(Arc::new(StubCam { response: EcmResponse::NotFound }), None, 0);
        let config = DecryptConfig { ecm_pid: 0x100, shift_ms: 10, ..Default::default() };
        let ctx = DecryptContext::new(config, cam, Arc::new(NullCsaCipher), 4_000_000);

        let cap = ctx.shift.as_ref().unwrap().lock().capacity_packets();
        let fill = vec![[0u8; PACKET_SIZE]; cap];
        let released = ctx.shift_and_process(&fill).unwrap();
        assert!(released.is_empty(), "buffer should still be filling, nothing released yet");

        let released = ctx.shift_and_process(&[[0u8; PACKET_SIZE]]).unwrap();
        assert_eq!(released.len(), 1, "one packet released once the buffer is at capacity");

        let flushed = ctx.flush_shift().unwrap();
        assert_eq!(flushed.len(), cap, "flush drains every packet still queued");
    }

    #[test]
    fn zero_shift_ms_releases_packets_immediately() {
        let cam = CamDispatcher::new(Arc::new(StubCam { response: EcmResponse::NotFound }), None, 0);
        let config = DecryptConfig { ecm_pid: 0x100, ..Default::default() };
        let ctx = DecryptContext::new(config, cam, Arc::new(NullCsaCipher), 4_000_000);
        assert!(ctx.shift.is_none());

        let released = ctx.shift_and_process(&[[0u8; PACKET_SIZE]; 3]).unwrap();
        assert_eq!(released.len(), 3);
    }
}
