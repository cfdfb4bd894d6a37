//! PCR-block pacing math (§4.6 "Algorithm"): scans for two successive
//! packets with PCR-carrying adaptation fields on the same PID and derives
//! the wall-clock time that block of packets should take to send.

use crate::ts::header::{AdaptationField, TsHeader};
use crate::ts::{pcr_delta, PACKET_SIZE, PCR_HZ};

/// A timed block of output: how many packets elapsed between two PCRs, and
/// how long (wall clock) that span should take to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacedBlock {
    pub packet_count: usize,
    pub block_time_us: u64,
}

/// Locks onto the first PID that carries a PCR and derives pacing blocks
/// from successive PCRs on that PID. Out-of-range or zero-length blocks are
/// rejected and logged rather than applied (§4.6).
pub struct PcrPacer {
    pcr_pid: Option<u16>,
    pending: Option<(u64, usize)>,
}

impl PcrPacer {
    pub fn new() -> Self {
        PcrPacer { pcr_pid: None, pending: None }
    }

    pub fn pcr_pid(&self) -> Option<u16> {
        self.pcr_pid
    }

    /// Feeds one packet at stream position `index` (a monotonically
    /// increasing packet counter, not necessarily contiguous with gaps
    /// removed). Returns a `PacedBlock` once two successive same-PID PCRs
    /// have been observed and the resulting block passes validation.
    pub fn observe(&mut self, packet: &[u8; PACKET_SIZE], index: usize) -> Option<PacedBlock> {
        let header = TsHeader::parse(packet).ok()?;
        if !header.adaptation_field_exists {
            return None;
        }
        let af = AdaptationField::parse(&header, packet).ok()??;
        let pcr = af.pcr?;

        match self.pcr_pid {
            None => {
                self.pcr_pid = Some(header.pid);
                self.pending = Some((pcr, index));
                None
            }
            Some(pid) if pid == header.pid => {
                let (prev_pcr, prev_index) = self.pending.replace((pcr, index))?;
                let packet_count = index.saturating_sub(prev_index);
                if packet_count == 0 {
                    return None;
                }
                let delta = pcr_delta(pcr, prev_pcr);
                if delta <= 0 {
                    return None;
                }
                let block_time_us = (delta as u64) * 1_000_000 / PCR_HZ;
                if block_time_us == 0 || block_time_us > 500_000 {
                    log::warn!(
                        "sync pacer rejected pcr block: packets={} block_time_us={}",
                        packet_count,
                        block_time_us
                    );
                    return None;
                }
                Some(PacedBlock { packet_count, block_time_us })
            }
            Some(_) => None,
        }
    }
}

impl Default for PcrPacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_with_pcr(pid: u16, pcr: u64) -> [u8; PACKET_SIZE] {
        let mut p = [0xffu8; PACKET_SIZE];
        p[0] = crate::ts::SYNC_BYTE;
        p[1] = 0x20 | ((pid >> 8) as u8 & 0x1f);
        p[2] = pid as u8;
        p[3] = 0x20; // adaptation field present, no payload
        p[4] = 7; // adaptation field length
        p[5] = 0x10; // pcr_flag
        let encoded = crate::ts::header::encode_pcr(pcr);
        p[6..12].copy_from_slice(&encoded);
        p
    }

    #[test]
    fn first_pcr_establishes_pid_with_no_block() {
        let mut pacer = PcrPacer::new();
        assert!(pacer.observe(&packet_with_pcr(0x100, 1000), 0).is_none());
        assert_eq!(pacer.pcr_pid(), Some(0x100));
    }

    #[test]
    fn second_pcr_on_same_pid_yields_a_block() {
        let mut pacer = PcrPacer::new();
        pacer.observe(&packet_with_pcr(0x100, 0), 0);
        let block = pacer.observe(&packet_with_pcr(0x100, 27_000_000), 100).unwrap();
        assert_eq!(block.packet_count, 100);
        assert_eq!(block.block_time_us, 1_000_000);
    }

    #[test]
    fn different_pid_is_ignored_once_locked() {
        let mut pacer = PcrPacer::new();
        pacer.observe(&packet_with_pcr(0x100, 0), 0);
        assert!(pacer.observe(&packet_with_pcr(0x200, 27_000_000), 50).is_none());
    }

    #[test]
    fn oversized_block_time_is_rejected() {
        let mut pacer = PcrPacer::new();
        pacer.observe(&packet_with_pcr(0x100, 0), 0);
        // 600ms worth of PCR ticks, over the 500ms cap.
        let block = pacer.observe(&packet_with_pcr(0x100, 27_000_000 * 6 / 10), 10);
        assert!(block.is_none());
    }
}
