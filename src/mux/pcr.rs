//! PCR restamping and continuity-counter rewriting for mux output (§4.4
//! "PCR restamp", "Continuity counter rewrite").

use crate::ts::PCR_MODULUS;

/// Restamps a service's PCR onto the output multiplex's clock. Without
/// smoothing, output PCR tracks elapsed wall time since the restamp anchor
/// (identity path, §8 round-trip law: `Δ_out == Δ_in`). With smoothing, an
/// exponentially-smoothed offset is maintained between the target and input
/// PCR (§4.4).
#[derive(Debug)]
pub struct PcrRestamper {
    anchor_instant: std::time::Instant,
    anchor_pcr: u64,
    smoothing: bool,
    alpha: f64,
    max_offset_ticks: i64,
    offset: f64,
    started: bool,
}

impl PcrRestamper {
    pub fn new(smoothing: bool, alpha: f64, max_offset_ticks: u64) -> Self {
        PcrRestamper {
            anchor_instant: std::time::Instant::now(),
            anchor_pcr: 0,
            smoothing,
            alpha,
            max_offset_ticks: max_offset_ticks as i64,
            offset: 0.0,
            started: false,
        }
    }

    /// Restamps one PCR value read from an input packet.
    pub fn restamp(&mut self, input_pcr: u64) -> u64 {
        if !self.started {
            self.anchor_instant = std::time::Instant::now();
            self.anchor_pcr = input_pcr;
            self.started = true;
        }

        if !self.smoothing {
            let elapsed_us = self.anchor_instant.elapsed().as_micros() as u64;
            return (self.anchor_pcr + elapsed_us * 27) % PCR_MODULUS;
        }

        let elapsed_us = self.anchor_instant.elapsed().as_micros() as u64;
        let target = (self.anchor_pcr + elapsed_us * 27) % PCR_MODULUS;
        let diff = crate::ts::pcr_delta(target, input_pcr) as f64;
        self.offset += self.alpha * (diff - self.offset);
        self.offset = self.offset.clamp(-(self.max_offset_ticks as f64), self.max_offset_ticks as f64);
        let out = input_pcr as i64 + self.offset.round() as i64;
        (out.rem_euclid(PCR_MODULUS as i64)) as u64
    }
}

/// Per-output-PID continuity counter state (§4.4 "Continuity counter rewrite").
#[derive(Debug, Default)]
pub struct CcRewriter {
    counters: std::collections::HashMap<u16, u8>,
}

impl CcRewriter {
    /// Returns the next CC for `pid` and advances its counter mod 16.
    /// Only called for packets carrying payload, per spec.
    pub fn next(&mut self, pid: u16) -> u8 {
        let cc = self.counters.entry(pid).or_insert(0);
        let value = *cc;
        *cc = (*cc + 1) & 0x0f;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cc_rewriter_increments_mod_16_per_pid() {
        let mut cc = CcRewriter::default();
        let seq: Vec<u8> = (0..20).map(|_| cc.next(0x100)).collect();
        for w in seq.windows(2) {
            assert_eq!((w[1] as i32 - w[0] as i32).rem_euclid(16), 1);
        }
    }

    #[test]
    fn cc_rewriter_is_independent_per_pid() {
        let mut cc = CcRewriter::default();
        assert_eq!(cc.next(0x100), 0);
        assert_eq!(cc.next(0x200), 0);
        assert_eq!(cc.next(0x100), 1);
    }

    #[test]
    fn restamp_without_smoothing_tracks_elapsed_time() {
        let mut restamper = PcrRestamper::new(false, 0.0, 0);
        let first = restamper.restamp(1000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = restamper.restamp(50_000);
        let delta = crate::ts::pcr_delta(second, first);
        // ~5ms * 27000 ticks/ms, allow generous scheduling slack.
        assert!(delta > 50_000);
        assert!(delta < 27_000_000);
    }

    #[test]
    fn smoothing_keeps_offset_bounded() {
        let mut restamper = PcrRestamper::new(true, 0.1, 1_000);
        let mut last = restamper.restamp(0);
        for i in 1..50 {
            let input_pcr = i * 2_700; // simulate a faster input clock
            let out = restamper.restamp(input_pcr);
            let delta = crate::ts::pcr_delta(out, last);
            assert!(delta.abs() < 10_000);
            last = out;
        }
    }
}
