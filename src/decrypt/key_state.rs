//! Per-ECM-PID key schedule state (§3 "CA Stream"): active/candidate
//! control words, ECM retry backoff, and observability counters.

use std::time::{Duration, Instant};

/// Which half(s) of the 16-byte key a staged candidate changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMask {
    Even,
    Odd,
    Both,
}

const CANDIDATE_MAX_AGE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct CandidateKey {
    key: [u8; 16],
    mask: KeyMask,
    cand_ok: u32,
    cand_fail: u32,
    staged_at: Instant,
}

/// RTT histogram buckets per §6 observability: {<=50, <=100, <=250, <=500, >500 ms}.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttHistogram {
    pub le_50: u64,
    pub le_100: u64,
    pub le_250: u64,
    pub le_500: u64,
    pub gt_500: u64,
}

impl RttHistogram {
    pub fn record(&mut self, rtt: Duration) {
        let ms = rtt.as_millis();
        if ms <= 50 {
            self.le_50 += 1;
        } else if ms <= 100 {
            self.le_100 += 1;
        } else if ms <= 250 {
            self.le_250 += 1;
        } else if ms <= 500 {
            self.le_500 += 1;
        } else {
            self.gt_500 += 1;
        }
    }
}

/// ECM send/retry/keepalive counters (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct CaStreamStats {
    pub ecm_sent: u64,
    pub ecm_retry: u64,
    pub ecm_ok_primary: u64,
    pub ecm_ok_backup: u64,
    pub ecm_not_found: u64,
    pub rtt: RttHistogram,
}

/// Whether the candidate key was accepted, rejected, or is still pending
/// (§3 "Key guard").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Accepted,
    Rejected,
    Pending,
}

/// Tracks one ECM PID's key schedule and retry state. The active key is
/// never overwritten except via the staged-candidate acceptance path when
/// key_guard is enabled (§3 invariant).
#[derive(Debug, Clone)]
pub struct CaStream {
    pub ecm_pid: u16,
    active_key: [u8; 16],
    has_active_key: bool,
    candidate: Option<CandidateKey>,
    last_send: Option<Instant>,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    pub stats: CaStreamStats,
}

impl CaStream {
    pub fn new(ecm_pid: u16) -> Self {
        CaStream {
            ecm_pid,
            active_key: [0u8; 16],
            has_active_key: false,
            candidate: None,
            last_send: None,
            consecutive_failures: 0,
            last_success: None,
            stats: CaStreamStats::default(),
        }
    }

    pub fn has_active_key(&self) -> bool {
        self.has_active_key
    }

    pub fn even_key(&self) -> [u8; 8] {
        self.active_key[0..8].try_into().unwrap()
    }

    pub fn odd_key(&self) -> [u8; 8] {
        self.active_key[8..16].try_into().unwrap()
    }

    /// Installs a static clear key directly (BISS path, §6 `biss`). Bypasses
    /// key_guard — a configured constant is trusted immediately, and by the
    /// §9 Open Question resolution the same 8 bytes are installed into both
    /// halves (even == odd), which a stats/consumer surface should flag as a
    /// degenerate "single static key" case rather than silently succeeding.
    pub fn install_static_key(&mut self, key: [u8; 8]) {
        self.active_key[0..8].copy_from_slice(&key);
        self.active_key[8..16].copy_from_slice(&key);
        self.has_active_key = true;
    }

    /// Computes which half(s) of `new_cws` changed relative to the active
    /// key, by comparing the unchanged-half checksum; defaults to "both"
    /// when nothing is established yet (§3 step 3).
    fn diff_mask(&self, new_cws: &[u8; 16]) -> KeyMask {
        if !self.has_active_key {
            return KeyMask::Both;
        }
        let even_same = new_cws[0..8] == self.active_key[0..8];
        let odd_same = new_cws[8..16] == self.active_key[8..16];
        match (even_same, odd_same) {
            (true, false) => KeyMask::Odd,
            (false, true) => KeyMask::Even,
            _ => KeyMask::Both,
        }
    }

    /// Stages a CAM-supplied CW pair as a candidate, or applies it
    /// immediately when key_guard is disabled (§3 step 4).
    pub fn offer_cws(&mut self, new_cws: [u8; 16], key_guard_enabled: bool) {
        if !key_guard_enabled {
            self.active_key = new_cws;
            self.has_active_key = true;
            self.candidate = None;
            return;
        }
        let mask = self.diff_mask(&new_cws);
        self.candidate = Some(CandidateKey { key: new_cws, mask, cand_ok: 0, cand_fail: 0, staged_at: Instant::now() });
    }

    /// Returns the candidate key schedule to probe against, if one is
    /// staged and not yet expired (§3 "Candidates older than 10s are
    /// discarded").
    pub fn candidate_for_probe(&mut self) -> Option<[u8; 16]> {
        if let Some(c) = &self.candidate {
            if c.staged_at.elapsed() > CANDIDATE_MAX_AGE {
                self.candidate = None;
                return None;
            }
            return Some(c.key);
        }
        None
    }

    /// Records one key-guard probe result (§3 "Key guard"): accept at
    /// cand_ok >= 2, reject at cand_fail >= 2, otherwise keep waiting.
    pub fn record_probe(&mut self, ok: bool) -> ProbeOutcome {
        let Some(candidate) = &mut self.candidate else { return ProbeOutcome::Pending };
        if ok {
            candidate.cand_ok += 1;
        } else {
            candidate.cand_fail += 1;
        }
        if candidate.cand_ok >= 2 {
            self.active_key = candidate.key;
            self.has_active_key = true;
            self.candidate = None;
            ProbeOutcome::Accepted
        } else if candidate.cand_fail >= 2 {
            self.candidate = None;
            ProbeOutcome::Rejected
        } else {
            ProbeOutcome::Pending
        }
    }

    /// Adaptive ECM retry/keepalive backoff (§3 step 1): `min(2s, 250ms *
    /// 2^min(fails,3))` plus per-PID deterministic jitter, falling back to a
    /// 2s keepalive once a stream is stable (no recent failures).
    pub fn should_send_ecm(&self, now: Instant) -> bool {
        let Some(last) = self.last_send else { return true };
        let interval = self.retry_interval();
        now.duration_since(last) >= interval
    }

    fn retry_interval(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return KEEPALIVE_INTERVAL + self.jitter();
        }
        let exp = self.consecutive_failures.min(3);
        let backoff = Duration::from_millis(250) * (1u32 << exp);
        backoff.min(Duration::from_secs(2)) + self.jitter()
    }

    /// Deterministic per-PID jitter in [0, 53) ms, so many streams retrying
    /// at once don't all hit the CAM in lockstep.
    fn jitter(&self) -> Duration {
        Duration::from_millis((self.ecm_pid % 53) as u64)
    }

    pub fn note_ecm_sent(&mut self, now: Instant) {
        self.last_send = Some(now);
        self.stats.ecm_sent += 1;
        if self.consecutive_failures > 0 {
            self.stats.ecm_retry += 1;
        }
    }

    pub fn note_ecm_success(&mut self, rtt: Duration, via_backup: bool) {
        self.consecutive_failures = 0;
        self.last_success = Some(Instant::now());
        self.stats.rtt.record(rtt);
        if via_backup {
            self.stats.ecm_ok_backup += 1;
        } else {
            self.stats.ecm_ok_primary += 1;
        }
    }

    pub fn note_ecm_not_found(&mut self) {
        self.consecutive_failures += 1;
        self.stats.ecm_not_found += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_without_key_guard_applies_immediately() {
        let mut stream = CaStream::new(0x100);
        stream.offer_cws([1u8; 16], false);
        assert!(stream.has_active_key());
        assert_eq!(stream.even_key(), [1u8; 8]);
    }

    #[test]
    fn key_guard_requires_two_successful_probes() {
        let mut stream = CaStream::new(0x100);
        stream.offer_cws([2u8; 16], true);
        assert!(!stream.has_active_key());
        assert_eq!(stream.record_probe(true), ProbeOutcome::Pending);
        assert_eq!(stream.record_probe(true), ProbeOutcome::Accepted);
        assert!(stream.has_active_key());
    }

    #[test]
    fn key_guard_rejects_after_two_failures() {
        let mut stream = CaStream::new(0x100);
        stream.offer_cws([3u8; 16], true);
        assert_eq!(stream.record_probe(false), ProbeOutcome::Pending);
        assert_eq!(stream.record_probe(false), ProbeOutcome::Rejected);
        assert!(!stream.has_active_key());
        assert!(stream.candidate_for_probe().is_none());
    }

    #[test]
    fn diff_mask_detects_single_half_change() {
        let mut stream = CaStream::new(0x100);
        stream.offer_cws([1u8; 16], false);
        let mut new_cws = [1u8; 16];
        new_cws[8..16].copy_from_slice(&[9u8; 8]);
        assert_eq!(stream.diff_mask(&new_cws), KeyMask::Odd);
    }

    #[test]
    fn backoff_increases_with_consecutive_failures() {
        let mut stream = CaStream::new(0x100);
        let base = stream.retry_interval();
        stream.consecutive_failures = 3;
        let backed_off = stream.retry_interval();
        assert!(backed_off >= base);
    }

    #[test]
    fn static_key_installs_same_value_into_both_halves() {
        let mut stream = CaStream::new(0x100);
        stream.install_static_key([7u8; 8]);
        assert_eq!(stream.even_key(), stream.odd_key());
    }
}
