//! Decrypt status (§6): ECM counters and RTT histogram per CA stream,
//! built directly from the counters `decrypt::key_state::CaStream` already
//! maintains.

use serde::Serialize;

use crate::decrypt::{CaStreamStats, RttHistogram};

/// Serializable mirror of `decrypt::RttHistogram`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RttHistogramView {
    pub le_50: u64,
    pub le_100: u64,
    pub le_250: u64,
    pub le_500: u64,
    pub gt_500: u64,
}

impl From<RttHistogram> for RttHistogramView {
    fn from(h: RttHistogram) -> Self {
        RttHistogramView { le_50: h.le_50, le_100: h.le_100, le_250: h.le_250, le_500: h.le_500, gt_500: h.gt_500 }
    }
}

/// The JSON-shaped per-CA-stream decrypt status described in §6.
#[derive(Debug, Clone, Serialize)]
pub struct DecryptStatus {
    pub ecm_pid: u16,
    pub ecm_sent: u64,
    pub ecm_retry: u64,
    pub ecm_ok_primary: u64,
    pub ecm_ok_backup: u64,
    pub ecm_not_found: u64,
    pub rtt: RttHistogramView,
}

impl DecryptStatus {
    pub fn from_stats(ecm_pid: u16, stats: CaStreamStats) -> Self {
        DecryptStatus {
            ecm_pid,
            ecm_sent: stats.ecm_sent,
            ecm_retry: stats.ecm_retry,
            ecm_ok_primary: stats.ecm_ok_primary,
            ecm_ok_backup: stats.ecm_ok_backup,
            ecm_not_found: stats.ecm_not_found,
            rtt: stats.rtt.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_ca_stream_stats_into_status() {
        let mut stats = CaStreamStats::default();
        stats.ecm_sent = 5;
        stats.ecm_ok_primary = 3;
        stats.rtt.record(std::time::Duration::from_millis(40));
        let status = DecryptStatus::from_stats(0x100, stats);
        assert_eq!(status.ecm_pid, 0x100);
        assert_eq!(status.ecm_sent, 5);
        assert_eq!(status.rtt.le_50, 1);
    }
}
