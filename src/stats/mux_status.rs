//! Mux traffic status (§6): bitrate, NULL-stuffing ratio and PSI cadence.
//! `mux::Mux` itself has no notion of "bytes sent over the last second" —
//! that's a property of the emitter loop driving `process_packet`/`tick_si`,
//! so it's tracked here rather than inside the mux's service-table lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ts::PACKET_SIZE;

/// The JSON-shaped mux status described in §6.
#[derive(Debug, Clone, Serialize)]
pub struct MuxStatus {
    pub bitrate_bps: u64,
    pub null_percent: f64,
    pub psi_interval_ms: u64,
    pub packets_sent: u64,
    pub packets_null: u64,
}

/// Accumulates mux output traffic between snapshots. Call `record` once per
/// emitted batch (service packets plus any CBR NULL stuffing), then
/// `snapshot` on whatever cadence the status endpoint polls at.
pub struct MuxTraffic {
    packets_sent: AtomicU64,
    packets_null: AtomicU64,
    window: Mutex<(Instant, u64, u64)>, // (window_start, sent_at_start, null_at_start)
}

impl MuxTraffic {
    pub fn new() -> Self {
        MuxTraffic {
            packets_sent: AtomicU64::new(0),
            packets_null: AtomicU64::new(0),
            window: Mutex::new((Instant::now(), 0, 0)),
        }
    }

    /// Records `service_packets` non-NULL packets and `null_packets` CBR
    /// stuffing packets emitted in one tick.
    pub fn record(&self, service_packets: u64, null_packets: u64) {
        self.packets_sent.fetch_add(service_packets + null_packets, Ordering::Relaxed);
        self.packets_null.fetch_add(null_packets, Ordering::Relaxed);
    }

    /// Computes bitrate and NULL ratio since the last `snapshot` call (a
    /// rolling window, not a cumulative average), then resets the window.
    pub fn snapshot(&self, psi_interval_ms: u64) -> MuxStatus {
        let sent_total = self.packets_sent.load(Ordering::Relaxed);
        let null_total = self.packets_null.load(Ordering::Relaxed);

        let mut window = self.window.lock();
        let (window_start, sent_at_start, null_at_start) = *window;
        let elapsed = window_start.elapsed();
        let sent_delta = sent_total.saturating_sub(sent_at_start);
        let null_delta = null_total.saturating_sub(null_at_start);

        let bitrate_bps = if elapsed.as_secs_f64() > 0.0 {
            (sent_delta as f64 * PACKET_SIZE as f64 * 8.0 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };
        let null_percent = if sent_delta > 0 { null_delta as f64 * 100.0 / sent_delta as f64 } else { 0.0 };

        *window = (Instant::now(), sent_total, null_total);

        MuxStatus {
            bitrate_bps,
            null_percent,
            psi_interval_ms,
            packets_sent: sent_total,
            packets_null: null_total,
        }
    }
}

impl Default for MuxTraffic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn snapshot_reports_cumulative_totals() {
        let traffic = MuxTraffic::new();
        traffic.record(100, 10);
        traffic.record(50, 0);
        let status = traffic.snapshot(500);
        assert_eq!(status.packets_sent, 160);
        assert_eq!(status.packets_null, 10);
        assert!((status.null_percent - (10.0 * 100.0 / 160.0)).abs() < 0.001);
    }

    #[test]
    fn bitrate_is_zero_with_no_elapsed_window() {
        let traffic = MuxTraffic::new();
        let status = traffic.snapshot(500);
        assert_eq!(status.bitrate_bps, 0);
    }

    #[test]
    fn window_resets_between_snapshots() {
        let traffic = MuxTraffic::new();
        traffic.record(1000, 0);
        std::thread::sleep(Duration::from_millis(10));
        let first = traffic.snapshot(500);
        assert!(first.bitrate_bps > 0);

        let second = traffic.snapshot(500);
        assert_eq!(second.packets_sent, 1000);
    }
}
