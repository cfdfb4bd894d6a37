//! Per-stream status (§6): state/last_error/input metrics live here since
//! `ring::RingBuffer` itself only knows about packet storage, not input
//! health or failover history — those are tracked alongside it by whatever
//! drives the ingest thread.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ring::{RingBuffer, SmartStartDebug};

/// Coarse health state surfaced in status output (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamState {
    Ok,
    Probing,
    Down,
}

/// Per-input counters backing the `input metrics` field of §6's per-stream
/// status (one entry per configured `InputConfig`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct InputMetric {
    pub id: String,
    pub bytes_received: u64,
    pub connected: bool,
    pub last_error: Option<String>,
}

/// The JSON-shaped per-stream status described in §6.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub last_error: Option<String>,
    pub last_ok_timestamp: Option<DateTime<Utc>>,
    pub write_index: u64,
    pub capacity: usize,
    pub clients_connected: usize,
    pub active_input_index: Option<usize>,
    pub inputs: Vec<InputMetric>,
    pub smart_start_ready: bool,
    pub last_start_debug: Option<SmartStartDebugView>,
}

/// Serializable mirror of `ring::SmartStartDebug` (the ring type doesn't
/// derive `Serialize` itself since it's an internal debug record, not a
/// wire/status type).
#[derive(Debug, Clone, Serialize)]
pub struct SmartStartDebugView {
    pub mode: &'static str,
    pub keyframe_index: Option<u64>,
    pub pat_index: Option<u64>,
    pub pmt_index: Option<u64>,
    pub pcr_index: Option<u64>,
    pub paramset_index: Option<u64>,
    pub desync_ms: Option<i64>,
    pub score: Option<i64>,
    pub chosen_index: u64,
}

impl From<&SmartStartDebug> for SmartStartDebugView {
    fn from(d: &SmartStartDebug) -> Self {
        SmartStartDebugView {
            mode: match d.mode {
                crate::ring::StartMode::SmartCheckpoint => "smart_checkpoint",
                crate::ring::StartMode::FallbackOffset => "fallback_offset",
            },
            keyframe_index: d.keyframe_index,
            pat_index: d.pat_index,
            pmt_index: d.pmt_index,
            pcr_index: d.pcr_index,
            paramset_index: d.paramset_index,
            desync_ms: d.desync_ms,
            score: d.score,
            chosen_index: d.chosen_index,
        }
    }
}

struct TrackerInner {
    state: StreamState,
    last_error: Option<String>,
    last_ok_timestamp: Option<DateTime<Utc>>,
    active_input_index: Option<usize>,
    inputs: Vec<InputMetric>,
}

/// Tracks the health fields `ring::RingBuffer` doesn't: current state, last
/// error, which input is currently feeding the buffer, and per-input byte
/// counters. One instance per stream, held next to its `RingBuffer`.
pub struct StreamTracker {
    inner: Mutex<TrackerInner>,
}

impl StreamTracker {
    pub fn new(input_ids: impl IntoIterator<Item = String>) -> Self {
        let inputs = input_ids
            .into_iter()
            .map(|id| InputMetric { id, ..Default::default() })
            .collect();
        StreamTracker {
            inner: Mutex::new(TrackerInner {
                state: StreamState::Down,
                last_error: None,
                last_ok_timestamp: None,
                active_input_index: None,
                inputs,
            }),
        }
    }

    pub fn mark_ok(&self, active_input_index: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = StreamState::Ok;
        inner.active_input_index = Some(active_input_index);
        inner.last_ok_timestamp = Some(Utc::now());
        inner.last_error = None;
        if let Some(input) = inner.inputs.get_mut(active_input_index) {
            input.connected = true;
            input.last_error = None;
        }
    }

    pub fn mark_probing(&self) {
        self.inner.lock().unwrap().state = StreamState::Probing;
    }

    pub fn mark_down(&self, input_index: Option<usize>, error: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let message = error.into();
        inner.state = StreamState::Down;
        inner.last_error = Some(message.clone());
        if let Some(idx) = input_index {
            if let Some(input) = inner.inputs.get_mut(idx) {
                input.connected = false;
                input.last_error = Some(message);
            }
        }
    }

    pub fn record_input_bytes(&self, input_index: usize, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(input) = inner.inputs.get_mut(input_index) {
            input.bytes_received += bytes;
        }
    }

    /// Builds the full status snapshot by combining tracked health state
    /// with the live ring buffer's own counters.
    pub fn snapshot(&self, ring: &RingBuffer, clients_connected: usize) -> StreamStatus {
        let inner = self.inner.lock().unwrap();
        StreamStatus {
            state: inner.state,
            last_error: inner.last_error.clone(),
            last_ok_timestamp: inner.last_ok_timestamp,
            write_index: ring.write_index(),
            capacity: ring.capacity(),
            clients_connected,
            active_input_index: inner.active_input_index,
            inputs: inner.inputs.clone(),
            smart_start_ready: ring.last_start_debug().is_some(),
            last_start_debug: ring.last_start_debug().as_ref().map(SmartStartDebugView::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    #[test]
    fn fresh_tracker_reports_down_with_no_active_input() {
        let tracker = StreamTracker::new(["a".to_string(), "b".to_string()]);
        let ring = RingBuffer::new(StreamConfig::default());
        let status = tracker.snapshot(&ring, 0);
        assert_eq!(status.state, StreamState::Down);
        assert!(status.active_input_index.is_none());
        assert_eq!(status.inputs.len(), 2);
    }

    #[test]
    fn mark_ok_updates_state_and_active_input() {
        let tracker = StreamTracker::new(["a".to_string()]);
        tracker.mark_ok(0);
        let ring = RingBuffer::new(StreamConfig::default());
        let status = tracker.snapshot(&ring, 1);
        assert_eq!(status.state, StreamState::Ok);
        assert_eq!(status.active_input_index, Some(0));
        assert!(status.last_ok_timestamp.is_some());
        assert!(status.inputs[0].connected);
    }

    #[test]
    fn mark_down_records_error_on_the_failed_input() {
        let tracker = StreamTracker::new(["a".to_string()]);
        tracker.mark_ok(0);
        tracker.mark_down(Some(0), "connection reset");
        let ring = RingBuffer::new(StreamConfig::default());
        let status = tracker.snapshot(&ring, 0);
        assert_eq!(status.state, StreamState::Down);
        assert_eq!(status.last_error.as_deref(), Some("connection reset"));
        assert!(!status.inputs[0].connected);
    }
}
