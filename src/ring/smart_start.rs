//! Smart Start selection (§4.2): picks a client start index that minimizes
//! zap-in time while guaranteeing decodability, scored against the stream's
//! checkpoint ring.

use crate::config::StreamConfig;

use super::checkpoint::{flags, CheckpointRing};

/// How a start index was chosen, surfaced in the debug record (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// A qualifying checkpoint was found and scored.
    SmartCheckpoint,
    /// No checkpoint qualified within `smart_wait_ready_ms`; fell back to a
    /// time-offset position.
    FallbackOffset,
}

/// Debug record for one start selection (§4.2 "Debug record").
#[derive(Debug, Clone)]
pub struct SmartStartDebug {
    pub mode: StartMode,
    pub keyframe_index: Option<u64>,
    pub pat_index: Option<u64>,
    pub pmt_index: Option<u64>,
    pub pcr_index: Option<u64>,
    pub paramset_index: Option<u64>,
    pub desync_ms: Option<i64>,
    pub score: Option<i64>,
    pub chosen_index: u64,
}

impl SmartStartDebug {
    pub(super) fn fallback(chosen_index: u64) -> Self {
        SmartStartDebug {
            mode: StartMode::FallbackOffset,
            keyframe_index: None,
            pat_index: None,
            pmt_index: None,
            pcr_index: None,
            paramset_index: None,
            desync_ms: None,
            score: None,
            chosen_index,
        }
    }
}

/// A chosen start index plus its debug record.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub index: u64,
    pub debug: SmartStartDebug,
}

/// Outcome of one scoring pass: either a qualifying checkpoint was found, or
/// none was and the caller should keep waiting (up to its deadline) before
/// falling back.
#[derive(Debug)]
pub enum ReadyWaitOutcome {
    Ready(StartResult),
    NotReady,
}

/// Scores the checkpoint ring against `cfg`'s smart-start policy and returns
/// the best-qualifying start, or `NotReady` if none currently qualifies
/// (§4.2 "Algorithm"/"Ready-wait").
pub fn select_start(
    cfg: &StreamConfig,
    write_index: u64,
    capacity: u64,
    checkpoints: &CheckpointRing,
) -> ReadyWaitOutcome {
    let policy = &cfg.smart_start;
    let min_index = write_index.saturating_sub(capacity);
    let target = write_index.saturating_sub(cfg.packets_for_ms(policy.target_delay_ms));
    let lookback_limit = target + cfg.packets_for_ms(policy.lookback_ms);
    let max_lead = cfg.packets_for_ms(policy.max_lead_ms);

    let mut best: Option<(i64, &super::checkpoint::Checkpoint, u32)> = None;

    for cp in checkpoints.iter() {
        if !cp.valid || !cp.survives(min_index) {
            continue;
        }
        if cp.keyframe_index > lookback_limit {
            continue;
        }
        let eff = cp.effective_flags(min_index);
        if policy.require_pat_pmt && (eff & flags::PAT == 0 || eff & flags::PMT == 0) {
            continue;
        }
        if policy.require_pcr && eff & flags::PCR == 0 {
            continue;
        }
        if policy.paramset_required && eff & flags::PARAMSET == 0 {
            continue;
        }

        let desync = if cfg.av_pts_align_enabled {
            match cp.av_desync_ms() {
                Some(d) if d.unsigned_abs() as i64 <= cfg.av_pts_max_desync_ms => d,
                Some(_) => continue,
                None => 0,
            }
        } else {
            cp.av_desync_ms().unwrap_or(0)
        };

        let distance = (cp.keyframe_index as i64 - target as i64).abs();
        let score = distance + desync.abs();

        if best.map(|(best_score, ..)| score < best_score).unwrap_or(true) {
            best = Some((score, cp, eff));
        }
    }

    let Some((score, cp, eff)) = best else {
        return ReadyWaitOutcome::NotReady;
    };

    let mut start = if eff & flags::PAT != 0 {
        cp.pat_index.unwrap()
    } else if eff & flags::PMT != 0 {
        cp.pmt_index.unwrap()
    } else {
        cp.keyframe_index
    };

    for candidate in [cp.paramset_index, cp.pcr_index].into_iter().flatten() {
        if candidate < start && cfg.ms_for_packets(cp.keyframe_index - candidate) <= policy.max_lead_ms {
            start = candidate;
        }
    }

    start = start.max(min_index);
    if cfg.ms_for_packets(cp.keyframe_index.saturating_sub(start)) > policy.max_lead_ms {
        start = cp.keyframe_index.saturating_sub(max_lead).max(min_index);
    }

    ReadyWaitOutcome::Ready(StartResult {
        index: start,
        debug: SmartStartDebug {
            mode: StartMode::SmartCheckpoint,
            keyframe_index: Some(cp.keyframe_index),
            pat_index: cp.pat_index,
            pmt_index: cp.pmt_index,
            pcr_index: cp.pcr_index,
            paramset_index: cp.paramset_index,
            desync_ms: cp.av_desync_ms(),
            score: Some(score),
            chosen_index: start,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::checkpoint::Checkpoint;
    use crate::ring::meta::LastSeen;

    fn cfg() -> StreamConfig {
        StreamConfig { bandwidth_kbps: 4_000, buffering_sec: 6, ..Default::default() }
    }

    #[test]
    fn picks_keyframe_nearest_target_with_pat_pmt() {
        let mut ring = CheckpointRing::default();
        // scenario 1 from §8: target_delay=1500ms, GOP 1s, PAT every 100ms.
        let config = StreamConfig { smart_start: crate::config::SmartStartConfig { target_delay_ms: 1500, ..Default::default() }, ..cfg() };
        let packets_per_sec = config.packets_for_ms(1000);
        let write_index = packets_per_sec * 10; // 10s of data buffered
        let target = write_index - config.packets_for_ms(1500);

        for gop in 0..10u64 {
            let kf_index = gop * packets_per_sec;
            let last_seen = LastSeen {
                last_pat: Some(kf_index.saturating_sub(packets_per_sec / 10)),
                last_pmt: Some(kf_index.saturating_sub(packets_per_sec / 10)),
                last_pcr: Some(kf_index),
                ..Default::default()
            };
            ring.push(Checkpoint::new(kf_index, &last_seen));
        }

        match select_start(&config, write_index, packets_per_sec * 20, &ring) {
            ReadyWaitOutcome::Ready(result) => {
                let distance = (result.debug.keyframe_index.unwrap() as i64 - target as i64).abs();
                assert!(distance <= packets_per_sec as i64);
            }
            ReadyWaitOutcome::NotReady => panic!("expected a ready checkpoint"),
        }
    }

    #[test]
    fn not_ready_when_no_checkpoint_qualifies() {
        let ring = CheckpointRing::default();
        let result = select_start(&cfg(), 10_000, 5_000, &ring);
        assert!(matches!(result, ReadyWaitOutcome::NotReady));
    }

    #[test]
    fn rejects_checkpoint_missing_required_pat_pmt() {
        let mut ring = CheckpointRing::default();
        let last_seen = LastSeen { last_pcr: Some(100), ..Default::default() };
        ring.push(Checkpoint::new(100, &last_seen));
        let config = cfg();
        let result = select_start(&config, 200, 10_000, &ring);
        assert!(matches!(result, ReadyWaitOutcome::NotReady));
    }
}
