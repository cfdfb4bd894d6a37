//! Per-slot metadata record (§3 "Ring Buffer" bullet) and the per-stream
//! rolling last-seen indices it feeds.

/// Metadata captured for a single buffered packet, mirroring `ts_meta_t`.
/// Invariant (d): metadata slot `i` always describes the packet occupying
/// packet-storage slot `i` — the two are written together under the same
/// lock hold, never independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Meta {
    pub pid: u16,
    pub pusi: bool,
    pub af: bool,
    pub random_access: bool,
    pub pcr_90k: Option<u64>,
    pub is_pat: bool,
    pub is_pmt: bool,
    pub pes_start: bool,
    pub pts_90k: Option<u64>,
    pub is_keyframe: bool,
    pub has_sps: bool,
    pub has_pps: bool,
    pub has_vps: bool,
}

/// Rolling last-seen indices for one stream (§3), updated on every
/// `store_packet` call. These are absolute write-index values, not slot
/// numbers — callers translate to a slot with `index % capacity`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastSeen {
    pub last_pat: Option<u64>,
    pub last_pmt: Option<u64>,
    pub last_pcr: Option<u64>,
    pub last_paramset: Option<u64>,
    pub last_keyframe: Option<u64>,
    pub last_video_pts: Option<u64>,
    pub last_audio_pts: Option<u64>,
}

impl LastSeen {
    /// Folds one packet's metadata into the rolling indices. `index` is the
    /// packet's absolute write index, `is_video`/`is_audio` identify whether
    /// `pid` is the stream's discovered video/audio elementary PID.
    pub fn update(&mut self, index: u64, meta: &Meta, is_video: bool, is_audio: bool) {
        if meta.is_pat {
            self.last_pat = Some(index);
        }
        if meta.is_pmt {
            self.last_pmt = Some(index);
        }
        if meta.pcr_90k.is_some() {
            self.last_pcr = Some(index);
        }
        if meta.has_sps || meta.has_pps || meta.has_vps {
            self.last_paramset = Some(index);
        }
        if meta.is_keyframe {
            self.last_keyframe = Some(index);
        }
        if is_video {
            if let Some(pts) = meta.pts_90k {
                self.last_video_pts = Some(pts);
            }
        }
        if is_audio {
            if let Some(pts) = meta.pts_90k {
                self.last_audio_pts = Some(pts);
            }
        }
    }
}
