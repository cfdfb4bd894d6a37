//! Keyframe checkpoints (§3 "Checkpoint") and the fixed 1024-entry ring that
//! holds them, mirroring `start_checkpoint_t` / `BUFFER_CHECKPOINTS`.

use super::meta::LastSeen;

/// Number of checkpoint slots kept per stream (§3).
pub const CHECKPOINT_COUNT: usize = 1024;

/// Bit flags describing which references a checkpoint actually carries,
/// recomputed on read as indices age out of the buffer (§4.2 "invalidating
/// any whose index has aged out").
pub mod flags {
    pub const PAT: u32 = 1 << 0;
    pub const PMT: u32 = 1 << 1;
    pub const PCR: u32 = 1 << 2;
    pub const PARAMSET: u32 = 1 << 3;
    pub const PTS_OK: u32 = 1 << 4;
}

/// An immutable snapshot taken at a keyframe (§3 "Checkpoint"). Once
/// created, a `Checkpoint`'s fields never change — only its *effective*
/// flags (computed at read time against the current `W`/`capacity`) vary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checkpoint {
    /// Write index of the keyframe packet itself.
    pub keyframe_index: u64,
    pub pat_index: Option<u64>,
    pub pmt_index: Option<u64>,
    pub pcr_index: Option<u64>,
    pub paramset_index: Option<u64>,
    pub video_pts: Option<u64>,
    pub audio_pts: Option<u64>,
    /// Flags as observed at creation time (before any aging-out).
    pub flags: u32,
    /// `W` at the moment this checkpoint was created.
    pub created_write_index: u64,
    /// Set once a real checkpoint has been written into this slot.
    pub valid: bool,
}

impl Checkpoint {
    /// Builds a checkpoint for a keyframe at `keyframe_index`, given the
    /// stream's current rolling last-seen indices.
    pub fn new(keyframe_index: u64, last_seen: &LastSeen) -> Self {
        let mut flags = 0u32;
        if last_seen.last_pat.is_some() {
            flags |= self::flags::PAT;
        }
        if last_seen.last_pmt.is_some() {
            flags |= self::flags::PMT;
        }
        if last_seen.last_pcr.is_some() {
            flags |= self::flags::PCR;
        }
        if last_seen.last_paramset.is_some() {
            flags |= self::flags::PARAMSET;
        }
        if last_seen.last_video_pts.is_some() && last_seen.last_audio_pts.is_some() {
            flags |= self::flags::PTS_OK;
        }
        Checkpoint {
            keyframe_index,
            pat_index: last_seen.last_pat,
            pmt_index: last_seen.last_pmt,
            pcr_index: last_seen.last_pcr,
            paramset_index: last_seen.last_paramset,
            video_pts: last_seen.last_video_pts,
            audio_pts: last_seen.last_audio_pts,
            flags,
            created_write_index: keyframe_index,
            valid: true,
        }
    }

    /// A/V desync in milliseconds, per §3: `(video_pts - audio_pts) * 1000 / 90000`,
    /// only meaningful when `PTS_OK` is set.
    pub fn av_desync_ms(&self) -> Option<i64> {
        if self.flags & self::flags::PTS_OK == 0 {
            return None;
        }
        let (v, a) = (self.video_pts?, self.audio_pts?);
        Some((v as i64 - a as i64) * 1000 / 90_000)
    }

    /// Recomputes this checkpoint's effective flags against the current
    /// buffer horizon `min_valid_index = max(0, W - capacity)`, invalidating
    /// any referenced index that has aged out (§4.2).
    pub fn effective_flags(&self, min_valid_index: u64) -> u32 {
        let mut flags = 0u32;
        let alive = |idx: Option<u64>| idx.map(|i| i >= min_valid_index).unwrap_or(false);
        if alive(self.pat_index) {
            flags |= self::flags::PAT;
        }
        if alive(self.pmt_index) {
            flags |= self::flags::PMT;
        }
        if alive(self.pcr_index) {
            flags |= self::flags::PCR;
        }
        if alive(self.paramset_index) {
            flags |= self::flags::PARAMSET;
        }
        if self.flags & self::flags::PTS_OK != 0 {
            flags |= self::flags::PTS_OK;
        }
        flags
    }

    /// Whether this checkpoint still "survives" the current horizon: its own
    /// keyframe index, and every index it references, are all still
    /// `>= min_valid_index` (§8 invariant "for every surviving checkpoint").
    pub fn survives(&self, min_valid_index: u64) -> bool {
        if !self.valid || self.keyframe_index < min_valid_index {
            return false;
        }
        let referenced = [self.pat_index, self.pmt_index, self.pcr_index, self.paramset_index];
        referenced
            .iter()
            .flatten()
            .all(|idx| *idx >= min_valid_index)
    }
}

/// Fixed-size ring of the last `CHECKPOINT_COUNT` keyframe checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointRing {
    slots: Box<[Checkpoint; CHECKPOINT_COUNT]>,
    next: usize,
    count: usize,
}

impl Default for CheckpointRing {
    fn default() -> Self {
        Self {
            slots: Box::new([Checkpoint::default(); CHECKPOINT_COUNT]),
            next: 0,
            count: 0,
        }
    }
}

impl CheckpointRing {
    /// Appends a checkpoint, overwriting the oldest slot once full.
    pub fn push(&mut self, checkpoint: Checkpoint) {
        self.slots[self.next] = checkpoint;
        self.next = (self.next + 1) % CHECKPOINT_COUNT;
        self.count = (self.count + 1).min(CHECKPOINT_COUNT);
    }

    /// Iterates all populated checkpoint slots, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        let start = if self.count < CHECKPOINT_COUNT {
            0
        } else {
            self.next
        };
        (0..self.count).map(move |i| &self.slots[(start + i) % CHECKPOINT_COUNT])
    }
}
