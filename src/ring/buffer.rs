//! The per-stream ring buffer and metadata indexer (§4.1).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::codec::nal::{self, Codec as NalCodec};
use crate::config::{KeyframeDetectMode, StreamConfig};
use crate::error::{Result, TsRelayError};
use crate::ts::header::{AdaptationField, TsHeader};
use crate::ts::pes::PesHeader;
use crate::ts::psi::Section;
use crate::ts::{stream_type, PACKET_SIZE, SYNC_BYTE};

use super::checkpoint::{Checkpoint, CheckpointRing};
use super::meta::{LastSeen, Meta};
use super::smart_start::{self, ReadyWaitOutcome, SmartStartDebug};

/// Maximum bytes scanned per PES start while hunting for an IDR NAL (§4.1).
const IDR_SCAN_LIMIT: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EffectiveKeyframeMode {
    RandomAccess,
    IdrParse,
}

/// A packet plus its 188-byte payload, returned by a successful `read_next`.
pub type Packet = [u8; PACKET_SIZE];

/// Outcome of one `read_next` call (§4.1).
#[derive(Debug)]
pub enum ReadOutcome {
    /// A packet was available and the reader advanced past it.
    Packet(Packet),
    /// The reader had fallen too far behind; it was jumped forward.
    /// Carries the number of packets skipped.
    LagDrop(u64),
    /// The buffer generation changed underneath the reader (input failover);
    /// it was re-anchored to the current write index.
    Resynced,
    /// No new data within the 1s wait window; caller should retry.
    Wait,
}

/// A client's position within a stream's ring buffer.
#[derive(Debug, Clone, Copy)]
pub struct ReaderHandle {
    pub read_index: u64,
    pub generation: u64,
}

struct Inner {
    packets: Box<[u8]>,
    meta: Box<[Meta]>,
    pending: Vec<u8>,
    last_seen: LastSeen,
    checkpoints: CheckpointRing,
    write_index: u64,
    generation: u64,
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    video_codec: Option<NalCodec>,
    keyframe_mode: EffectiveKeyframeMode,
    idr_scanning: bool,
    idr_scan_bytes: usize,
    idr_carry: Vec<u8>,
    mux_cc: std::collections::HashMap<u16, u8>,
    last_start_debug: Option<SmartStartDebug>,
    closing: bool,
}

/// Per-stream, packet-aligned ring buffer (§3/§4.1). Protected by one mutex
/// and one condvar, per §5's concurrency model — the writer holds the lock
/// for the duration of one packet's store + metadata update; readers
/// briefly snapshot under the lock and release it before doing anything else.
pub struct RingBuffer {
    capacity: usize,
    config: StreamConfig,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl RingBuffer {
    /// Builds a ring buffer sized per `config.ring_capacity_packets()`.
    pub fn new(config: StreamConfig) -> Self {
        let capacity = config.ring_capacity_packets().max(1);
        let initial_mode = match config.keyframe_detect_mode {
            KeyframeDetectMode::RandomAccess => EffectiveKeyframeMode::RandomAccess,
            _ => EffectiveKeyframeMode::IdrParse,
        };
        RingBuffer {
            capacity,
            config,
            inner: Mutex::new(Inner {
                packets: vec![0u8; capacity * PACKET_SIZE].into_boxed_slice(),
                meta: vec![Meta::default(); capacity].into_boxed_slice(),
                pending: Vec::with_capacity(PACKET_SIZE * 4),
                last_seen: LastSeen::default(),
                checkpoints: CheckpointRing::default(),
                write_index: 0,
                generation: 0,
                pmt_pid: None,
                video_pid: None,
                audio_pid: None,
                video_codec: None,
                keyframe_mode: initial_mode,
                idr_scanning: false,
                idr_scan_bytes: 0,
                idr_carry: Vec::new(),
                mux_cc: std::collections::HashMap::new(),
                last_start_debug: None,
                closing: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Capacity in 188-byte packets.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The stream's configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Current write index `W`, for status reporting (§6).
    pub fn write_index(&self) -> u64 {
        self.inner.lock().unwrap().write_index
    }

    /// Current generation `G`.
    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Bumps the generation counter on flush/resync (input failover, §8
    /// scenario 2). Existing readers observe the change on their next
    /// `read_next` and are re-anchored to the current `W`.
    pub fn resync(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.pending.clear();
        self.cond.notify_all();
    }

    /// Marks the stream closing (§5 cancellation semantics); ingest threads
    /// observe this at the top of their recv loop.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closing = true;
        self.cond.notify_all();
    }

    /// Whether the stream has been marked closing.
    pub fn is_closing(&self) -> bool {
        self.inner.lock().unwrap().closing
    }

    /// Splits a byte stream into 188-byte packets and stores each one
    /// (§4.1 `feed`). Corrupt leading bytes are dropped one at a time when
    /// `ts_drop_corrupt_enabled`; otherwise the feed fails on the first
    /// desync.
    pub fn feed(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.extend_from_slice(bytes);

        loop {
            if inner.pending.len() < PACKET_SIZE {
                break;
            }
            if inner.pending[0] != SYNC_BYTE {
                if self.config.ts_drop_corrupt_enabled {
                    inner.pending.remove(0);
                    continue;
                }
                return Err(TsRelayError::InputError("sync byte lost, resync disabled".into()));
            }
            if inner.pending.len() >= PACKET_SIZE * 2 && inner.pending[PACKET_SIZE] != SYNC_BYTE {
                if self.config.ts_drop_corrupt_enabled {
                    inner.pending.remove(0);
                    continue;
                }
                return Err(TsRelayError::InputError(
                    "next packet's sync byte missing, resync disabled".into(),
                ));
            }

            let packet: Packet = inner.pending[..PACKET_SIZE].try_into().unwrap();
            inner.pending.drain(..PACKET_SIZE);
            self.store_packet_locked(&mut inner, &packet)?;
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Stores a single, already-188-byte-aligned packet directly, bypassing
    /// `feed`'s byte-stream splitting. Used by tests and by callers that
    /// already have packet-aligned input.
    pub fn store_packet(&self, packet: &Packet) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.store_packet_locked(&mut inner, packet)?;
        self.cond.notify_all();
        Ok(())
    }

    fn store_packet_locked(&self, inner: &mut Inner, packet: &Packet) -> Result<()> {
        let header = TsHeader::parse(packet)?;
        let af = AdaptationField::parse(&header, packet)?;
        let payload_offset = header.payload_offset(packet)?;
        let payload: &[u8] = if header.contains_payload && payload_offset < PACKET_SIZE {
            &packet[payload_offset..]
        } else {
            &[]
        };

        let mut meta = Meta {
            pid: header.pid,
            pusi: header.payload_unit_start,
            af: header.adaptation_field_exists,
            random_access: af.as_ref().map(|a| a.random_access).unwrap_or(false),
            pcr_90k: af.as_ref().and_then(|a| a.pcr).map(|pcr| pcr / 300),
            ..Default::default()
        };

        self.detect_psi(inner, &header, payload, &mut meta);
        self.detect_pts(inner, &header, payload, &mut meta);
        self.detect_keyframe(inner, &header, payload, &mut meta);

        if self.config.ts_rewrite_cc_enabled && header.contains_payload {
            let cc = inner.mux_cc.entry(header.pid).or_insert(0);
            let mut rewritten = *packet;
            rewritten[3] = (rewritten[3] & 0xf0) | (*cc & 0x0f);
            *cc = (*cc + 1) & 0x0f;
            self.write_slot(inner, inner.write_index, &rewritten);
        } else {
            self.write_slot(inner, inner.write_index, packet);
        }

        let index = inner.write_index;
        let slot = (index % self.capacity as u64) as usize;
        inner.meta[slot] = meta;

        let is_video = Some(header.pid) == inner.video_pid;
        let is_audio = Some(header.pid) == inner.audio_pid;
        inner.last_seen.update(index, &inner.meta[slot], is_video, is_audio);

        if inner.meta[slot].is_keyframe {
            let checkpoint = Checkpoint::new(index, &inner.last_seen);
            inner.checkpoints.push(checkpoint);
        }

        inner.write_index += 1;
        Ok(())
    }

    fn write_slot(&self, inner: &mut Inner, index: u64, packet: &Packet) {
        let slot = (index % self.capacity as u64) as usize;
        let start = slot * PACKET_SIZE;
        inner.packets[start..start + PACKET_SIZE].copy_from_slice(packet);
    }

    fn detect_psi(&self, inner: &mut Inner, header: &TsHeader, payload: &[u8], meta: &mut Meta) {
        if payload.is_empty() || !header.payload_unit_start {
            return;
        }
        let pointer = payload[0] as usize;
        if pointer + 1 > payload.len() {
            return;
        }
        let section = &payload[1 + pointer..];
        if section.is_empty() {
            return;
        }

        if header.pid == crate::ts::reserved_pid::PAT && section[0] == crate::ts::table_id::PAT {
            match Section::parse_pat(section) {
                Ok(Section::Pat { programs, .. }) => {
                    meta.is_pat = true;
                    if inner.pmt_pid.is_none() {
                        if let Some((_, pid)) = programs.iter().find(|(pn, _)| *pn != 0) {
                            inner.pmt_pid = Some(*pid);
                        }
                    }
                }
                _ => log::debug!("psi_crc_error: dropping malformed PAT section"),
            }
            return;
        }

        if Some(header.pid) == inner.pmt_pid && section[0] == crate::ts::table_id::PMT {
            match Section::parse_pmt(section) {
                Ok(Section::Pmt { streams, .. }) => {
                    meta.is_pmt = true;
                    for es in &streams {
                        let is_video_type = matches!(
                            es.stream_type,
                            stream_type::MPEG2_VIDEO | stream_type::H264 | stream_type::H265
                        );
                        if is_video_type && inner.video_pid.is_none() {
                            inner.video_pid = Some(es.elementary_pid);
                            inner.video_codec = match es.stream_type {
                                stream_type::H265 => Some(NalCodec::H265),
                                stream_type::H264 => Some(NalCodec::H264),
                                _ => None,
                            };
                        } else if !is_video_type
                            && inner.audio_pid.is_none()
                            && Some(es.elementary_pid) != inner.video_pid
                        {
                            inner.audio_pid = Some(es.elementary_pid);
                        }
                    }
                }
                _ => log::debug!("psi_crc_error: dropping malformed PMT section"),
            }
        }
    }

    fn detect_pts(&self, inner: &Inner, header: &TsHeader, payload: &[u8], meta: &mut Meta) {
        let is_video = Some(header.pid) == inner.video_pid;
        let is_audio = Some(header.pid) == inner.audio_pid;
        if !header.payload_unit_start || !(is_video || is_audio) {
            return;
        }
        if let Some(pes) = PesHeader::parse(payload) {
            meta.pes_start = true;
            meta.pts_90k = pes.pts;
        }
    }

    fn detect_keyframe(&self, inner: &mut Inner, header: &TsHeader, payload: &[u8], meta: &mut Meta) {
        if self.config.keyframe_detect_mode == KeyframeDetectMode::Auto
            && inner.keyframe_mode == EffectiveKeyframeMode::IdrParse
            && meta.random_access
            && (!self.config.paramset_required || inner.last_seen.last_paramset.is_some())
        {
            inner.keyframe_mode = EffectiveKeyframeMode::RandomAccess;
        }

        match inner.keyframe_mode {
            EffectiveKeyframeMode::RandomAccess => {
                meta.is_keyframe = meta.random_access;
            }
            EffectiveKeyframeMode::IdrParse => {
                if Some(header.pid) != inner.video_pid || inner.video_codec.is_none() {
                    return;
                }
                if header.payload_unit_start {
                    inner.idr_scanning = true;
                    inner.idr_scan_bytes = 0;
                    inner.idr_carry.clear();
                }
                if !inner.idr_scanning || payload.is_empty() {
                    return;
                }

                let mut scan_buf = std::mem::take(&mut inner.idr_carry);
                scan_buf.extend_from_slice(payload);
                let hits = nal::scan_annexb(&scan_buf, inner.video_codec.unwrap());
                for hit in hits {
                    match hit {
                        nal::NalHit::Idr => meta.is_keyframe = true,
                        nal::NalHit::Sps => meta.has_sps = true,
                        nal::NalHit::Pps => meta.has_pps = true,
                        nal::NalHit::Vps => meta.has_vps = true,
                        nal::NalHit::Other => {}
                    }
                }
                let keep = scan_buf.len().min(3);
                inner.idr_carry = scan_buf[scan_buf.len() - keep..].to_vec();

                inner.idr_scan_bytes += payload.len();
                if inner.idr_scan_bytes >= IDR_SCAN_LIMIT {
                    inner.idr_scanning = false;
                }
            }
        }
    }

    /// Selects the initial read position for a new client (§4.2) and returns
    /// a handle anchored to it. Blocks up to `smart_wait_ready_ms` when
    /// `smart_start.enabled` and no checkpoint yet qualifies.
    pub fn acquire_reader(&self) -> ReaderHandle {
        let mut inner = self.inner.lock().unwrap();
        let min_index = inner.write_index.saturating_sub(self.capacity as u64);

        if self.config.smart_start.enabled {
            let deadline = Instant::now() + Duration::from_millis(self.config.smart_start.wait_ready_ms);
            loop {
                match smart_start::select_start(
                    &self.config,
                    inner.write_index,
                    self.capacity as u64,
                    &inner.checkpoints,
                ) {
                    ReadyWaitOutcome::Ready(result) => {
                        inner.last_start_debug = Some(result.debug.clone());
                        return ReaderHandle { read_index: result.index, generation: inner.generation };
                    }
                    ReadyWaitOutcome::NotReady => {}
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, timeout) = self
                    .cond
                    .wait_timeout(inner, deadline - now)
                    .unwrap();
                inner = guard;
                if timeout.timed_out() {
                    break;
                }
            }
        }

        let fallback_index = inner
            .write_index
            .saturating_sub(self.config.packets_for_ms(self.config.client_start_offset_sec * 1000))
            .max(min_index);
        log::warn!(
            "SMART_START_FALLBACK: stream falling back to offset start at index {}",
            fallback_index
        );
        inner.last_start_debug = Some(SmartStartDebug::fallback(fallback_index));
        ReaderHandle { read_index: fallback_index, generation: inner.generation }
    }

    /// Last smart-start debug record, when `start_debug_enabled` (§4.2, §6).
    pub fn last_start_debug(&self) -> Option<SmartStartDebug> {
        self.inner.lock().unwrap().last_start_debug.clone()
    }

    /// Returns the next packet for `reader`, advancing it, or a
    /// lag/resync/wait outcome (§4.1 `read_next`).
    pub fn read_next(&self, reader: &mut ReaderHandle) -> ReadOutcome {
        let max_lag = self.config.packets_for_ms(self.config.max_client_lag_ms);
        let mut inner = self.inner.lock().unwrap();

        if reader.generation != inner.generation {
            reader.generation = inner.generation;
            reader.read_index = inner.write_index;
            return ReadOutcome::Resynced;
        }

        let hard_floor = inner.write_index.saturating_sub(self.capacity as u64);
        let lag_floor = inner.write_index.saturating_sub(max_lag).max(hard_floor);
        if reader.read_index < lag_floor {
            let skipped = lag_floor - reader.read_index;
            reader.read_index = lag_floor;
            return ReadOutcome::LagDrop(skipped);
        }

        if reader.read_index < inner.write_index {
            let slot = (reader.read_index % self.capacity as u64) as usize;
            let start = slot * PACKET_SIZE;
            let packet: Packet = inner.packets[start..start + PACKET_SIZE].try_into().unwrap();
            reader.read_index += 1;
            return ReadOutcome::Packet(packet);
        }

        let (_guard, _timeout) = self.cond.wait_timeout(inner, Duration::from_secs(1)).unwrap();
        ReadOutcome::Wait
    }
}
