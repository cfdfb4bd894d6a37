//! Configuration surface (§6 "Configuration surface"): `serde`-deserializable
//! structs for streams, the MPTS mux, and decrypt contexts. Config-file
//! reload (inotify-driven) is out of scope per §1 — this module only
//! validates and holds the active configuration; an embedder decides when
//! to call [`Config::apply`].

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TsRelayError};

/// Smart-start policy knobs from §4.2 / §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartStartConfig {
    pub enabled: bool,
    pub target_delay_ms: u64,
    pub lookback_ms: u64,
    pub max_lead_ms: u64,
    pub wait_ready_ms: u64,
    pub require_pat_pmt: bool,
    pub require_keyframe: bool,
    pub require_pcr: bool,
    pub paramset_required: bool,
}

impl Default for SmartStartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_delay_ms: 1500,
            lookback_ms: 2000,
            max_lead_ms: 4000,
            wait_ready_ms: 2000,
            require_pat_pmt: true,
            require_keyframe: true,
            require_pcr: false,
            paramset_required: false,
        }
    }
}

/// Keyframe detection mode (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyframeDetectMode {
    Auto,
    RandomAccess,
    IdrParse,
}

impl Default for KeyframeDetectMode {
    fn default() -> Self {
        KeyframeDetectMode::Auto
    }
}

/// Output pacing mode (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    None,
    Pcr,
}

impl Default for PacingMode {
    fn default() -> Self {
        PacingMode::None
    }
}

/// `backup_type` for multi-input failover (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Active,
    Passive,
}

impl Default for BackupType {
    fn default() -> Self {
        BackupType::Passive
    }
}

/// One prioritized input URL (§3 Stream Descriptor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

/// Per-stream configuration (§3 Stream Descriptor, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub id: String,
    pub name: String,
    pub path: String,
    pub enable: bool,
    pub inputs: Vec<InputConfig>,
    pub bandwidth_kbps: u64,
    pub buffering_sec: u64,
    pub client_start_offset_sec: u64,
    pub max_client_lag_ms: u64,
    pub smart_start: SmartStartConfig,
    pub keyframe_detect_mode: KeyframeDetectMode,
    pub av_pts_align_enabled: bool,
    pub av_pts_max_desync_ms: i64,
    pub paramset_required: bool,
    pub start_debug_enabled: bool,
    pub ts_resync_enabled: bool,
    pub ts_drop_corrupt_enabled: bool,
    pub ts_rewrite_cc_enabled: bool,
    pub pacing_mode: PacingMode,
    pub no_data_timeout_sec: u64,
    pub client_read_timeout_sec: u64,
    pub backup_type: BackupType,
    pub backup_start_delay_sec: u64,
    pub backup_return_delay_sec: u64,
    pub backup_probe_interval_sec: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            path: String::new(),
            enable: true,
            inputs: Vec::new(),
            bandwidth_kbps: 4_000,
            buffering_sec: 6,
            client_start_offset_sec: 5,
            max_client_lag_ms: 2_000,
            smart_start: SmartStartConfig::default(),
            keyframe_detect_mode: KeyframeDetectMode::default(),
            av_pts_align_enabled: false,
            av_pts_max_desync_ms: 200,
            paramset_required: false,
            start_debug_enabled: false,
            ts_resync_enabled: true,
            ts_drop_corrupt_enabled: true,
            ts_rewrite_cc_enabled: false,
            pacing_mode: PacingMode::None,
            no_data_timeout_sec: 10,
            client_read_timeout_sec: 10,
            backup_type: BackupType::Passive,
            backup_start_delay_sec: 5,
            backup_return_delay_sec: 30,
            backup_probe_interval_sec: 10,
        }
    }
}

impl StreamConfig {
    /// Ring buffer capacity in 188-byte packets, derived per §3/§4.1: from
    /// `bandwidth_kbps * buffering_sec`, clamped to [2 MiB, 256 MiB] in bytes,
    /// rounded down to a whole number of packets.
    pub fn ring_capacity_packets(&self) -> usize {
        const MIN_BYTES: u64 = 2 * 1024 * 1024;
        const MAX_BYTES: u64 = 256 * 1024 * 1024;
        let bytes = (self.bandwidth_kbps * 1000 / 8) * self.buffering_sec;
        let clamped = bytes.clamp(MIN_BYTES, MAX_BYTES);
        (clamped / crate::ts::PACKET_SIZE as u64) as usize
    }

    /// Number of 188-byte packets carried in `ms` milliseconds at this
    /// stream's configured bandwidth (§4.2's `packets_for_ms`).
    pub fn packets_for_ms(&self, ms: u64) -> u64 {
        let bytes_per_sec = self.bandwidth_kbps * 1000 / 8;
        let packets_per_sec = bytes_per_sec / crate::ts::PACKET_SIZE as u64;
        packets_per_sec * ms / 1000
    }

    /// Inverse of `packets_for_ms`: milliseconds spanned by `packets` packets.
    pub fn ms_for_packets(&self, packets: u64) -> u64 {
        let bytes_per_sec = self.bandwidth_kbps * 1000 / 8;
        if bytes_per_sec == 0 {
            return 0;
        }
        let packets_per_sec = bytes_per_sec / crate::ts::PACKET_SIZE as u64;
        if packets_per_sec == 0 {
            return 0;
        }
        packets * 1000 / packets_per_sec
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TsRelayError::ConfigInvalid("stream id must not be empty".into()));
        }
        if self.inputs.is_empty() {
            return Err(TsRelayError::ConfigInvalid(format!(
                "stream {} has no inputs configured",
                self.id
            )));
        }
        if self.bandwidth_kbps == 0 || self.buffering_sec == 0 {
            return Err(TsRelayError::ConfigInvalid(format!(
                "stream {} bandwidth_kbps/buffering_sec must be nonzero",
                self.id
            )));
        }
        Ok(())
    }
}

/// Delivery system for NIT generation (§4.3 / §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Cable,
    Satellite,
    Terrestrial,
}

impl Default for Delivery {
    fn default() -> Self {
        Delivery::Cable
    }
}

/// Per-mux configuration (§6 "Per mux").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub tsid: u16,
    pub onid: u16,
    pub network_id: u16,
    pub network_name: String,
    pub provider_name: String,
    pub codepage_utf8: bool,
    pub country: String,
    pub utc_offset_minutes: i32,
    pub delivery: Delivery,
    pub frequency_khz: u32,
    pub symbolrate_ksps: u32,
    pub modulation: String,
    pub fec: String,
    pub network_search: bool,
    pub si_interval_ms: u64,
    pub target_bitrate_bps: u64,
    pub disable_auto_remap: bool,
    pub pass_nit: bool,
    pub pass_sdt: bool,
    pub pass_eit: bool,
    pub pass_tdt: bool,
    pub pass_cat: bool,
    pub pcr_restamp: bool,
    pub pcr_smoothing: bool,
    pub pcr_smooth_alpha: f64,
    pub pcr_smooth_max_offset_ticks: u64,
    pub strict_pnr: bool,
    pub spts_only: bool,
    pub lcn_descriptor_tags: Vec<u8>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            tsid: 1,
            onid: 1,
            network_id: 1,
            network_name: String::new(),
            provider_name: String::new(),
            codepage_utf8: true,
            country: String::new(),
            utc_offset_minutes: 0,
            delivery: Delivery::default(),
            frequency_khz: 0,
            symbolrate_ksps: 0,
            modulation: String::new(),
            fec: String::new(),
            network_search: false,
            si_interval_ms: 500,
            target_bitrate_bps: 0,
            disable_auto_remap: false,
            pass_nit: false,
            pass_sdt: false,
            pass_eit: false,
            pass_tdt: false,
            pass_cat: false,
            pcr_restamp: true,
            pcr_smoothing: false,
            // Canonical unit per §9 Open Question: alpha is a 0..1 fraction, not 0..100.
            pcr_smooth_alpha: 0.05,
            pcr_smooth_max_offset_ticks: 27_000, // 1ms of 27MHz ticks
            strict_pnr: false,
            spts_only: false,
            lcn_descriptor_tags: vec![0x83],
        }
    }
}

impl MuxConfig {
    fn validate(&self) -> Result<()> {
        if self.pcr_smoothing && !(0.0..=1.0).contains(&self.pcr_smooth_alpha) {
            return Err(TsRelayError::ConfigInvalid(format!(
                "pcr_smooth_alpha must be in 0..1, got {}",
                self.pcr_smooth_alpha
            )));
        }
        Ok(())
    }
}

/// Per-decrypt-context configuration (§6 "Per decrypt").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptConfig {
    pub caid: u16,
    pub cam: String,
    pub cam_backup: Option<String>,
    pub cas_pnr: u16,
    pub cas_data: Vec<u8>,
    pub disable_emm: bool,
    pub ecm_pid: u16,
    pub key_guard: bool,
    pub cam_backup_hedge_ms: u64,
    pub shift_ms: u64,
    /// 16 hex chars (8 bytes) static key for clear-key (BISS) scrambling.
    pub biss: Option<String>,
}

impl Default for DecryptConfig {
    fn default() -> Self {
        Self {
            caid: 0,
            cam: String::new(),
            cam_backup: None,
            cas_pnr: 0,
            cas_data: Vec::new(),
            disable_emm: false,
            ecm_pid: 0,
            key_guard: false,
            cam_backup_hedge_ms: 150,
            shift_ms: 0,
            biss: None,
        }
    }
}

impl DecryptConfig {
    fn validate(&self) -> Result<()> {
        if let Some(biss) = &self.biss {
            if biss.len() != 16 || !biss.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(TsRelayError::ConfigInvalid(
                    "biss key must be 16 hex characters".into(),
                ));
            }
        }
        if self.key_guard && self.cam_backup.is_none() {
            // key_guard is forced on when dual-CAM is used (§4.5); a lone primary
            // CAM may still opt in explicitly, so this is not rejected here.
        }
        Ok(())
    }
}

/// The full configuration an embedder applies to the relay core: the set of
/// streams, the mux, and the decrypt contexts keyed by stream id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub streams: Vec<StreamConfig>,
    pub mux: MuxConfig,
    pub decrypt: Vec<DecryptConfig>,
}

impl Config {
    /// Parses configuration from a TOML document.
    pub fn from_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| TsRelayError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every stream/mux/decrypt section. `apply_config` (§7
    /// `config_invalid`) must call this before swapping in a new config;
    /// on error, the caller keeps the previous configuration active.
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = std::collections::HashSet::new();
        for stream in &self.streams {
            stream.validate()?;
            if !seen_ids.insert(stream.id.clone()) {
                return Err(TsRelayError::ConfigInvalid(format!(
                    "duplicate stream id {}",
                    stream.id
                )));
            }
        }
        self.mux.validate()?;
        for d in &self.decrypt {
            d.validate()?;
        }
        Ok(())
    }
}

/// Holds the single active configuration for an embedding process. Unlike
/// the teacher's `lazy_static` global, construction is explicit: callers own
/// a `ActiveConfig` instance rather than reaching for a process-wide
/// singleton (§9 "Global mutable state" — no lazy init in hot paths).
#[derive(Debug, Default)]
pub struct ActiveConfig {
    inner: RwLock<Config>,
}

impl ActiveConfig {
    /// Builds an `ActiveConfig` holding an already-validated configuration.
    pub fn new(config: Config) -> Self {
        Self { inner: RwLock::new(config) }
    }

    /// Returns a clone of the currently active configuration.
    pub fn get(&self) -> Config {
        self.inner.read().unwrap().clone()
    }

    /// Validates `new_config` and, only if it passes, swaps it in. On
    /// rejection the previous configuration remains active (§7 `config_invalid`).
    pub fn apply(&self, new_config: Config) -> Result<()> {
        new_config.validate()?;
        *self.inner.write().unwrap() = new_config;
        Ok(())
    }
}
