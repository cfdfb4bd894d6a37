//! MPTS multiplexer orchestration (§4.4): packet plane, PID/PNR assignment,
//! PSI emission and CBR shaping tied together behind one service table.

pub mod pcr;
pub mod pid_alloc;
pub mod pnr;
pub mod psi_builder;
pub mod service;
pub mod shaper;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::MuxConfig;
use crate::error::{Result, TsRelayError};
use crate::ts::header::{AdaptationField, TsHeader};
use crate::ts::psi::{EsInfo, Section};
use crate::ts::{reserved_pid, PACKET_SIZE};

use pcr::{CcRewriter, PcrRestamper};
use pid_alloc::PidAllocator;
use psi_builder::PsiBuilder;
use service::{Service, DROP_PID};
use shaper::CbrShaper;

pub use shaper::null_packet;

type Tp = [u8; PACKET_SIZE];

fn is_reserved_si_pid(pid: u16) -> bool {
    matches!(
        pid,
        reserved_pid::PAT
            | reserved_pid::CAT
            | reserved_pid::NIT
            | reserved_pid::SDT
            | reserved_pid::EIT
            | reserved_pid::TDT_TOT
    )
}

struct MuxState {
    services: Vec<Service>,
    es_cache: HashMap<String, Vec<EsInfo>>,
    pid_alloc: PidAllocator,
    psi: PsiBuilder,
    cc: CcRewriter,
    restampers: HashMap<String, PcrRestamper>,
    last_si_emit: Instant,
    shaper: CbrShaper,
}

/// The MPTS multiplexer: owns the service table, PID allocator, PSI
/// builder and per-output continuity counters behind a single lock (§5
/// "MPTS service table protected by the mux lock").
pub struct Mux {
    config: MuxConfig,
    state: Mutex<MuxState>,
}

impl Mux {
    pub fn new(config: MuxConfig) -> Self {
        let pid_alloc = PidAllocator::new();
        let shaper = CbrShaper::new(config.target_bitrate_bps);
        Mux {
            config,
            state: Mutex::new(MuxState {
                services: Vec::new(),
                es_cache: HashMap::new(),
                pid_alloc,
                psi: PsiBuilder::new(),
                cc: CcRewriter::default(),
                restampers: HashMap::new(),
                last_si_emit: Instant::now(),
                shaper,
            }),
        }
    }

    /// Registers a new input (service) by id, with an optional operator-pinned PNR.
    pub fn register_service(&self, input_id: impl Into<String>, configured_pnr: Option<u16>) {
        let mut state = self.state.lock();
        let input_id = input_id.into();
        if state.services.iter().any(|s| s.input_id == input_id) {
            return;
        }
        state.services.push(Service::new(input_id, configured_pnr));
        self.recompute_pnr(&mut state);
    }

    /// Removes a service, releasing every PID it held.
    pub fn remove_service(&self, input_id: &str) {
        let mut state = self.state.lock();
        if let Some(pos) = state.services.iter().position(|s| s.input_id == input_id) {
            let svc = state.services.remove(pos);
            if let Some(pid) = svc.output_pmt_pid {
                state.pid_alloc.release(pid);
            }
            for out_pid in svc.remap.values() {
                if *out_pid != DROP_PID {
                    state.pid_alloc.release(*out_pid);
                }
            }
            state.es_cache.remove(input_id);
            state.restampers.remove(input_id);
        }
    }

    fn recompute_pnr(&self, state: &mut MuxState) {
        if let Err(e) = pnr::resolve(&mut state.services, self.config.strict_pnr) {
            log::error!("pnr resolution failed: {e}");
        }
    }

    /// Feeds the input's own PAT (discovered on its SPTS) into the service
    /// table (§4.4 readiness requires this before the service contributes
    /// output PSI).
    pub fn ingest_input_pat(&self, input_id: &str, section: &Section) {
        let Section::Pat { programs, .. } = section else { return };
        let mut state = self.state.lock();
        let Some(idx) = state.services.iter().position(|s| s.input_id == input_id) else { return };
        state.services[idx].input_pat_seen = true;
        if let Some((pnr, pmt_pid)) = programs.iter().find(|(pn, _)| *pn != 0) {
            if state.services[idx].discovered_pnr.is_none() {
                state.services[idx].discovered_pnr = Some(*pnr);
            }
            state.services[idx].input_pmt_pid = Some(*pmt_pid);
        }
        self.recompute_pnr(&mut state);
    }

    /// Feeds the input's own PMT: establishes the PID remap table and
    /// reserves an output PMT PID (§4.4 "PID assignment").
    pub fn ingest_input_pmt(&self, input_id: &str, section: &Section) -> Result<()> {
        let Section::Pmt { pcr_pid, streams, .. } = section else {
            return Ok(());
        };
        let mut state = self.state.lock();
        let Some(idx) = state.services.iter().position(|s| s.input_id == input_id) else {
            return Ok(());
        };

        state.services[idx].input_pmt_seen = true;
        state.services[idx].input_pcr_pid = Some(*pcr_pid);

        if state.services[idx].output_pmt_pid.is_none() {
            let pid = state.pid_alloc.allocate()?;
            state.services[idx].output_pmt_pid = Some(pid);
        }

        let disable_remap = self.config.disable_auto_remap;
        let mut remap = HashMap::new();
        let mut mapped_streams = Vec::new();
        for es in streams {
            let out_pid = if disable_remap {
                if state.pid_alloc.is_in_use(es.elementary_pid) {
                    return Err(TsRelayError::PidConflict(es.elementary_pid));
                }
                state.pid_alloc.reserve(es.elementary_pid)?;
                es.elementary_pid
            } else {
                state.pid_alloc.allocate()?
            };
            remap.insert(es.elementary_pid, out_pid);
            mapped_streams.push(EsInfo {
                stream_type: es.stream_type,
                elementary_pid: out_pid,
                descriptors: es.descriptors.clone(),
            });
        }
        state.services[idx].output_pcr_pid = remap.get(pcr_pid).copied().or(Some(*pcr_pid));
        state.services[idx].remap = remap;
        state.es_cache.insert(input_id.to_string(), mapped_streams);

        Ok(())
    }

    /// Sets a service's SDT-facing display metadata (name/provider/type/LCN/scrambled).
    pub fn set_service_info(
        &self,
        input_id: &str,
        name: &str,
        provider: &str,
        service_type: u8,
        lcn: Option<u16>,
        scrambled: bool,
    ) {
        let mut state = self.state.lock();
        if let Some(svc) = state.services.iter_mut().find(|s| s.input_id == input_id) {
            svc.service_name = name.to_string();
            svc.provider_name = provider.to_string();
            svc.service_type = service_type;
            svc.lcn = lcn;
            svc.scrambled = scrambled;
        }
    }

    /// Processes one input TS packet for `input_id` through the packet
    /// plane (§4.4 "Packet plane"), returning zero or one output packets.
    pub fn process_packet(&self, input_id: &str, packet: &Tp) -> Result<Vec<Tp>> {
        let header = TsHeader::parse(packet)?;
        let mut state = self.state.lock();
        let Some(svc_idx) = state.services.iter().position(|s| s.input_id == input_id) else {
            return Ok(Vec::new());
        };

        if is_reserved_si_pid(header.pid) {
            // Regenerated locally; single-service passthrough for SDT/NIT/TDT/CAT
            // is a head-end-specific refinement not exercised here (documented
            // simplification — see DESIGN.md).
            return Ok(Vec::new());
        }

        if Some(header.pid) == state.services[svc_idx].input_pmt_pid {
            return Ok(Vec::new());
        }

        let out_pid = match state.services[svc_idx].remap.get(&header.pid).copied() {
            Some(DROP_PID) => return Ok(Vec::new()),
            Some(pid) => pid,
            None if self.config.disable_auto_remap => header.pid,
            None => return Ok(Vec::new()),
        };

        let mut out = *packet;
        out[1] = (out[1] & 0xe0) | ((out_pid >> 8) as u8 & 0x1f);
        out[2] = out_pid as u8;

        if self.config.pcr_restamp && Some(header.pid) == state.services[svc_idx].input_pcr_pid {
            if let Some(af) = AdaptationField::parse(&header, packet)? {
                if let Some(pcr) = af.pcr {
                    let smoothing = self.config.pcr_smoothing;
                    let alpha = self.config.pcr_smooth_alpha;
                    let max_offset = self.config.pcr_smooth_max_offset_ticks;
                    let restamper = state
                        .restampers
                        .entry(input_id.to_string())
                        .or_insert_with(|| PcrRestamper::new(smoothing, alpha, max_offset));
                    let new_pcr = restamper.restamp(pcr);
                    let af_len = packet[4] as usize;
                    let pcr_offset = 6; // header(4) + af_len byte(1) + flags byte(1)
                    if af_len >= 7 && pcr_offset + 6 <= PACKET_SIZE {
                        out[pcr_offset..pcr_offset + 6]
                            .copy_from_slice(&crate::ts::header::encode_pcr(new_pcr));
                    }
                }
            }
        }

        if header.contains_payload {
            let cc = state.cc.next(out_pid);
            out[3] = (out[3] & 0xf0) | (cc & 0x0f);
        }

        state.shaper.record_sent(1);
        Ok(vec![out])
    }

    /// Runs the SI-interval tick (§4.4 "PSI emission"): rebuilds PAT/SDT/NIT/
    /// TDT/TOT/every-PMT and packetizes them onto the output, if at least
    /// `si_interval_ms` has elapsed since the last emission.
    pub fn tick_si(&self) -> Vec<Tp> {
        let mut state = self.state.lock();
        if state.last_si_emit.elapsed() < Duration::from_millis(self.config.si_interval_ms) {
            return Vec::new();
        }
        state.last_si_emit = Instant::now();

        let mut out = Vec::new();
        let pat_sections = state.psi.build_pat(&self.config, &state.services);
        for s in &pat_sections {
            packetize(&mut out, s, reserved_pid::PAT, &mut state.cc);
        }

        if self.config.pass_cat {
            let cat_sections = state.psi.build_cat();
            for s in &cat_sections {
                packetize(&mut out, s, reserved_pid::CAT, &mut state.cc);
            }
        }

        let sdt_sections = state.psi.build_sdt(&self.config, &state.services);
        for s in &sdt_sections {
            packetize(&mut out, s, reserved_pid::SDT, &mut state.cc);
        }

        let nit_sections = state.psi.build_nit(&self.config, &state.services);
        for s in &nit_sections {
            packetize(&mut out, s, reserved_pid::NIT, &mut state.cc);
        }

        let tdt = state.psi.build_tdt();
        packetize(&mut out, &tdt, reserved_pid::TDT_TOT, &mut state.cc);
        let tot = state.psi.build_tot(&self.config);
        packetize(&mut out, &tot, reserved_pid::TDT_TOT, &mut state.cc);

        let ready: Vec<(usize, u16)> = state
            .services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_ready())
            .map(|(i, s)| (i, s.output_pmt_pid.unwrap()))
            .collect();
        for (idx, pmt_pid) in ready {
            let input_id = state.services[idx].input_id.clone();
            let streams = state.es_cache.get(&input_id).cloned().unwrap_or_default();
            let pmt_sections = state.psi.build_pmt(&state.services[idx], &streams);
            for s in &pmt_sections {
                packetize(&mut out, s, pmt_pid, &mut state.cc);
            }
        }

        state.shaper.record_sent(out.len() as u64);
        let nulls = state.shaper.tick();
        for _ in 0..nulls {
            out.push(shaper::null_packet());
        }
        state.shaper.record_sent(nulls as u64);

        out
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Snapshot of service readiness, for status reporting (§6).
    pub fn ready_service_count(&self) -> usize {
        self.state.lock().services.iter().filter(|s| s.is_ready()).count()
    }
}

/// Splits a PSI section into 188-byte TS packets: pointer_field on the
/// first packet, PUSI set only on that first packet, stuffed with 0xFF.
fn packetize(out: &mut Vec<Tp>, section: &[u8], pid: u16, cc: &mut CcRewriter) {
    let mut remaining = section;
    let mut first = true;
    while !remaining.is_empty() || first {
        let mut pkt = [0xffu8; PACKET_SIZE];
        pkt[0] = crate::ts::SYNC_BYTE;
        pkt[1] = (if first { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1f);
        pkt[2] = pid as u8;
        pkt[3] = 0x10 | (cc.next(pid) & 0x0f);

        let mut payload_start = 4;
        if first {
            pkt[4] = 0; // pointer_field
            payload_start = 5;
        }
        let space = PACKET_SIZE - payload_start;
        let take = remaining.len().min(space);
        pkt[payload_start..payload_start + take].copy_from_slice(&remaining[..take]);
        remaining = &remaining[take..];
        out.push(pkt);
        first = false;
        if remaining.is_empty() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::psi::EsInfo as Es;

    fn sample_pat(program_number: u16, pmt_pid: u16) -> Section {
        Section::Pat { tsid: 1, version: 0, programs: vec![(program_number, pmt_pid)] }
    }

    fn sample_pmt(pcr_pid: u16, video_pid: u16) -> Section {
        Section::Pmt {
            program_number: 1,
            version: 0,
            pcr_pid,
            program_descriptors: vec![],
            streams: vec![Es { stream_type: 0x1b, elementary_pid: video_pid, descriptors: vec![] }],
        }
    }

    fn mk_packet(pid: u16, payload: bool) -> Tp {
        let mut p = [0u8; PACKET_SIZE];
        p[0] = crate::ts::SYNC_BYTE;
        p[1] = (pid >> 8) as u8 & 0x1f;
        p[2] = pid as u8;
        p[3] = if payload { 0x10 } else { 0x00 };
        p
    }

    #[test]
    fn two_services_with_colliding_video_pid_get_distinct_output_pids() {
        let mux = Mux::new(MuxConfig::default());
        mux.register_service("a", None);
        mux.register_service("b", None);
        mux.ingest_input_pat("a", &sample_pat(1, 0x1000));
        mux.ingest_input_pat("b", &sample_pat(2, 0x1000));
        mux.ingest_input_pmt("a", &sample_pmt(0x100, 0x100)).unwrap();
        mux.ingest_input_pmt("b", &sample_pmt(0x100, 0x100)).unwrap();

        let out_a = mux.process_packet("a", &mk_packet(0x100, true)).unwrap();
        let out_b = mux.process_packet("b", &mk_packet(0x100, true)).unwrap();
        assert_eq!(out_a.len(), 1);
        assert_eq!(out_b.len(), 1);
        let pid_a = (((out_a[0][1] & 0x1f) as u16) << 8) | out_a[0][2] as u16;
        let pid_b = (((out_b[0][1] & 0x1f) as u16) << 8) | out_b[0][2] as u16;
        assert_ne!(pid_a, pid_b);
        // Each service consumes one PID for its output PMT before its
        // elementary streams are remapped, so the video PIDs land one slot
        // apart per service (0x20/0x21 for "a", 0x22/0x23 for "b").
        assert_eq!(pid_a, 0x0021);
        assert_eq!(pid_b, 0x0023);
    }

    #[test]
    fn reserved_input_pids_are_dropped() {
        let mux = Mux::new(MuxConfig::default());
        mux.register_service("a", None);
        let out = mux.process_packet("a", &mk_packet(reserved_pid::PAT, true)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn si_tick_emits_pat_after_interval() {
        let mut cfg = MuxConfig::default();
        cfg.si_interval_ms = 0;
        let mux = Mux::new(cfg);
        mux.register_service("a", Some(1));
        mux.ingest_input_pat("a", &sample_pat(1, 0x1000));
        mux.ingest_input_pmt("a", &sample_pmt(0x100, 0x100)).unwrap();
        let packets = mux.tick_si();
        assert!(!packets.is_empty());
        let pat_packet = packets.iter().find(|p| {
            let pid = (((p[1] & 0x1f) as u16) << 8) | p[2] as u16;
            pid == reserved_pid::PAT
        });
        assert!(pat_packet.is_some());
    }
}
