//! PSI/SI sections as a tagged-variant model: one parsed-section enum, one
//! encoder, CRC-32 computed once. Replaces the byte-level mixing of parsing
//! and serialization the original mux code did by hand.

use chrono::{Datelike, Timelike, Utc};

use crate::error::{Result, TsRelayError};
use crate::utils::crc;

use super::{table_id, MAX_SECTION_LENGTH};

/// A single descriptor: tag + raw bytes, shared by PMT/SDT/NIT/TOT loops.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Descriptor tag.
    pub tag: u8,
    /// Descriptor payload, excluding the tag/length bytes.
    pub data: Vec<u8>,
}

impl Descriptor {
    fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        out.push(self.data.len() as u8);
        out.extend_from_slice(&self.data);
    }
}

/// One elementary stream entry inside a PMT.
#[derive(Debug, Clone)]
pub struct EsInfo {
    /// Stream type (§ts::stream_type).
    pub stream_type: u8,
    /// Elementary PID carrying this stream.
    pub elementary_pid: u16,
    /// ES-level descriptor loop.
    pub descriptors: Vec<Descriptor>,
}

/// One entry in an SDT service loop.
#[derive(Debug, Clone)]
pub struct SdtService {
    /// program_number this service describes.
    pub service_id: u16,
    /// EIT schedule/present flags, kept opaque — always false for the regenerator.
    pub eit_schedule: bool,
    /// Running status (0-7); `4` (running) is used for all regenerated services.
    pub running_status: u8,
    /// Whether the service is free-to-air (false) or scrambled (true, `free_ca_mode`).
    pub scrambled: bool,
    /// service_descriptor fields (tag 0x48): type, provider, name.
    pub service_type: u8,
    /// Provider name bytes (already codepage-encoded by the caller).
    pub provider_name: Vec<u8>,
    /// Service name bytes (already codepage-encoded by the caller).
    pub service_name: Vec<u8>,
}

/// A parsed or about-to-be-encoded PSI/SI section.
#[derive(Debug, Clone)]
pub enum Section {
    /// Program Association Table. `programs` maps program_number -> PID (network PID
    /// when program_number is 0, else the program's PMT PID).
    Pat {
        /// transport_stream_id.
        tsid: u16,
        /// 5-bit version number.
        version: u8,
        programs: Vec<(u16, u16)>,
    },
    /// Conditional Access Table. The regenerator emits an empty descriptor loop —
    /// EMM PID carriage is a CAM-specific concern out of this crate's scope.
    Cat {
        /// 5-bit version number.
        version: u8,
    },
    /// Program Map Table for a single service.
    Pmt {
        /// program_number (PNR) this PMT describes.
        program_number: u16,
        /// 5-bit version number.
        version: u8,
        /// PID carrying this service's PCR.
        pcr_pid: u16,
        /// Program-level descriptor loop.
        program_descriptors: Vec<Descriptor>,
        /// Elementary stream loop.
        streams: Vec<EsInfo>,
    },
    /// Service Description Table, actual transport stream.
    Sdt {
        /// transport_stream_id.
        tsid: u16,
        /// original_network_id.
        onid: u16,
        /// 5-bit version number.
        version: u8,
        /// Service loop.
        services: Vec<SdtService>,
    },
    /// Network Information Table, actual network, single TS-loop entry.
    Nit {
        /// network_id.
        network_id: u16,
        /// 5-bit version number.
        version: u8,
        /// Network-level descriptor loop.
        network_descriptors: Vec<Descriptor>,
        /// transport_stream_id of the multiplex this NIT describes.
        tsid: u16,
        /// original_network_id of the multiplex this NIT describes.
        onid: u16,
        /// Per-spec ordering: service_list (0x41), then LCN (default 0x83), then delivery.
        ts_descriptors: Vec<Descriptor>,
    },
    /// Time and Date Table — short form, no CRC.
    Tdt {
        /// UTC timestamp.
        utc: chrono::DateTime<Utc>,
    },
    /// Time Offset Table — short form syntax but carries a trailing CRC.
    Tot {
        /// UTC timestamp.
        utc: chrono::DateTime<Utc>,
        /// Typically a single local_time_offset_descriptor (tag 0x58).
        descriptors: Vec<Descriptor>,
    },
}

impl Section {
    /// Parses a PAT section (the only section type the ring buffer's metadata
    /// indexer needs to fully decode).
    pub fn parse_pat(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || data[0] != table_id::PAT {
            return Err(TsRelayError::InvalidData("not a PAT section".into()));
        }
        let section_length = (((data[1] & 0x0f) as usize) << 8) | data[2] as usize;
        let total = 3 + section_length;
        if data.len() < total {
            return Err(TsRelayError::InvalidData("PAT section truncated".into()));
        }
        verify_crc(data, total)?;

        let tsid = ((data[3] as u16) << 8) | data[4] as u16;
        let version = (data[5] >> 1) & 0x1f;
        let mut programs = Vec::new();
        let mut pos = 8;
        while pos + 4 <= total - 4 {
            let program_number = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
            let pid = (((data[pos + 2] & 0x1f) as u16) << 8) | data[pos + 3] as u16;
            programs.push((program_number, pid));
            pos += 4;
        }
        Ok(Section::Pat { tsid, version, programs })
    }

    /// Parses a PMT section.
    pub fn parse_pmt(data: &[u8]) -> Result<Self> {
        if data.len() < 12 || data[0] != table_id::PMT {
            return Err(TsRelayError::InvalidData("not a PMT section".into()));
        }
        let section_length = (((data[1] & 0x0f) as usize) << 8) | data[2] as usize;
        let total = 3 + section_length;
        if data.len() < total {
            return Err(TsRelayError::InvalidData("PMT section truncated".into()));
        }
        verify_crc(data, total)?;

        let program_number = ((data[3] as u16) << 8) | data[4] as u16;
        let version = (data[5] >> 1) & 0x1f;
        let pcr_pid = (((data[8] & 0x1f) as u16) << 8) | data[9] as u16;
        let program_info_length = (((data[10] & 0x0f) as usize) << 8) | data[11] as usize;
        let mut pos = 12;
        if pos + program_info_length > total - 4 {
            return Err(TsRelayError::InvalidData("PMT program info overruns section".into()));
        }
        let program_descriptors = parse_descriptor_loop(&data[pos..pos + program_info_length])?;
        pos += program_info_length;

        let mut streams = Vec::new();
        while pos + 5 <= total - 4 {
            let stream_type = data[pos];
            let elementary_pid = (((data[pos + 1] & 0x1f) as u16) << 8) | data[pos + 2] as u16;
            let es_info_length = (((data[pos + 3] & 0x0f) as usize) << 8) | data[pos + 4] as usize;
            pos += 5;
            if pos + es_info_length > total - 4 {
                return Err(TsRelayError::InvalidData("PMT ES info overruns section".into()));
            }
            let descriptors = parse_descriptor_loop(&data[pos..pos + es_info_length])?;
            pos += es_info_length;
            streams.push(EsInfo { stream_type, elementary_pid, descriptors });
        }

        Ok(Section::Pmt {
            program_number,
            version,
            pcr_pid,
            program_descriptors,
            streams,
        })
    }

    /// Encodes the section, splitting into multiple sections when the body would
    /// exceed `MAX_SECTION_LENGTH` (§4.3 invariant a). Each returned `Vec<u8>` is a
    /// complete, CRC-terminated (where applicable) section ready to carry in PSI packets.
    /// `current_next` is always encoded as `true` — the regenerator never announces
    /// future-only sections.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        match self {
            Section::Pat { tsid, version, programs } => {
                encode_long_form_multi(table_id::PAT, *tsid, *version, &[], programs, |entries, out| {
                    for (program_number, pid) in entries {
                        out.push((program_number >> 8) as u8);
                        out.push(*program_number as u8);
                        out.push(0xe0 | ((pid >> 8) as u8 & 0x1f));
                        out.push(*pid as u8);
                    }
                })
            }
            Section::Cat { version } => {
                vec![encode_long_form(table_id::CAT, 0xffff, *version, 0, 0, &[])]
            }
            Section::Pmt {
                program_number,
                version,
                pcr_pid,
                program_descriptors,
                streams,
            } => {
                let mut body = Vec::new();
                body.push(0xe0 | ((pcr_pid >> 8) as u8 & 0x1f));
                body.push(*pcr_pid as u8);
                let prog_desc_len: usize = program_descriptors.iter().map(Descriptor::encoded_len).sum();
                body.push(0xf0 | ((prog_desc_len >> 8) as u8 & 0x0f));
                body.push(prog_desc_len as u8);
                for d in program_descriptors {
                    d.encode(&mut body);
                }
                for s in streams {
                    body.push(s.stream_type);
                    body.push(0xe0 | ((s.elementary_pid >> 8) as u8 & 0x1f));
                    body.push(s.elementary_pid as u8);
                    let es_len: usize = s.descriptors.iter().map(Descriptor::encoded_len).sum();
                    body.push(0xf0 | ((es_len >> 8) as u8 & 0x0f));
                    body.push(es_len as u8);
                    for d in &s.descriptors {
                        d.encode(&mut body);
                    }
                }
                vec![encode_long_form(table_id::PMT, *program_number, *version, 0, 0, &body)]
            }
            Section::Sdt { tsid, onid, version, services } => {
                let extra_header = [(onid >> 8) as u8, *onid as u8, 0xff];
                encode_long_form_multi(table_id::SDT, *tsid, *version, &extra_header, services, |entries, out| {
                    for svc in entries {
                        out.push((svc.service_id >> 8) as u8);
                        out.push(svc.service_id as u8);
                        out.push(0xfc | if svc.eit_schedule { 0x02 } else { 0 });
                        let mut loop_body = Vec::new();
                        loop_body.push(0x48);
                        let desc_body_start = loop_body.len();
                        loop_body.push(0); // length placeholder
                        loop_body.push(svc.service_type);
                        loop_body.push(svc.provider_name.len() as u8);
                        loop_body.extend_from_slice(&svc.provider_name);
                        loop_body.push(svc.service_name.len() as u8);
                        loop_body.extend_from_slice(&svc.service_name);
                        let desc_len = loop_body.len() - desc_body_start - 1;
                        loop_body[desc_body_start] = desc_len as u8;

                        let running_free = ((svc.running_status & 0x07) << 5)
                            | if svc.scrambled { 0x10 } else { 0 }
                            | (((loop_body.len() as u16 >> 8) as u8) & 0x0f);
                        out.push(running_free);
                        out.push(loop_body.len() as u8);
                        out.extend_from_slice(&loop_body);
                    }
                })
            }
            Section::Nit {
                network_id,
                version,
                network_descriptors,
                tsid,
                onid,
                ts_descriptors,
            } => {
                let net_desc_len: usize = network_descriptors.iter().map(Descriptor::encoded_len).sum();
                let mut body = Vec::new();
                body.push(0xf0 | ((net_desc_len >> 8) as u8 & 0x0f));
                body.push(net_desc_len as u8);
                for d in network_descriptors {
                    d.encode(&mut body);
                }
                let ts_loop_len: usize = 6 + ts_descriptors.iter().map(Descriptor::encoded_len).sum::<usize>();
                body.push(0xf0 | ((ts_loop_len >> 8) as u8 & 0x0f));
                body.push(ts_loop_len as u8);
                body.push((tsid >> 8) as u8);
                body.push(*tsid as u8);
                body.push((onid >> 8) as u8);
                body.push(*onid as u8);
                let ts_desc_len: usize = ts_descriptors.iter().map(Descriptor::encoded_len).sum();
                body.push(0xf0 | ((ts_desc_len >> 8) as u8 & 0x0f));
                body.push(ts_desc_len as u8);
                for d in ts_descriptors {
                    d.encode(&mut body);
                }
                vec![encode_long_form(table_id::NIT, *network_id, *version, 0, 0, &body)]
            }
            Section::Tdt { utc } => vec![encode_tdt(*utc)],
            Section::Tot { utc, descriptors } => vec![encode_tot(*utc, descriptors)],
        }
    }
}

fn parse_descriptor_loop(data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(TsRelayError::InvalidData("descriptor overruns loop".into()));
        }
        descriptors.push(Descriptor { tag, data: data[pos..pos + len].to_vec() });
        pos += len;
    }
    Ok(descriptors)
}

fn verify_crc(data: &[u8], total: usize) -> Result<()> {
    if total < 4 {
        return Err(TsRelayError::InvalidData("section too short for CRC".into()));
    }
    let expected = u32::from_be_bytes([
        data[total - 4],
        data[total - 3],
        data[total - 2],
        data[total - 1],
    ]);
    let actual = crc::mpeg2(&data[..total - 4]);
    if expected != actual {
        return Err(TsRelayError::PsiCrc { pid: 0, table_id: data[0] });
    }
    Ok(())
}

/// Encodes one long-form section: header, body, CRC-32. `table_id_extension` carries
/// TSID/PNR/network_id depending on table.
fn encode_long_form(
    id: u8,
    table_id_extension: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    body: &[u8],
) -> Vec<u8> {
    let mut section = Vec::with_capacity(3 + 5 + body.len() + 4);
    section.push(id);
    section.push(0); // section_length placeholder high byte
    section.push(0); // section_length placeholder low byte
    section.push((table_id_extension >> 8) as u8);
    section.push(table_id_extension as u8);
    section.push(0xc1 | ((version & 0x1f) << 1)); // reserved(2)=11, version, current_next=1
    section.push(section_number);
    section.push(last_section_number);
    section.extend_from_slice(body);

    let section_length = section.len() - 3 + 4; // bytes after length field, including CRC
    section[1] = 0xb0 | ((section_length >> 8) as u8 & 0x0f);
    section[2] = section_length as u8;

    let crc = crc::mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

/// Splits a homogeneous list of loop entries across as many sections as needed to
/// keep each section under `MAX_SECTION_LENGTH`, encoding entries with `encode_entries`.
/// `extra_header` is repeated verbatim at the front of every section's body (SDT's
/// `original_network_id` + reserved byte; empty for PAT).
fn encode_long_form_multi<T>(
    id: u8,
    table_id_extension: u16,
    version: u8,
    extra_header: &[u8],
    entries: &[T],
    encode_entries: impl Fn(&[T], &mut Vec<u8>),
) -> Vec<Vec<u8>>
where
    T: Clone,
{
    // Section header (5 bytes extension/version/section numbers) + CRC (4 bytes) = 9,
    // excluding the 3-byte table_id/section_length prefix which isn't counted in
    // section_length itself.
    const HEADER_AND_CRC: usize = 9;
    let budget = MAX_SECTION_LENGTH - HEADER_AND_CRC - extra_header.len();

    let mut chunks: Vec<Vec<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_len = 0usize;
    for entry in entries {
        let mut probe = Vec::new();
        encode_entries(std::slice::from_ref(entry), &mut probe);
        if current_len + probe.len() > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += probe.len();
        current.push(entry.clone());
    }
    chunks.push(current);
    if chunks.len() > 1 && chunks.last().map(|c| c.is_empty()).unwrap_or(false) {
        chunks.pop();
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }

    let last = (chunks.len() - 1) as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut body = extra_header.to_vec();
            encode_entries(&chunk, &mut body);
            encode_long_form(id, table_id_extension, version, i as u8, last, &body)
        })
        .collect()
}

fn mjd_bcd(utc: chrono::DateTime<Utc>) -> [u8; 5] {
    let year = utc.year();
    let month = utc.month() as i32;
    let day = utc.day() as i32;
    let l = if month <= 2 { 1 } else { 0 };
    let y = year - 1900;
    let mjd = 14956 + day + (((y - l) as f64 * 365.25) as i32) + (((month + 1 + l * 12) as f64 * 30.6001) as i32);
    let bcd = |v: u32| -> u8 { (((v / 10) << 4) | (v % 10)) as u8 };
    [
        (mjd >> 8) as u8,
        mjd as u8,
        bcd(utc.hour()),
        bcd(utc.minute()),
        bcd(utc.second()),
    ]
}

fn encode_tdt(utc: chrono::DateTime<Utc>) -> Vec<u8> {
    let mut section = Vec::with_capacity(8);
    section.push(table_id::TDT);
    // section_syntax_indicator=0, reserved_future_use=1, reserved=11, section_length=5.
    section.push(0x70);
    section.push(5);
    section.extend_from_slice(&mjd_bcd(utc));
    section
}

fn encode_tot(utc: chrono::DateTime<Utc>, descriptors: &[Descriptor]) -> Vec<u8> {
    let desc_len: usize = descriptors.iter().map(Descriptor::encoded_len).sum();
    let mut body = Vec::new();
    body.extend_from_slice(&mjd_bcd(utc));
    body.push(0xf0 | ((desc_len >> 8) as u8 & 0x0f));
    body.push(desc_len as u8);
    for d in descriptors {
        d.encode(&mut body);
    }

    let mut section = Vec::with_capacity(3 + body.len() + 4);
    section.push(table_id::TOT);
    section.push(0);
    section.push(0);
    section.extend_from_slice(&body);
    let section_length = section.len() - 3 + 4;
    // section_syntax_indicator=0, reserved_future_use=1, reserved=11, per EN 300 468 §5.2.6.
    section[1] = 0x70 | ((section_length >> 8) as u8 & 0x0f);
    section[2] = section_length as u8;
    let crc = crc::mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_round_trip() {
        let section = Section::Pat {
            tsid: 1,
            version: 3,
            programs: vec![(1, 0x1000), (2, 0x1100)],
        };
        let encoded = section.encode();
        assert_eq!(encoded.len(), 1);
        let parsed = Section::parse_pat(&encoded[0]).unwrap();
        match parsed {
            Section::Pat { tsid, version, programs } => {
                assert_eq!(tsid, 1);
                assert_eq!(version, 3);
                assert_eq!(programs, vec![(1, 0x1000), (2, 0x1100)]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn pmt_round_trip() {
        let section = Section::Pmt {
            program_number: 7,
            version: 1,
            pcr_pid: 0x100,
            program_descriptors: vec![],
            streams: vec![
                EsInfo { stream_type: 0x1b, elementary_pid: 0x100, descriptors: vec![] },
                EsInfo { stream_type: 0x0f, elementary_pid: 0x101, descriptors: vec![] },
            ],
        };
        let encoded = section.encode();
        let parsed = Section::parse_pmt(&encoded[0]).unwrap();
        match parsed {
            Section::Pmt { program_number, pcr_pid, streams, .. } => {
                assert_eq!(program_number, 7);
                assert_eq!(pcr_pid, 0x100);
                assert_eq!(streams.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn pat_splits_when_oversized() {
        let programs: Vec<(u16, u16)> = (1..2000u16).map(|n| (n, 0x20 + (n % 0x1000))).collect();
        let section = Section::Pat { tsid: 1, version: 0, programs };
        let encoded = section.encode();
        assert!(encoded.len() > 1);
        for s in &encoded {
            assert!(s.len() <= MAX_SECTION_LENGTH + 3);
        }
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let section = Section::Pat { tsid: 1, version: 0, programs: vec![(1, 0x1000)] };
        let mut encoded = section.encode().remove(0);
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Section::parse_pat(&encoded).is_err());
    }
}
