//! Key guard (§3 "Key guard"): validates a staged candidate key by
//! decrypting scrambled PES starts into a scratch buffer and checking for a
//! valid PES start code before trusting it.

use crate::ts::header::TsHeader;
use crate::ts::PACKET_SIZE;

use super::cipher::{CsaCipher, Parity};
use super::key_state::{CaStream, ProbeOutcome};

const PES_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// A scrambled packet is eligible for a key-guard probe when it starts a
/// payload unit and carries transport_scrambling_control 10/11 (§3).
pub fn is_probe_candidate(header: &TsHeader) -> bool {
    header.payload_unit_start && matches!(header.scrambling_control, 0b10 | 0b11)
}

/// Runs one key-guard probe: decrypts `packet`'s payload with the staged
/// candidate key into a scratch copy and records whether the result looks
/// like a valid PES start. Returns the stream's updated probe outcome, or
/// `None` if there was nothing to probe (no candidate staged, or the packet
/// isn't an eligible scrambled PES start).
pub fn probe(cipher: &dyn CsaCipher, stream: &mut CaStream, header: &TsHeader, packet: &[u8; PACKET_SIZE]) -> Option<ProbeOutcome> {
    if !is_probe_candidate(header) {
        return None;
    }
    let candidate = stream.candidate_for_probe()?;

    let payload_offset = header.payload_offset(packet).ok()?;
    if payload_offset >= PACKET_SIZE {
        return None;
    }

    let mut scratch = packet[payload_offset..].to_vec();
    let parity = if header.scrambling_control == 0b10 { Parity::Even } else { Parity::Odd };
    let key: [u8; 8] = if parity == Parity::Even { candidate[0..8].try_into().unwrap() } else { candidate[8..16].try_into().unwrap() };

    {
        let mut clusters: Vec<&mut [u8]> = vec![&mut scratch];
        cipher.batch_decrypt(parity, &key, &mut clusters);
    }

    let ok = scratch.len() >= 3 && scratch[0..3] == PES_START_CODE;
    Some(stream.record_probe(ok))
}
