//! Batches scrambled packets by parity for one vectorized cipher call per
//! group (§3 "batches packets for vectorized DVB-CSA decryption", §4.5).

use crate::error::Result;
use crate::ts::header::TsHeader;
use crate::ts::PACKET_SIZE;

use super::cipher::{CsaCipher, Parity};

/// Decrypts every scrambled packet in `packets` in place, grouping payloads
/// by parity so the cipher sees one batch per control word half. Clears
/// `transport_scrambling_control` on each packet it decrypts. Returns the
/// number of packets decrypted.
pub fn decrypt_batch(
    cipher: &dyn CsaCipher,
    even_key: &[u8; 8],
    odd_key: &[u8; 8],
    packets: &mut [[u8; PACKET_SIZE]],
) -> Result<usize> {
    let mut even_clusters: Vec<&mut [u8]> = Vec::new();
    let mut odd_clusters: Vec<&mut [u8]> = Vec::new();
    let mut count = 0usize;

    for packet in packets.iter_mut() {
        let header = TsHeader::parse(packet)?;
        if !matches!(header.scrambling_control, 0b10 | 0b11) {
            continue;
        }
        let offset = header.payload_offset(packet)?;
        if offset >= PACKET_SIZE {
            continue;
        }
        let parity_bits = header.scrambling_control;
        packet[3] &= 0x3f; // clear scrambling_control once decrypted below.
        count += 1;
        let (_, payload) = packet.split_at_mut(offset);
        if parity_bits == 0b10 {
            even_clusters.push(payload);
        } else {
            odd_clusters.push(payload);
        }
    }

    if !even_clusters.is_empty() {
        cipher.batch_decrypt(Parity::Even, even_key, &mut even_clusters);
    }
    if !odd_clusters.is_empty() {
        cipher.batch_decrypt(Parity::Odd, odd_key, &mut odd_clusters);
    }

    Ok(count)
}
