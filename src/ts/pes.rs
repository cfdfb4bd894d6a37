//! PES packet header: just enough to capture PTS/DTS on PUSI packets and to
//! recognise a decrypted PES start code for the key guard (§4.5).

use crate::error::{Result, TsRelayError};
use bytes::{BufMut, BytesMut};

use super::PTS_HZ;

/// PES start code prefix, `00 00 01`.
pub const START_CODE_PREFIX: [u8; 3] = [0x00, 0x00, 0x01];

/// Parsed PES header fields relevant to timing. Descriptor/trick-mode fields the relay
/// never inspects are intentionally not modelled.
#[derive(Debug, Clone, Default)]
pub struct PesHeader {
    /// Stream ID byte following the start code.
    pub stream_id: u8,
    /// Presentation Time Stamp, 33-bit, if present.
    pub pts: Option<u64>,
    /// Decode Time Stamp, 33-bit, if present.
    pub dts: Option<u64>,
}

impl PesHeader {
    /// Builder used by tests/encoders that need a PTS-bearing PES header.
    pub fn with_pts(mut self, pts_90k: u64) -> Self {
        self.pts = Some(pts_90k % (1 << 33));
        self
    }

    /// Builder used by tests/encoders that need a DTS-bearing PES header.
    pub fn with_dts(mut self, dts_90k: u64) -> Self {
        self.dts = Some(dts_90k % (1 << 33));
        self
    }

    /// Writes `00 00 01 <stream_id> <len=0> <flags> <pts_dts_flags> <header_data_length> <timestamps>`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&START_CODE_PREFIX);
        buf.put_u8(self.stream_id);
        buf.put_u16(0); // packet_length, left unspecified (unbounded video PES)
        buf.put_u8(0x80); // '10' marker bits, no scrambling/priority/alignment

        let mut pts_dts_flags = 0u8;
        if self.pts.is_some() {
            pts_dts_flags |= 0x80;
        }
        if self.dts.is_some() {
            pts_dts_flags |= 0x40;
        }
        buf.put_u8(pts_dts_flags << 6 | 0);

        let header_len = match (self.pts.is_some(), self.dts.is_some()) {
            (true, true) => 10,
            (true, false) => 5,
            _ => 0,
        };
        buf.put_u8(header_len);

        if let Some(pts) = self.pts {
            write_timestamp(buf, 0x2 | (if self.dts.is_some() { 0x1 } else { 0x0 }), pts);
        }
        if let Some(dts) = self.dts {
            write_timestamp(buf, 0x1, dts);
        }
    }

    /// Parses a PES header out of a PUSI packet's payload, per §4.1's PTS capture rule:
    /// payload must start with `00 00 01` and the flags byte must have PTS present.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 9 || payload[0..3] != START_CODE_PREFIX {
            return None;
        }
        let stream_id = payload[3];
        let flags = payload[7];
        let pts_dts_flags = flags >> 6;
        if pts_dts_flags & 0x2 == 0 {
            return Some(PesHeader { stream_id, pts: None, dts: None });
        }
        let header_data_length = payload[8] as usize;
        let ts_start = 9;
        if payload.len() < ts_start + 5 {
            return None;
        }
        let pts = read_timestamp(&payload[ts_start..ts_start + 5]).ok()?;
        let dts = if pts_dts_flags == 0x3 && payload.len() >= ts_start + 10 {
            read_timestamp(&payload[ts_start + 5..ts_start + 10]).ok()
        } else {
            None
        };
        let _ = header_data_length;
        Some(PesHeader { stream_id, pts: Some(pts), dts })
    }
}

/// Converts a 90kHz timestamp into nanoseconds since the (arbitrary) stream epoch.
pub fn pts_to_nanos(pts_90k: u64) -> u64 {
    pts_90k * 1_000_000_000 / PTS_HZ
}

fn write_timestamp(buf: &mut BytesMut, marker: u8, ts: u64) {
    let ts = ts & 0x1_ffff_ffff;
    buf.put_u8((marker << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 0x01);
    buf.put_u16((((ts >> 15) & 0x7fff) as u16) << 1 | 0x01);
    buf.put_u16((((ts & 0x7fff) as u16) << 1) | 0x01);
}

fn read_timestamp(b: &[u8]) -> Result<u64> {
    if b.len() < 5 {
        return Err(TsRelayError::InvalidData("timestamp field too short".into()));
    }
    let ts = (((b[0] as u64 >> 1) & 0x07) << 30)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64 >> 1) & 0x7f) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64 >> 1) & 0x7f);
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_round_trip() {
        let header = PesHeader::default().with_pts(123_456_789 % (1 << 33));
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        let parsed = PesHeader::parse(&buf).unwrap();
        assert_eq!(parsed.pts, header.pts);
    }

    #[test]
    fn non_pes_payload_returns_none() {
        assert!(PesHeader::parse(&[0x01, 0x02, 0x03, 0x04]).is_none());
    }
}
