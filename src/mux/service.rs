//! Per-input MPTS service state (§3 "MPTS Service").

use std::collections::HashMap;

/// Sentinel remap-table value meaning "drop this PID" (§3).
pub const DROP_PID: u16 = 0xFFFF;

/// One input SPTS being folded into the output MPTS.
#[derive(Debug, Clone)]
pub struct Service {
    /// Stable key identifying this input (stream id from `StreamConfig`).
    pub input_id: String,
    /// Configured output PNR, if the operator pinned one.
    pub configured_pnr: Option<u16>,
    /// PNR discovered by parsing the input's own PAT.
    pub discovered_pnr: Option<u16>,
    /// Final output PNR once resolved (§4.4 "PNR resolution").
    pub assigned_pnr: Option<u16>,
    /// Input PMT PID (as seen on the incoming SPTS).
    pub input_pmt_pid: Option<u16>,
    /// Output PMT PID, reserved from the global PID map.
    pub output_pmt_pid: Option<u16>,
    /// PCR PID on the input.
    pub input_pcr_pid: Option<u16>,
    /// PCR PID on the output (after remap).
    pub output_pcr_pid: Option<u16>,
    /// Input PID -> output PID remap table. `DROP_PID` drops the packet.
    pub remap: HashMap<u16, u16>,
    pub service_name: String,
    pub provider_name: String,
    pub service_type: u8,
    pub lcn: Option<u16>,
    pub scrambled: bool,
    /// Set once the input PAT has been parsed with a valid CRC.
    pub input_pat_seen: bool,
    /// Set once the input PMT has been parsed with a valid CRC.
    pub input_pmt_seen: bool,
}

impl Service {
    pub fn new(input_id: impl Into<String>, configured_pnr: Option<u16>) -> Self {
        Service {
            input_id: input_id.into(),
            configured_pnr,
            discovered_pnr: None,
            assigned_pnr: None,
            input_pmt_pid: None,
            output_pmt_pid: None,
            input_pcr_pid: None,
            output_pcr_pid: None,
            remap: HashMap::new(),
            service_name: String::new(),
            provider_name: String::new(),
            service_type: 0x01, // digital television service
            lcn: None,
            scrambled: false,
            input_pat_seen: false,
            input_pmt_seen: false,
        }
    }

    /// Service PSI is ready iff both input PAT/PMT are parsed and this
    /// service's mapping (output PMT PID + output PNR) is established
    /// (§4.4 "Service readiness").
    pub fn is_ready(&self) -> bool {
        self.input_pat_seen
            && self.input_pmt_seen
            && self.output_pmt_pid.is_some()
            && self.assigned_pnr.is_some()
    }

    /// Maps an input PID to its output PID, honoring the `DROP_PID` sentinel.
    /// Returns `None` when the PID isn't in the remap table at all (caller
    /// decides whether that means "drop" or "pass unmapped").
    pub fn map_pid(&self, input_pid: u16) -> Option<u16> {
        match self.remap.get(&input_pid) {
            Some(&DROP_PID) => None,
            Some(&out) => Some(out),
            None => None,
        }
    }
}
