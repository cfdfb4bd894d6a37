//! # Error Types
//!
//! Central error type for the relay core. Every subsystem (ring buffer, mux,
//! decrypt pipeline, sync output, transports) returns `Result<T>` built on
//! this single enum so call sites don't need per-module error conversions.
//!
//! ## Example
//!
//! ```rust
//! use tsrelay::error::{Result, TsRelayError};
//!
//! fn validate_pid(pid: u16) -> Result<()> {
//!     if pid > 0x1FFF {
//!         return Err(TsRelayError::InvalidData(format!("pid {} out of range", pid)));
//!     }
//!     Ok(())
//! }
//! ```

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the relay core.
#[derive(Error, Debug)]
pub enum TsRelayError {
    /// I/O errors from sockets, files, or any transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport broken, resync exhausted, or HTTP status != 200 after redirects.
    #[error("input error: {0}")]
    InputError(String),

    /// PSI section CRC-32 mismatch. The section is dropped, not fatal.
    #[error("psi crc error on pid {pid}, table_id {table_id:#04x}")]
    PsiCrc {
        /// PID the offending section was read from.
        pid: u16,
        /// table_id of the section that failed CRC.
        table_id: u8,
    },

    /// CAM reported no keys for the current ECM, or the adaptive window expired.
    #[error("ecm not found for ca_pid {0}")]
    EcmNotFound(u16),

    /// `disable_auto_remap` is set and a service's PID collides with another.
    #[error("pid conflict: {0:#06x} already assigned")]
    PidConflict(u16),

    /// `strict_pnr` is set and a service's PNR collides with another.
    #[error("pnr conflict: {0} already assigned")]
    PnrConflict(u16),

    /// Smart start found no qualifying checkpoint before `smart_wait_ready_ms` elapsed.
    #[error("checkpoint starved, falling back to offset start")]
    CheckpointStarved,

    /// A bounded queue (sync-output ring, SPSC handoff) is full; packet was dropped.
    #[error("send overflow, packet dropped")]
    SendOverflow,

    /// `apply_config` rejected the new configuration; the previous one remains active.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Malformed input that doesn't fit a more specific variant.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Errors related to NAL-unit / codec bitstream parsing.
    #[error("codec error: {0}")]
    Codec(String),

    /// Errors that occur during integer parsing (config values, URL fragments).
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// A specialized `Result` type for relay-core operations.
pub type Result<T> = std::result::Result<T, TsRelayError>;
