//! # Utility Functions and Types
//!
//! Bit-level bitstream reading and MPEG-2 CRC32 calculation shared by the
//! `ts` and `codec` modules.
//!
//! ```rust
//! use tsrelay::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let checksum = crc.calculate(b"Hello, world!");
//! println!("CRC32: {:08x}", checksum);
//! ```

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// CRC calculation implementations
pub mod crc;

// Re-export commonly used types
pub use bits::*;
pub use crc::Crc32Mpeg2;
