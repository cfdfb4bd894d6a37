#![doc(html_root_url = "https://docs.rs/tsrelay/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsrelay
//!
//! `tsrelay` is a live MPEG-TS relay core: ring-buffered smart-start
//! ingest, MPTS remultiplexing, CSA descrambling, and PCR-paced UDP/RTP
//! sync output. It is a library — wiring streams, CAMs, and transports
//! together into a running service is left to the embedder.
//!
//! ## Module Overview
//!
//! - `ts`: wire-level MPEG-TS types — packet headers, adaptation fields
//!   (including PCR), and PSI section encode/decode with MPEG-2 CRC-32.
//! - `ring`: the per-stream ring buffer with Smart Start client join
//!   selection and checkpoint scoring.
//! - `mux`: the MPTS multiplexer — PID/PNR assignment, PCR restamping,
//!   PSI regeneration, continuity-counter rewriting, and CBR shaping.
//! - `decrypt`: the CSA descrambling pipeline — CA stream key schedule,
//!   CAM dispatch with primary/backup hedging, key-guard candidate
//!   validation, and batch descrambling.
//! - `sync`: the PCR-paced producer/consumer split behind UDP/RTP output.
//! - `transport`: inbound/outbound transports (HTTP pull/push, UDP
//!   multicast ingest, UDP/RTP output).
//! - `stats`: observability snapshots for streams, the mux, and decrypt
//!   contexts.
//! - `codec`: NAL-unit boundary scanning used by the ring buffer's
//!   `idr_parse` keyframe detector.
//! - `config`: `serde`-deserializable configuration surface for streams,
//!   the mux, and decrypt contexts.
//! - `error`: the crate-wide `TsRelayError`/`Result`.

/// Codec boundary scanning (NAL units) used by keyframe detection.
pub mod codec;

/// Configuration surface for streams, mux, and decrypt contexts.
pub mod config;

/// CSA descrambling pipeline.
pub mod decrypt;

/// Error types and the crate-wide `Result` alias.
pub mod error;

/// MPTS multiplexer.
pub mod mux;

/// Live TS ring buffer with Smart Start.
pub mod ring;

/// Observability snapshots.
pub mod stats;

/// PCR-paced producer/consumer split behind UDP/RTP sync output.
pub mod sync;

/// Wire-level MPEG-TS types.
pub mod ts;

/// Inbound/outbound transports.
pub mod transport;

/// Bitstream reading and MPEG-2 CRC-32, shared by `ts` and `codec`.
pub mod utils;

pub use error::{Result, TsRelayError};
