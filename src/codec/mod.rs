//! NAL-unit boundary scanning used by the ring buffer's `idr_parse` keyframe
//! detector (§4.1). Only NAL *type* detection is needed here — no SPS/PPS
//! semantic decoding, no transcoding.

pub mod nal;

pub use nal::{scan_annexb, Codec, NalHit};
