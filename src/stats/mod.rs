//! Observability snapshots (§6 "Observability"): per-stream, mux, and
//! decrypt status structs shaped for JSON export. Each tracker here is a
//! thin, lock-protected accumulator the owning subsystem updates as it
//! runs; the `snapshot()` methods are what an embedder's status endpoint
//! calls.

pub mod decrypt_status;
pub mod mux_status;
pub mod stream_status;

pub use decrypt_status::DecryptStatus;
pub use mux_status::{MuxStatus, MuxTraffic};
pub use stream_status::{InputMetric, StreamState, StreamStatus, StreamTracker};
