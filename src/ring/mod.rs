//! Live TS ring buffer with Smart Start (§4.1, §4.2): per-stream,
//! packet-aligned storage with metadata indexing and a scored checkpoint
//! scan for minimal-zap-in client joins.

pub mod buffer;
pub mod checkpoint;
pub mod meta;
pub mod smart_start;
pub mod stream;

pub use buffer::{Packet, ReadOutcome, ReaderHandle, RingBuffer};
pub use checkpoint::{Checkpoint, CheckpointRing};
pub use meta::{LastSeen, Meta};
pub use smart_start::{ReadyWaitOutcome, SmartStartDebug, StartMode, StartResult};
pub use stream::{ClientGuard, StreamHandle};
