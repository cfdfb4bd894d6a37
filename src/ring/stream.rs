//! Stream lifecycle (§3 "Stream Descriptor" lifecycle, §5 cancellation
//! semantics, §9 "Manual refcounting"). The teacher's C code tracked a
//! `delete_pending` flag alongside a hand-rolled refcount; here a single
//! `Arc<RingBuffer>` plus an explicit client counter replaces both — the
//! last client handle dropping is the only signal destruction needs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::buffer::RingBuffer;

/// Owns a stream's ring buffer and ingest thread handle. Created on config
/// apply; destroyed only once the ingest thread has stopped AND the
/// connected-client count reaches zero (§3).
pub struct StreamHandle {
    pub buffer: Arc<RingBuffer>,
    clients: AtomicUsize,
    ingest_thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamHandle {
    pub fn new(buffer: Arc<RingBuffer>) -> Self {
        StreamHandle { buffer, clients: AtomicUsize::new(0), ingest_thread: std::sync::Mutex::new(None) }
    }

    /// Registers the ingest thread so `shutdown` can join it.
    pub fn set_ingest_thread(&self, handle: JoinHandle<()>) {
        *self.ingest_thread.lock().unwrap() = Some(handle);
    }

    /// A client has connected; returns a `ClientGuard` whose `Drop` releases it.
    pub fn connect_client(self: &Arc<Self>) -> ClientGuard {
        self.clients.fetch_add(1, Ordering::SeqCst);
        ClientGuard { stream: Arc::clone(self) }
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Signals the ingest thread to stop and blocks until it has joined.
    /// Per §3, actual destruction (dropping this `StreamHandle`) still waits
    /// for `client_count() == 0` — deferred to whichever caller notices last.
    pub fn shutdown(&self) {
        self.buffer.close();
        if let Some(handle) = self.ingest_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Whether this stream is safe to drop: thread joined and no clients.
    pub fn destroyable(&self) -> bool {
        self.ingest_thread.lock().unwrap().is_none() && self.client_count() == 0
    }
}

/// RAII client connection marker; dropping it decrements the stream's
/// connected-client count.
pub struct ClientGuard {
    stream: Arc<StreamHandle>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.stream.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;

    #[test]
    fn client_guard_tracks_refcount() {
        let stream = Arc::new(StreamHandle::new(Arc::new(RingBuffer::new(StreamConfig::default()))));
        assert!(stream.destroyable());
        let guard = stream.connect_client();
        assert_eq!(stream.client_count(), 1);
        assert!(!stream.destroyable());
        drop(guard);
        assert_eq!(stream.client_count(), 0);
        assert!(stream.destroyable());
    }
}
