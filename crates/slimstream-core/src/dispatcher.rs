//! Fans chunks from the [`ChunkQueue`] out to every eligible Streaming
//! Session (§4.6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;

use crate::chunk::ChunkQueue;

/// A destination a dequeued chunk is delivered to.
///
/// Implemented by `StreamingSession`; kept as a trait object so the
/// Dispatcher never depends on transport details, per the "Dynamic dispatch
/// over capture devices / transports" design note.
pub trait ChunkSink: Send + Sync {
    fn client_id(&self) -> &str;

    /// Delivers a chunk's bytes if `sampling_rate` matches this sink's
    /// negotiated rate; otherwise drops it with a warning (§4.5).
    fn on_chunk(&self, data: &[u8], sampling_rate: u32);

    /// `true` once this sink can no longer accept chunks (closed/errored),
    /// so the Dispatcher can reap it on the next pass.
    fn is_closed(&self) -> bool;
}

/// Registry of active Streaming Sessions, keyed by `clientID`.
///
/// Guarded only by the Dispatcher thread and by session add/remove (§4.6) -
/// never by the capture thread, which never touches this type.
#[derive(Default)]
pub struct SessionRegistry {
    pub(crate) sessions: DashMap<String, Arc<dyn ChunkSink>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<dyn ChunkSink>) {
        self.sessions.insert(session.client_id().to_string(), session);
    }

    pub fn unregister(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Idle-poll interval for the drain loop when the [`ChunkQueue`] is empty.
/// The queue has no blocking-wait primitive by design (§4.2: producer never
/// blocks), so the Dispatcher falls back to a short sleep between polls.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// The single consumer of a [`ChunkQueue`] (§4.6): drains it and fans each
/// chunk out to every registered [`ChunkSink`].
pub struct Dispatcher {
    queue: Arc<ChunkQueue>,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(queue: Arc<ChunkQueue>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            queue,
            registry,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop_handle(&self) -> DispatcherStopHandle {
        DispatcherStopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Runs the drain loop until stopped. Blocks the calling thread; callers
    /// run this on a dedicated `std::thread` since fanning out to a slow
    /// session may block, and slow sessions are explicitly allowed to bound
    /// overall dispatch throughput (§5).
    ///
    /// On stop, per the shutdown order in §5, drains any chunks still queued
    /// before returning.
    pub fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            if !self.dispatch_one() {
                thread::sleep(IDLE_POLL_INTERVAL);
            }
        }

        while self.dispatch_one() {}
    }

    /// Dequeues and fans out at most one chunk. Returns `false` if the queue
    /// was empty.
    fn dispatch_one(&self) -> bool {
        let Some(chunk) = self.queue.try_dequeue() else {
            return false;
        };

        let data = chunk.data();
        let sampling_rate = chunk.sampling_rate();

        let mut stale = Vec::new();
        for entry in self.registry.sessions.iter() {
            let session = entry.value();
            if session.is_closed() {
                stale.push(entry.key().clone());
                continue;
            }
            session.on_chunk(data, sampling_rate);
        }

        drop(chunk);
        for client_id in stale {
            self.registry.unregister(&client_id);
        }
        true
    }
}

/// Cloneable stop signal for a [`Dispatcher`], usable from any thread.
#[derive(Clone)]
pub struct DispatcherStopHandle {
    running: Arc<AtomicBool>,
}

impl DispatcherStopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        id: String,
        rate: u32,
        received: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl ChunkSink for RecordingSink {
        fn client_id(&self) -> &str {
            &self.id
        }
        fn on_chunk(&self, data: &[u8], sampling_rate: u32) {
            if sampling_rate == self.rate {
                self.received.lock().push(data.to_vec());
            }
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    #[test]
    fn dispatches_to_matching_rate_and_skips_mismatched() {
        let queue = Arc::new(ChunkQueue::new(4, 8));
        queue.enqueue(
            |chunk| {
                chunk.buffer_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
                chunk.set_data_size(4);
                chunk.set_sampling_rate(48000);
                true
            },
            || panic!("no overflow expected"),
        );

        let registry = Arc::new(SessionRegistry::new());
        let matching = Arc::new(RecordingSink {
            id: "matching".into(),
            rate: 48000,
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let mismatched = Arc::new(RecordingSink {
            id: "mismatched".into(),
            rate: 44100,
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        registry.register(matching.clone());
        registry.register(mismatched.clone());

        let dispatcher = Dispatcher::new(queue, registry);
        assert!(dispatcher.dispatch_one());

        assert_eq!(matching.received.lock().as_slice(), &[vec![1, 2, 3, 4]]);
        assert!(mismatched.received.lock().is_empty());
    }

    #[test]
    fn reaps_closed_sessions_on_next_dispatch() {
        let queue = Arc::new(ChunkQueue::new(4, 8));
        let registry = Arc::new(SessionRegistry::new());
        let closed_sink = Arc::new(RecordingSink {
            id: "gone".into(),
            rate: 48000,
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(true),
        });
        registry.register(closed_sink);
        assert_eq!(registry.len(), 1);

        queue.enqueue(
            |chunk| {
                chunk.set_data_size(0);
                chunk.set_sampling_rate(48000);
                true
            },
            || panic!("no overflow expected"),
        );

        let dispatcher = Dispatcher::new(queue, Arc::clone(&registry));
        assert!(dispatcher.dispatch_one());
        assert!(registry.is_empty());
    }

    #[test]
    fn dispatch_one_returns_false_when_queue_empty() {
        let queue = Arc::new(ChunkQueue::new(2, 8));
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(queue, registry);
        assert!(!dispatcher.dispatch_one());
    }
}
