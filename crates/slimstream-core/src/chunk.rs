//! Fixed-capacity SPSC ring of preallocated PCM chunks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed byte buffer holding up to `capacity` bytes of post-marker-strip
/// PCM payload, plus the sampling rate it was captured at.
///
/// Allocated once at queue construction and reused for the lifetime of the
/// queue; `data_size` tracks how much of `buffer` is currently filled.
pub struct Chunk {
    buffer: Vec<u8>,
    data_size: usize,
    sampling_rate: u32,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            data_size: 0,
            sampling_rate: 0,
        }
    }

    /// Mutable access to the full preallocated buffer, for the producer to
    /// copy payload bytes into starting at offset 0.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn set_data_size(&mut self, size: usize) {
        debug_assert!(size <= self.buffer.len());
        self.data_size = size;
    }

    pub fn set_sampling_rate(&mut self, rate: u32) {
        self.sampling_rate = rate;
    }

    /// The filled portion of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.data_size]
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }
}

/// Bounded single-producer/single-consumer ring of `Chunk` slots.
///
/// `enqueue` never blocks: if no slot is free it invokes `on_overflow` and
/// leaves the write cursor untouched (backpressure by drop, not by stall).
/// Safety of the lock-free ring depends on the single-producer/single-consumer
/// contract documented on [`ChunkQueue::enqueue`] and [`ChunkQueue::try_dequeue`].
pub struct ChunkQueue {
    slots: Box<[UnsafeCell<Chunk>]>,
    capacity: usize,
    write_cursor: AtomicUsize,
    read_cursor: AtomicUsize,
}

// SAFETY: access to `slots[i]` is partitioned in time between exactly one
// producer (enqueue) and exactly one consumer (try_dequeue) by the cursor
// protocol: the producer only writes a slot after the consumer's read
// cursor has advanced past it, and the consumer only reads a slot after the
// producer's write cursor has advanced past it.
unsafe impl Sync for ChunkQueue {}

impl ChunkQueue {
    /// Builds a queue of `capacity` preallocated chunks, each sized to hold
    /// `chunk_capacity_bytes` bytes of payload.
    pub fn new(capacity: usize, chunk_capacity_bytes: usize) -> Self {
        assert!(capacity > 0, "chunk queue capacity must be >= 1");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(Chunk::new(chunk_capacity_bytes)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            capacity,
            write_cursor: AtomicUsize::new(0),
            read_cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Called by the single producer (the capture thread) only.
    ///
    /// If a slot is free, `fill` is invoked with exclusive access to it and
    /// must return `true` to commit the write (advancing the write cursor)
    /// or `false` to leave the slot untouched. If no slot is free,
    /// `on_overflow` is invoked instead and the write cursor is unchanged.
    pub fn enqueue(&self, fill: impl FnOnce(&mut Chunk) -> bool, on_overflow: impl FnOnce()) {
        let write = self.write_cursor.load(Ordering::Relaxed);
        let read = self.read_cursor.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= self.capacity {
            on_overflow();
            return;
        }

        let index = write % self.capacity;
        // SAFETY: single producer; this slot is not readable by the consumer
        // until `write_cursor` is advanced below, and the consumer has
        // already released it since `write - read < capacity`.
        let chunk = unsafe { &mut *self.slots[index].get() };
        let committed = fill(chunk);

        if committed {
            self.write_cursor.store(write.wrapping_add(1), Ordering::Release);
        }
    }

    /// Called by the single consumer (the Dispatcher) only. Returns a
    /// reference to the next unread chunk, if any, without blocking.
    pub fn try_dequeue(&self) -> Option<ChunkGuard<'_>> {
        let read = self.read_cursor.load(Ordering::Relaxed);
        let write = self.write_cursor.load(Ordering::Acquire);

        if read == write {
            return None;
        }

        let index = read % self.capacity;
        Some(ChunkGuard {
            queue: self,
            index,
            read,
        })
    }
}

/// Borrowed handle to the next chunk in the queue; dropping it releases the
/// slot back to the producer by advancing the read cursor.
pub struct ChunkGuard<'a> {
    queue: &'a ChunkQueue,
    index: usize,
    read: usize,
}

impl<'a> std::ops::Deref for ChunkGuard<'a> {
    type Target = Chunk;

    fn deref(&self) -> &Chunk {
        // SAFETY: single consumer; this slot was published by the producer
        // (write_cursor advanced past it) and will not be touched by the
        // producer again until the read cursor (advanced on Drop) passes it.
        unsafe { &*self.queue.slots[self.index].get() }
    }
}

impl<'a> Drop for ChunkGuard<'a> {
    fn drop(&mut self) {
        self.queue
            .read_cursor
            .store(self.read.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn enqueue_fills_and_dequeue_drains_in_order() {
        let queue = ChunkQueue::new(2, 8);

        queue.enqueue(
            |chunk| {
                chunk.buffer_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
                chunk.set_data_size(4);
                chunk.set_sampling_rate(48000);
                true
            },
            || panic!("unexpected overflow"),
        );

        let first = queue.try_dequeue().expect("chunk available");
        assert_eq!(first.data(), &[1, 2, 3, 4]);
        assert_eq!(first.sampling_rate(), 48000);
        drop(first);

        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn overflow_invokes_callback_without_advancing_write_cursor() {
        let queue = ChunkQueue::new(1, 8);
        queue.enqueue(
            |chunk| {
                chunk.set_data_size(1);
                true
            },
            || panic!("unexpected overflow"),
        );

        let overflowed = Cell::new(false);
        queue.enqueue(
            |_chunk| {
                panic!("must not be invoked when no slot is free");
            },
            || overflowed.set(true),
        );

        assert!(overflowed.get());

        // the one committed chunk is still there, untouched
        let guard = queue.try_dequeue().expect("original chunk preserved");
        assert_eq!(guard.data_size(), 1);
    }

    #[test]
    fn fill_returning_false_does_not_commit() {
        let queue = ChunkQueue::new(1, 8);
        queue.enqueue(|_chunk| false, || panic!("not an overflow"));
        assert!(queue.try_dequeue().is_none());
    }
}
