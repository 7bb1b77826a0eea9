//! Core lock-free SPSC ring buffer algorithm.
//!
//! This module provides the fundamental single-producer single-consumer ring
//! used by both [`crate::ipc::spsc`] (shared memory) and [`crate::sync::spsc`]
//! (heap). The ring is a plain `#[repr(C)]` value with no owning pointers, so
//! it can be constructed in place inside a shared memory mapping.
//!
//! # Protocol
//!
//! Two monotonic 64-bit sequence counters, `write_seq` and `read_seq`, count
//! total pushes and pops. The slot for sequence `s` is `s & (N - 1)`; `N`
//! must be a power of two. The producer's release store of `write_seq = s + 1`
//! publishes slot `s`; the consumer's release store of `read_seq = s + 1`
//! returns it for reuse. Each side keeps a role-owned cache of the peer's
//! counter and only refreshes it (with acquire) when the cached value reports
//! the queue full respectively empty.
//!
//! # Safety
//!
//! The types in this module have unsafe APIs because they require the caller
//! to uphold the SPSC invariant: exactly one producer and one consumer, with
//! no concurrent access to either role.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cell::{ConsumerCache, ProducerCache, Slot};

/// Producer-side counter line: write sequence plus cached read sequence.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Total number of completed pushes. Owned by the producer, read by the
    /// consumer with acquire ordering.
    pub write_seq: AtomicU64,

    /// Producer-local copy of `read_seq`, refreshed on demand.
    pub cached_read: ProducerCache<u64>,
}

impl ProducerState {
    pub const fn new() -> Self {
        Self {
            write_seq: AtomicU64::new(0),
            cached_read: ProducerCache::new(0),
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side counter line: read sequence plus cached write sequence.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerState {
    /// Total number of completed pops. Owned by the consumer, read by the
    /// producer with acquire ordering.
    pub read_seq: AtomicU64,

    /// Consumer-local copy of `write_seq`, refreshed on demand.
    pub cached_write: ConsumerCache<u64>,
}

impl ConsumerState {
    pub const fn new() -> Self {
        Self {
            read_seq: AtomicU64::new(0),
            cached_write: ConsumerCache::new(0),
        }
    }
}

impl Default for ConsumerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Core SPSC ring buffer.
///
/// Contains only the essential algorithm state; shared-memory headers and
/// heap handles are layered on top by the `ipc` and `sync` modules.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    /// Producer counter line (write sequence + cached read).
    pub producer: ProducerState,

    /// Consumer counter line (read sequence + cached write).
    pub consumer: ConsumerState,

    /// Keeps the consumer counter line and the buffer on separate cache lines.
    pub _padding: [u8; 64],

    /// Ring buffer slots.
    pub buffer: [Slot<T>; N],
}

impl<T, const N: usize> Ring<T, N> {
    /// Compile-time capacity validation, forced at monomorphization.
    pub const CAPACITY_OK: () = assert!(
        N >= 2 && N.is_power_of_two(),
        "ring capacity must be a power of two >= 2"
    );

    /// Bitmask mapping a sequence number to a slot index.
    pub const MASK: u64 = N as u64 - 1;

    /// Creates an initialized ring with all counters at zero.
    ///
    /// Buffer slots are left uninitialized; a slot only holds a live `T`
    /// between push and pop.
    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            producer: ProducerState::new(),
            consumer: ConsumerState::new(),
            _padding: [0u8; 64],
            // SAFETY: MaybeUninit slots do not require initialization.
            buffer: unsafe { MaybeUninit::<[Slot<T>; N]>::uninit().assume_init() },
        }
    }

    /// Initializes the ring in place inside caller-supplied storage.
    ///
    /// Only the counter lines are written; the slots stay uninitialized.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, well-aligned for `Ring<T, N>`, writable for
    /// `size_of::<Self>()` bytes, and exclusively owned during the call.
    pub unsafe fn init_in_place(ptr: *mut Self) {
        let () = Self::CAPACITY_OK;
        // SAFETY: caller guarantees validity and exclusive access. Fields are
        // written through addr_of_mut! so no reference to uninitialized
        // memory is ever created.
        unsafe {
            ptr::addr_of_mut!((*ptr).producer).write(ProducerState::new());
            ptr::addr_of_mut!((*ptr).consumer).write(ConsumerState::new());
        }
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot<T> {
        &self.buffer[(seq & Self::MASK) as usize]
    }

    /// Attempts to push an item onto the queue.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single producer)
    /// - The ring has been properly initialized
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        // Producer-owned counter, relaxed is fine.
        let write = self.producer.write_seq.load(Ordering::Relaxed);

        // SAFETY: the producer has exclusive access to its cached_read cell.
        let mut cached_read = unsafe { *self.producer.cached_read.get().get() };

        // Check fullness against the cached value first; refresh only when
        // the cache reports no space left.
        if write.wrapping_sub(cached_read) >= N as u64 {
            // Acquire pairs with the consumer's release store of read_seq,
            // which is what permits slot reuse.
            cached_read = self.consumer.read_seq.load(Ordering::Acquire);
            // SAFETY: exclusive producer access to cached_read.
            unsafe {
                *self.producer.cached_read.get().get() = cached_read;
            }

            if write.wrapping_sub(cached_read) >= N as u64 {
                return Err(item);
            }
        }

        // SAFETY: the producer owns slot `write & MASK`: the fullness check
        // guarantees the consumer is more than zero and at most N sequences
        // behind, so the consumer is not reading this slot, and write_seq has
        // not been published yet.
        unsafe {
            let slot_ptr = self.slot(write).value.get().get();
            ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        // Publish the slot (release pairs with the consumer's acquire).
        self.producer
            .write_seq
            .store(write.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Attempts to pop an item from the queue.
    ///
    /// Returns `None` if the queue is empty.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single consumer)
    /// - The ring has been properly initialized
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        // Consumer-owned counter, relaxed is fine.
        let read = self.consumer.read_seq.load(Ordering::Relaxed);

        // SAFETY: the consumer has exclusive access to its cached_write cell.
        let mut cached_write = unsafe { *self.consumer.cached_write.get().get() };

        if read >= cached_write {
            // Acquire pairs with the producer's release store of write_seq
            // and makes the slot contents visible.
            cached_write = self.producer.write_seq.load(Ordering::Acquire);
            // SAFETY: exclusive consumer access to cached_write.
            unsafe {
                *self.consumer.cached_write.get().get() = cached_write;
            }

            if read >= cached_write {
                return None;
            }
        }

        // SAFETY: read < write_seq, so slot `read & MASK` was written by the
        // producer and will not be overwritten until read_seq advances past
        // it. The slot holds an initialized T.
        let item = unsafe {
            let slot_ptr = self.slot(read).value.get().get();
            ptr::read(slot_ptr).assume_init()
        };

        // Return the slot for reuse (release pairs with the producer's
        // acquire refresh of cached_read).
        self.consumer
            .read_seq
            .store(read.wrapping_add(1), Ordering::Release);

        Some(item)
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ring is Send because all fields are Send (AtomicU64, RingCell).
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// - write_seq/read_seq are AtomicU64 with Release/Acquire ordering
// - buffer slots are protected by the SPSC invariant (see RingCell)
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counter_lines_are_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<ProducerState>(), 64);
        assert_eq!(std::mem::align_of::<ConsumerState>(), 64);
        assert_eq!(std::mem::size_of::<ProducerState>(), 64);
        assert_eq!(std::mem::size_of::<ConsumerState>(), 64);
    }

    #[test]
    fn buffer_starts_on_its_own_cache_line() {
        use std::mem::offset_of;

        type TestRing = Ring<u64, 16>;
        assert_eq!(offset_of!(TestRing, consumer), 64);
        assert_eq!(offset_of!(TestRing, buffer), 3 * 64);
    }

    #[test]
    fn fill_refuse_release_cycle() {
        let ring: Ring<u64, 4> = Ring::new();

        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            // Full: the fifth push is refused.
            assert_eq!(ring.push(4), Err(4));

            // Popping one releases exactly one slot.
            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
            assert_eq!(ring.push(5), Err(5));

            for i in 1..=4 {
                assert_eq!(ring.pop(), Some(i));
            }
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn wrapping_preserves_fifo_order() {
        let ring: Ring<u64, 4> = Ring::new();

        unsafe {
            for round in 0..5u64 {
                for i in 0..4 {
                    assert!(ring.push(round * 10 + i).is_ok());
                }
                for i in 0..4 {
                    assert_eq!(ring.pop(), Some(round * 10 + i));
                }
                assert_eq!(ring.pop(), None);
            }
        }
    }

    #[test]
    fn concurrent_producer_consumer_preserves_order() {
        let ring: Arc<Ring<u64, 32>> = Arc::new(Ring::new());
        let count = 10_000u64;

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..count {
                    // SAFETY: this thread is the only producer.
                    while unsafe { ring.push(i) }.is_err() {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut expected = 0u64;
                while expected < count {
                    // SAFETY: this thread is the only consumer.
                    if let Some(item) = unsafe { ring.pop() } {
                        assert_eq!(item, expected);
                        expected += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
