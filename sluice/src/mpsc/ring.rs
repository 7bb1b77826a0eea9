//! Core lock-free MPSC ring buffer algorithm.
//!
//! Many producers race to reserve slots with a CAS on the shared write
//! counter; one consumer drains in sequence order.
//!
//! # Protocol
//!
//! Three counters, each on its own cache line:
//!
//! - `write_seq`: reservation counter. A producer claims sequence `w` by a
//!   successful CAS `w -> w + 1` (acq_rel on success, relaxed on failure;
//!   failed producers yield and retry).
//! - `commit_seq`: publication counter. After writing slot `w & (N - 1)` the
//!   winning producer waits until `commit_seq == w` and then release-stores
//!   `w + 1`, so slots become visible in sequence order and the consumer can
//!   never observe a reserved-but-unwritten slot.
//! - `read_seq`: consumer counter, gated on `commit_seq` with acquire.
//!
//! Splitting reservation from publication costs one counter but removes the
//! race where a consumer sees the write counter advance past a slot whose
//! bytes are still being written. A producer preempted between its CAS and
//! its commit delays publication of every later sequence; it never exposes
//! torn data.
//!
//! # Safety
//!
//! `push` is safe for any number of concurrent producers. `pop` requires
//! exactly one consumer.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::cell::Slot;

/// Producer-side reservation counter.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Next sequence to reserve. Producers race on this with CAS.
    pub write_seq: AtomicU64,
}

impl ProducerState {
    pub const fn new() -> Self {
        Self {
            write_seq: AtomicU64::new(0),
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Publication counter, advanced in sequence order by the producers.
#[repr(C)]
#[repr(align(64))]
pub struct CommitState {
    /// Highest sequence whose slot write is complete, plus one.
    pub commit_seq: AtomicU64,
}

impl CommitState {
    pub const fn new() -> Self {
        Self {
            commit_seq: AtomicU64::new(0),
        }
    }
}

impl Default for CommitState {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side read counter.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerState {
    /// Next sequence to read. Only the consumer modifies this.
    pub read_seq: AtomicU64,
}

impl ConsumerState {
    pub const fn new() -> Self {
        Self {
            read_seq: AtomicU64::new(0),
        }
    }
}

impl Default for ConsumerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Core MPSC ring buffer.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    /// Reservation counter line.
    pub producer: ProducerState,

    /// Publication counter line.
    pub committed: CommitState,

    /// Consumer counter line.
    pub consumer: ConsumerState,

    /// Keeps the consumer counter line and the buffer apart.
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
    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            producer: ProducerState::new(),
            committed: CommitState::new(),
            consumer: ConsumerState::new(),
            _padding: [0u8; 64],
            // SAFETY: MaybeUninit slots do not require initialization.
            buffer: unsafe { MaybeUninit::<[Slot<T>; N]>::uninit().assume_init() },
        }
    }

    /// Initializes the ring in place inside caller-supplied storage.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, well-aligned for `Ring<T, N>`, writable for
    /// `size_of::<Self>()` bytes, and exclusively owned during the call.
    pub unsafe fn init_in_place(ptr: *mut Self) {
        let () = Self::CAPACITY_OK;
        // SAFETY: caller guarantees validity and exclusive access.
        unsafe {
            ptr::addr_of_mut!((*ptr).producer).write(ProducerState::new());
            ptr::addr_of_mut!((*ptr).committed).write(CommitState::new());
            ptr::addr_of_mut!((*ptr).consumer).write(ConsumerState::new());
        }
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot<T> {
        &self.buffer[(seq & Self::MASK) as usize]
    }

    /// Writes the claimed slot and publishes it in sequence order.
    ///
    /// # Safety
    ///
    /// The caller must have won the CAS for `write`, and the ring must be
    /// initialized.
    #[inline]
    pub(crate) unsafe fn commit(&self, write: u64, item: T) {
        // SAFETY: the CAS gave this producer exclusive ownership of the slot
        // until commit_seq passes it, and the fullness check bounded the
        // consumer away from it.
        unsafe {
            let slot_ptr = self.slot(write).value.get().get();
            ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        // Wait for predecessors to publish. The acquire load chains this
        // producer's release store after every earlier slot write, so a
        // consumer that observes commit_seq = w + 1 sees all slots <= w.
        while self.committed.commit_seq.load(Ordering::Acquire) != write {
            std::hint::spin_loop();
        }
        self.committed
            .commit_seq
            .store(write.wrapping_add(1), Ordering::Release);
    }

    /// Attempts to push an item onto the queue.
    ///
    /// Lock-free: a failed CAS means another producer reserved the slot and
    /// made progress.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized. Any number
    /// of producers may call this concurrently.
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        loop {
            let write = self.producer.write_seq.load(Ordering::Relaxed);
            // Acquire pairs with the consumer's release of read_seq.
            let read = self.consumer.read_seq.load(Ordering::Acquire);

            if write.wrapping_sub(read) >= N as u64 {
                return Err(item);
            }

            if self
                .producer
                .write_seq
                .compare_exchange_weak(
                    write,
                    write.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // SAFETY: CAS won; this producer owns slot `write`.
                unsafe { self.commit(write, item) };
                return Ok(());
            }

            // Another producer claimed the sequence; back off and retry.
            thread::yield_now();
        }
    }

    /// Attempts to pop an item from the queue.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single consumer)
    /// - The ring has been properly initialized
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        let read = self.consumer.read_seq.load(Ordering::Relaxed);
        // Gate on the publication counter, never the reservation counter:
        // sequences in (commit_seq, write_seq] may still be mid-write.
        let committed = self.committed.commit_seq.load(Ordering::Acquire);

        if read >= committed {
            return None;
        }

        // SAFETY: read < commit_seq, so the slot write for `read` completed
        // and the producers cannot reuse the slot until read_seq advances.
        let item = unsafe {
            let slot_ptr = self.slot(read).value.get().get();
            ptr::read(slot_ptr).assume_init()
        };

        // Release pairs with the producers' acquire load in the fullness
        // check, returning the slot for reuse.
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

// SAFETY: Ring is Send because all fields are Send.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// producers synchronize via CAS on write_seq and ordered stores to
// commit_seq; the consumer gates on commit_seq with acquire.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_fifo() {
        let ring: Ring<u64, 8> = Ring::new();

        unsafe {
            assert!(ring.push(1).is_ok());
            assert!(ring.push(2).is_ok());
            assert!(ring.push(3).is_ok());

            assert_eq!(ring.pop(), Some(1));
            assert_eq!(ring.pop(), Some(2));
            assert_eq!(ring.pop(), Some(3));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn refuses_when_full() {
        let ring: Ring<u64, 4> = Ring::new();

        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            assert_eq!(ring.push(99), Err(99));

            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
            assert_eq!(ring.push(100), Err(100));
        }
    }

    #[test]
    fn no_loss_no_duplication_across_producers() {
        let ring: Arc<Ring<u64, 64>> = Arc::new(Ring::new());
        let producers = 4u64;
        let per_producer = 1_000u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let value = p * per_producer + i;
                        // SAFETY: push is multi-producer safe.
                        while unsafe { ring.push(value) }.is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let total = (producers * per_producer) as usize;
                let mut seen = vec![false; total];
                let mut received = 0usize;
                while received < total {
                    // SAFETY: this thread is the only consumer.
                    if let Some(v) = unsafe { ring.pop() } {
                        let idx = v as usize;
                        assert!(!seen[idx], "value {v} delivered twice");
                        seen[idx] = true;
                        received += 1;
                    } else {
                        thread::yield_now();
                    }
                }
                assert!(seen.iter().all(|&s| s));
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let ring: Arc<Ring<(u64, u64), 32>> = Arc::new(Ring::new());
        let producers = 3u64;
        let per_producer = 2_000u64;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        while unsafe { ring.push((p, i)) }.is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut next = vec![0u64; producers as usize];
                let mut received = 0u64;
                while received < producers * per_producer {
                    if let Some((p, i)) = unsafe { ring.pop() } {
                        assert_eq!(i, next[p as usize], "producer {p} reordered");
                        next[p as usize] += 1;
                        received += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        consumer.join().unwrap();
    }
}
