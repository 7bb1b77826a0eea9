//! Core lock-free MPMC unicast ring buffer algorithm.
//!
//! The producer side is the MPSC path (CAS reservation on `write_seq`,
//! in-order publication through `commit_seq`); the consumer side is the SPMC
//! unicast path (CAS claim race on `read_seq`), except that consumers gate
//! on `commit_seq` so they never observe a reserved-but-unwritten slot.
//!
//! # Safety
//!
//! Both `push` and `pop` tolerate any number of concurrent callers; the only
//! contract is that the ring has been initialized.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;
use std::thread;

use crate::cell::Slot;
use crate::mpsc::ring::{CommitState, ProducerState};
use crate::spmc::ring::ConsumerState;

/// Core MPMC unicast ring buffer.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    /// Reservation counter line (raced on by producers).
    pub producer: ProducerState,

    /// Publication counter line (advanced in sequence order).
    pub committed: CommitState,

    /// Shared consumer counter line (raced on by consumers).
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

    /// Attempts to push an item onto the queue.
    ///
    /// Lock-free for any number of producers.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized.
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        loop {
            let write = self.producer.write_seq.load(Ordering::Relaxed);
            // Acquire pairs with a claiming consumer's CAS release.
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
                // SAFETY: CAS won; slot write plus in-order publication.
                unsafe { self.write_and_publish(write, item) };
                return Ok(());
            }

            thread::yield_now();
        }
    }

    /// Attempts to pop an item from the queue.
    ///
    /// Lock-free for any number of consumers; each item is claimed by
    /// exactly one of them.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        loop {
            let read = self.consumer.read_seq.load(Ordering::Relaxed);
            // Gate on the publication counter, not the reservation counter.
            let committed = self.committed.commit_seq.load(Ordering::Acquire);

            if read >= committed {
                return None;
            }

            if self
                .consumer
                .read_seq
                .compare_exchange_weak(
                    read,
                    read.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // SAFETY: the CAS claimed sequence `read` exclusively and
                // read < commit_seq guarantees the slot write completed.
                let item = unsafe {
                    let slot_ptr = self.slot(read).value.get().get();
                    ptr::read(slot_ptr).assume_init()
                };
                return Some(item);
            }

            thread::yield_now();
        }
    }

    /// Slot write plus ordered advance of `commit_seq` (see the MPSC core).
    #[inline]
    unsafe fn write_and_publish(&self, write: u64, item: T) {
        // SAFETY: caller won the CAS for `write`; the fullness check bounded
        // every claimed read sequence away from this slot.
        unsafe {
            let slot_ptr = self.slot(write).value.get().get();
            ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        while self.committed.commit_seq.load(Ordering::Acquire) != write {
            std::hint::spin_loop();
        }
        self.committed
            .commit_seq
            .store(write.wrapping_add(1), Ordering::Release);
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ring is Send because all fields are Send.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: Ring is Sync because every operation goes through the atomic
// counters; slot access is serialized by CAS reservation and claim.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_fifo() {
        let ring: Ring<u64, 8> = Ring::new();

        unsafe {
            for i in 0..6 {
                assert!(ring.push(i).is_ok());
            }
            for i in 0..6 {
                assert_eq!(ring.pop(), Some(i));
            }
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
            assert_eq!(ring.push(9), Err(9));
            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
        }
    }

    #[test]
    fn multiset_preserved_across_producers_and_consumers() {
        let ring: Arc<Ring<u64, 1024>> = Arc::new(Ring::new());
        let producers = 4u64;
        let per_producer = 1_000u64;

        let producer_handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let value = p * per_producer + i;
                        while unsafe { ring.push(value) }.is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = producers * per_producer;
        let consumed = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let consumer_handles: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let consumed = Arc::clone(&consumed);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while consumed.load(Ordering::Relaxed) < total {
                        if let Some(v) = unsafe { ring.pop() } {
                            consumed.fetch_add(1, Ordering::Relaxed);
                            got.push(v);
                        } else {
                            thread::yield_now();
                        }
                    }
                    got
                })
            })
            .collect();

        for h in producer_handles {
            h.join().unwrap();
        }

        let mut all = HashSet::new();
        let mut count = 0u64;
        for h in consumer_handles {
            for v in h.join().unwrap() {
                assert!(all.insert(v), "value {v} consumed twice");
                count += 1;
            }
        }
        assert_eq!(count, total);
        assert_eq!(all.len() as u64, total);
        for v in 0..total {
            assert!(all.contains(&v), "value {v} lost");
        }
    }
}
