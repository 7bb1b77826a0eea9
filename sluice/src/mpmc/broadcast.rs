//! Core lock-free MPMC broadcast ring buffer algorithm.
//!
//! Producers race for slots exactly as in the MPSC core; every reader then
//! observes every published item through its own cursor, as in the SPMC
//! broadcast core, except that readers gate on `commit_seq` so a
//! reserved-but-unwritten slot is never visible.
//!
//! Unlike the single-producer broadcast ring there is no cached min-reader
//! bound and no overwrite mode: the producer side is not exclusive, so a
//! producer-local cache would go stale under concurrent reservations.
//! Instead the cursors are rescanned on every push attempt, with the
//! fullness check tied to the `write_seq` value the CAS verifies.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;
use std::thread;

use crate::cell::Slot;
use crate::mpsc::ring::{CommitState, ProducerState};
use crate::spmc::broadcast::ReaderCursor;

/// Core MPMC broadcast ring buffer.
///
/// As with the SPMC broadcast ring, every cursor counts toward the fullness
/// bound from sequence 0; all `R` reader slots must belong to live readers.
#[repr(C)]
pub struct Ring<T, const N: usize, const R: usize> {
    /// Reservation counter line (raced on by producers).
    pub producer: ProducerState,

    /// Publication counter line (advanced in sequence order).
    pub committed: CommitState,

    /// One cursor per reader, each on its own cache line.
    pub readers: [ReaderCursor; R],

    /// Keeps the last cursor and the buffer apart.
    pub _padding: [u8; 64],

    /// Ring buffer slots.
    pub buffer: [Slot<T>; N],
}

impl<T: Copy, const N: usize, const R: usize> Ring<T, N, R> {
    /// Compile-time capacity/reader validation, forced at monomorphization.
    pub const CAPACITY_OK: () = assert!(
        N >= 2 && N.is_power_of_two() && R >= 1,
        "ring capacity must be a power of two >= 2 with at least one reader"
    );

    /// Bitmask mapping a sequence number to a slot index.
    pub const MASK: u64 = N as u64 - 1;

    /// Creates an initialized ring with all counters at zero.
    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            producer: ProducerState::new(),
            committed: CommitState::new(),
            readers: [const { ReaderCursor::new() }; R],
            _padding: [0u8; 64],
            // SAFETY: MaybeUninit slots do not require initialization.
            buffer: unsafe { MaybeUninit::<[Slot<T>; N]>::uninit().assume_init() },
        }
    }

    /// Initializes the ring in place inside caller-supplied storage.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, well-aligned for `Ring<T, N, R>`, writable
    /// for `size_of::<Self>()` bytes, and exclusively owned during the call.
    pub unsafe fn init_in_place(ptr: *mut Self) {
        let () = Self::CAPACITY_OK;
        // SAFETY: caller guarantees validity and exclusive access.
        unsafe {
            ptr::addr_of_mut!((*ptr).producer).write(ProducerState::new());
            ptr::addr_of_mut!((*ptr).committed).write(CommitState::new());
            for i in 0..R {
                ptr::addr_of_mut!((*ptr).readers[i]).write(ReaderCursor::new());
            }
        }
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot<T> {
        &self.buffer[(seq & Self::MASK) as usize]
    }

    /// Attempts to push an item, refusing when the slowest reader is a full
    /// ring behind.
    ///
    /// Lock-free for any number of producers.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized.
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        loop {
            let write = self.producer.write_seq.load(Ordering::Relaxed);

            // Full cursor scan on every attempt. The subsequent CAS only
            // succeeds if write_seq still equals the value this check used.
            let mut min_read = u64::MAX;
            for cursor in &self.readers {
                min_read = min_read.min(cursor.read_seq.load(Ordering::Acquire));
            }

            if write.wrapping_sub(min_read) >= N as u64 {
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
                // SAFETY: CAS won; every cursor is past `write - N`.
                unsafe {
                    let slot_ptr = self.slot(write).value.get().get();
                    ptr::write(slot_ptr, MaybeUninit::new(item));
                }

                // In-order publication, as in the MPSC core.
                while self.committed.commit_seq.load(Ordering::Acquire) != write {
                    std::hint::spin_loop();
                }
                self.committed
                    .commit_seq
                    .store(write.wrapping_add(1), Ordering::Release);

                return Ok(());
            }

            thread::yield_now();
        }
    }

    /// Attempts to read the next item for `reader`.
    ///
    /// Copies the slot and advances only this reader's cursor. Returns
    /// `None` when the reader has caught up with the published sequences.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized and that
    /// each reader index is used by at most one thread/process at a time.
    #[inline]
    pub unsafe fn pop(&self, reader: usize) -> Option<T> {
        let cursor = &self.readers[reader];

        let read = cursor.read_seq.load(Ordering::Relaxed);
        // Gate on the publication counter, not the reservation counter.
        let committed = self.committed.commit_seq.load(Ordering::Acquire);

        if read >= committed {
            return None;
        }

        // SAFETY: read < commit_seq, so the slot write completed; copy,
        // never move, because the other readers still observe it.
        let item = unsafe {
            let slot_ptr = self.slot(read).value.get().get();
            ptr::read(slot_ptr).assume_init()
        };

        cursor
            .read_seq
            .store(read.wrapping_add(1), Ordering::Release);

        Some(item)
    }

    /// Returns `reader`'s current cursor.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    #[inline]
    pub fn read_pos(&self, reader: usize) -> u64 {
        self.readers[reader].read_seq.load(Ordering::Acquire)
    }
}

impl<T: Copy, const N: usize, const R: usize> Default for Ring<T, N, R> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ring is Send because all fields are Send.
unsafe impl<T: Send, const N: usize, const R: usize> Send for Ring<T, N, R> {}

// SAFETY: Ring is Sync because producers serialize through CAS on write_seq
// and ordered commit_seq stores, and each reader owns its cursor.
unsafe impl<T: Send, const N: usize, const R: usize> Sync for Ring<T, N, R> {}
