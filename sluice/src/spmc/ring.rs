//! Core lock-free SPMC unicast ring buffer algorithm.
//!
//! One producer, many consumers, each item consumed exactly once: the
//! consumers race on a single shared read counter with CAS (work stealing).
//!
//! # Protocol
//!
//! The producer side is identical in spirit to SPSC: nothing races with it,
//! so a relaxed load of its own `write_seq`, an acquire load of `read_seq`
//! for the fullness check, the slot write, and a release store publish each
//! item. Consumers claim sequence `r` by CAS `r -> r + 1` on `read_seq`
//! (acq_rel on success, relaxed on failure, yield and retry on contention);
//! the winner then moves the value out of the claimed slot.
//!
//! # The claim-then-move window
//!
//! The winner's CAS advances `read_seq` before the value is moved out, so
//! the producer may consider the slot free while the move is still in
//! flight. The move targets slot `r & (N - 1)`, which the producer reuses
//! only for sequence `r + N`; with up to `C` consumers mid-claim the
//! producer can reach that sequence only after `N` further pops, so the
//! window is harmless as long as `N` exceeds the number of consumers
//! claiming simultaneously. Keep the capacity above the consumer count.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::cell::Slot;

/// Producer-side write counter.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Total number of completed pushes. Owned by the single producer.
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

/// Shared consumer-side read counter, raced on with CAS.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerState {
    /// Next sequence to claim. Consumers race on this with CAS.
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

/// Core SPMC unicast ring buffer.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    /// Producer counter line.
    pub producer: ProducerState,

    /// Shared consumer counter line.
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
        let write = self.producer.write_seq.load(Ordering::Relaxed);
        // Acquire pairs with the winning consumer's CAS release.
        let read = self.consumer.read_seq.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= N as u64 {
            return Err(item);
        }

        // SAFETY: the fullness check keeps every claimed sequence at least N
        // away from `write`, so no consumer is reading this slot.
        unsafe {
            let slot_ptr = self.slot(write).value.get().get();
            ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        self.producer
            .write_seq
            .store(write.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Attempts to pop an item from the queue.
    ///
    /// Lock-free: a failed CAS means another consumer claimed the sequence
    /// and made progress. Exactly one consumer receives each item.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized. Any number
    /// of consumers may call this concurrently.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        loop {
            let read = self.consumer.read_seq.load(Ordering::Relaxed);
            // Acquire pairs with the producer's release of write_seq and
            // makes the slot contents visible.
            let write = self.producer.write_seq.load(Ordering::Acquire);

            if read >= write {
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
                // SAFETY: the CAS claimed sequence `read` exclusively; only
                // the winner moves the value out. See the module note on the
                // claim-then-move window.
                let item = unsafe {
                    let slot_ptr = self.slot(read).value.get().get();
                    ptr::read(slot_ptr).assume_init()
                };
                return Some(item);
            }

            // Lost the claim race; back off and retry.
            thread::yield_now();
        }
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
// the producer publishes with release stores of write_seq, consumers
// serialize claims through CAS on read_seq.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_consumer_fifo() {
        let ring: Ring<u64, 8> = Ring::new();

        unsafe {
            for i in 0..5 {
                assert!(ring.push(i).is_ok());
            }
            for i in 0..5 {
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
            assert_eq!(ring.push(4), Err(4));
            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
        }
    }

    #[test]
    fn each_item_claimed_exactly_once() {
        let ring: Arc<Ring<u64, 64>> = Arc::new(Ring::new());
        let total = 4_000u64;
        let consumers = 4;

        let handles: Vec<_> = (0..consumers)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        // SAFETY: pop is multi-consumer safe.
                        match unsafe { ring.pop() } {
                            Some(v) if v == u64::MAX => break,
                            Some(v) => got.push(v),
                            None => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();

        // SAFETY: this thread is the only producer.
        unsafe {
            for i in 0..total {
                while ring.push(i).is_err() {
                    thread::yield_now();
                }
            }
            // One poison value per consumer to shut them down.
            for _ in 0..consumers {
                while ring.push(u64::MAX).is_err() {
                    thread::yield_now();
                }
            }
        }

        let mut seen = vec![false; total as usize];
        for h in handles {
            for v in h.join().unwrap() {
                assert!(!seen[v as usize], "value {v} claimed twice");
                seen[v as usize] = true;
            }
        }
        assert!(seen.iter().all(|&s| s), "some values were lost");
    }
}
