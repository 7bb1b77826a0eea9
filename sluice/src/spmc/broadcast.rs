//! Core lock-free SPMC broadcast ring buffer algorithm.
//!
//! One producer, up to `R` readers, every reader observes every item exactly
//! once. Each reader owns a cursor on its own cache line and advances it
//! independently; the producer's available space is governed by the slowest
//! cursor.
//!
//! # Protocol
//!
//! The producer publishes slot `w & (N - 1)` with a release store of
//! `write_seq = w + 1`; every reader independently synchronizes with that
//! store through its acquire load of `write_seq`. A slot is reclaimable for
//! reuse only once every cursor has passed it, so readers copy values out
//! instead of moving them.
//!
//! Scanning all `R` cursors on every push would make the hot path linear in
//! `R`. The producer instead keeps a private `min_read_cache` and rescans
//! only when the cached bound reports the ring full; while the cache is warm
//! the fast path is branch-predictable and touches no reader cache lines.
//!
//! # Overwrite mode
//!
//! [`Ring::push_overwrite`] skips the fullness check entirely: the producer
//! never blocks on a slow reader and simply laps it. A lapped reader's next
//! [`Ring::pop_lossy`] detects the lap (`write_seq > cursor + N`), fast
//! forwards the cursor to the oldest retained sequence (`write_seq - N`) and
//! reports how many items were dropped. The lost range is always a prefix of
//! what the reader had not yet seen.
//!
//! Pair `push` with `pop` and `push_overwrite` with `pop_lossy`; a reader
//! using plain `pop` against an overwriting producer gets no loss signal.
//!
//! Elements must be `Copy`: a slot is read by many readers, and in overwrite
//! mode the producer may rewrite a slot out from under a reader that is
//! being lapped mid-copy, which leaves the reader with stale bytes rather
//! than anything that would need dropping.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::cell::{ProducerCache, Slot};

/// Why a lossy receive returned no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The reader has consumed everything published so far.
    #[error("no new data")]
    Empty,

    /// The producer lapped this reader; the cursor was reset to the oldest
    /// retained sequence. Carries the number of overwritten items.
    #[error("lagged behind the producer; {0} items overwritten")]
    Lagged(u64),
}

/// Producer counter line: write sequence plus the private min-reader cache.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Total number of completed pushes. Owned by the producer, read by
    /// every reader with acquire ordering.
    pub write_seq: AtomicU64,

    /// Most recently observed minimum of all reader cursors. Producer-local,
    /// refreshed only when the cached bound reports the ring full.
    pub min_read_cache: ProducerCache<u64>,
}

impl ProducerState {
    pub const fn new() -> Self {
        Self {
            write_seq: AtomicU64::new(0),
            min_read_cache: ProducerCache::new(0),
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

/// A single reader's cursor, padded to its own cache line.
#[repr(C)]
#[repr(align(64))]
pub struct ReaderCursor {
    /// Next sequence this reader will observe.
    pub read_seq: AtomicU64,
}

impl ReaderCursor {
    pub const fn new() -> Self {
        Self {
            read_seq: AtomicU64::new(0),
        }
    }
}

impl Default for ReaderCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Core SPMC broadcast ring buffer.
///
/// Every cursor counts toward the producer's fullness bound from sequence 0,
/// so in refuse mode all `R` reader slots must belong to live readers; an
/// abandoned cursor stalls the producer after `N` pushes.
#[repr(C)]
pub struct Ring<T, const N: usize, const R: usize> {
    /// Producer counter line.
    pub producer: ProducerState,

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
            for i in 0..R {
                ptr::addr_of_mut!((*ptr).readers[i]).write(ReaderCursor::new());
            }
        }
    }

    #[inline]
    fn slot(&self, seq: u64) -> &Slot<T> {
        &self.buffer[(seq & Self::MASK) as usize]
    }

    /// Scans every cursor and returns the slowest reader's sequence.
    #[inline]
    fn min_reader(&self) -> u64 {
        let mut min = u64::MAX;
        for cursor in &self.readers {
            // Acquire pairs with each reader's release store, which is what
            // permits slot reuse once all readers have passed a sequence.
            min = min.min(cursor.read_seq.load(Ordering::Acquire));
        }
        min
    }

    /// Attempts to push an item, refusing when the slowest reader is a full
    /// ring behind.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls the push methods (single producer)
    /// - The ring has been properly initialized
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        let write = self.producer.write_seq.load(Ordering::Relaxed);

        // SAFETY: the producer has exclusive access to its cache cell.
        let mut min_read = unsafe { *self.producer.min_read_cache.get().get() };

        // Rescan the cursors only when the cached bound would be violated.
        if write.wrapping_sub(min_read) >= N as u64 {
            min_read = self.min_reader();
            // SAFETY: exclusive producer access to min_read_cache.
            unsafe {
                *self.producer.min_read_cache.get().get() = min_read;
            }

            if write.wrapping_sub(min_read) >= N as u64 {
                return Err(item);
            }
        }

        // SAFETY: every cursor is past `write - N`, so no reader can still
        // be copying this slot.
        unsafe {
            let slot_ptr = self.slot(write).value.get().get();
            ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        self.producer
            .write_seq
            .store(write.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Pushes unconditionally, lapping any reader that is a full ring
    /// behind. Lapped readers learn about the loss from [`Ring::pop_lossy`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::push`].
    #[inline]
    pub unsafe fn push_overwrite(&self, item: T) {
        let write = self.producer.write_seq.load(Ordering::Relaxed);

        // SAFETY: the slot may still be unread by a lagging reader; that
        // reader sees the lap through its sequence arithmetic and
        // resynchronizes, and T: Copy keeps a mid-copy lap value-level.
        unsafe {
            let slot_ptr = self.slot(write).value.get().get();
            ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        self.producer
            .write_seq
            .store(write.wrapping_add(1), Ordering::Release);
    }

    /// Attempts to read the next item for `reader`.
    ///
    /// Copies the slot (other readers still need it) and advances only this
    /// reader's cursor. Returns `None` when the reader has caught up.
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
        // Acquire pairs with the producer's release of write_seq.
        let write = self.producer.write_seq.load(Ordering::Acquire);

        if read >= write {
            return None;
        }

        // SAFETY: read < write_seq, so the slot was published; copy, never
        // move, because the other readers still observe it.
        let item = unsafe {
            let slot_ptr = self.slot(read).value.get().get();
            ptr::read(slot_ptr).assume_init()
        };

        cursor
            .read_seq
            .store(read.wrapping_add(1), Ordering::Release);

        Some(item)
    }

    /// Attempts to read the next item for `reader`, tolerating producer
    /// overwrites.
    ///
    /// A reader strictly more than `N` behind has been lapped: its cursor is
    /// fast-forwarded to `write_seq - N` (the oldest retained sequence) and
    /// `Err(Lagged(n))` reports the `n` overwritten items. A reader exactly
    /// `N` behind can still read. Subsequent calls resume from the new
    /// cursor.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::pop`].
    #[inline]
    pub unsafe fn pop_lossy(&self, reader: usize) -> Result<T, RecvError> {
        let cursor = &self.readers[reader];

        let read = cursor.read_seq.load(Ordering::Relaxed);
        let write = self.producer.write_seq.load(Ordering::Acquire);

        if write.wrapping_sub(read) > N as u64 {
            let resume = write - N as u64;
            cursor.read_seq.store(resume, Ordering::Release);
            return Err(RecvError::Lagged(resume.wrapping_sub(read)));
        }

        if read >= write {
            return Err(RecvError::Empty);
        }

        // SAFETY: as in pop. If the producer laps this reader mid-copy the
        // bytes are stale but T: Copy keeps that a value-level problem.
        let item = unsafe {
            let slot_ptr = self.slot(read).value.get().get();
            ptr::read(slot_ptr).assume_init()
        };

        cursor
            .read_seq
            .store(read.wrapping_add(1), Ordering::Release);

        Ok(item)
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

    /// Overwrites `reader`'s cursor.
    ///
    /// This is flow control for transport boundaries (requeueing a message
    /// whose downstream send failed), and the only sanctioned way to move a
    /// cursor backward. The caller must keep `pos` within
    /// `[write_seq - N, write_seq]`; below that range reads observe already
    /// overwritten slots.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    #[inline]
    pub fn set_read_pos(&self, reader: usize, pos: u64) {
        self.readers[reader].read_seq.store(pos, Ordering::Release);
    }

    /// Advances `reader`'s cursor by `n`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    #[inline]
    pub fn fetch_add_read_pos(&self, reader: usize, n: u64) -> u64 {
        self.readers[reader].read_seq.fetch_add(n, Ordering::AcqRel)
    }

    /// Moves `reader`'s cursor back by `n`, returning the previous value.
    /// Same range contract as [`Ring::set_read_pos`].
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    #[inline]
    pub fn fetch_sub_read_pos(&self, reader: usize, n: u64) -> u64 {
        self.readers[reader].read_seq.fetch_sub(n, Ordering::AcqRel)
    }
}

impl<T: Copy, const N: usize, const R: usize> Default for Ring<T, N, R> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ring is Send because all fields are Send.
unsafe impl<T: Send, const N: usize, const R: usize> Send for Ring<T, N, R> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// the producer publishes with release stores of write_seq, each reader owns
// its cursor, and slots are only copied, never moved.
unsafe impl<T: Send, const N: usize, const R: usize> Sync for Ring<T, N, R> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_lines_are_cache_line_sized() {
        assert_eq!(std::mem::size_of::<ReaderCursor>(), 64);
        assert_eq!(std::mem::size_of::<ProducerState>(), 64);
    }

    #[test]
    fn every_reader_sees_every_item_in_order() {
        let ring: Ring<u64, 8, 3> = Ring::new();

        unsafe {
            for i in 0..8 {
                assert!(ring.push(i).is_ok());
            }
            for reader in 0..3 {
                for i in 0..8 {
                    assert_eq!(ring.pop(reader), Some(i), "reader {reader}");
                }
                assert_eq!(ring.pop(reader), None, "reader {reader}");
            }
        }
    }

    #[test]
    fn slowest_reader_bounds_the_producer() {
        let ring: Ring<u64, 4, 2> = Ring::new();

        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            // Reader 1 is still at sequence 0, so the ring is full.
            assert_eq!(ring.push(4), Err(4));

            // Reader 0 catching up alone does not help.
            for i in 0..4 {
                assert_eq!(ring.pop(0), Some(i));
            }
            assert_eq!(ring.push(4), Err(4));

            // Once the lagging reader releases a slot the push succeeds.
            assert_eq!(ring.pop(1), Some(0));
            assert!(ring.push(4).is_ok());
        }
    }

    #[test]
    fn overwrite_laps_only_the_lagging_reader() {
        let ring: Ring<u64, 4, 2> = Ring::new();

        unsafe {
            // Reader 0 keeps up with every push; reader 1 never pops.
            for i in 0..6 {
                ring.push_overwrite(i);
                assert_eq!(ring.pop_lossy(0), Ok(i));
            }

            // Reader 1 was lapped: sequences 0 and 1 are gone, the cursor
            // resumes at write_seq - capacity = 2.
            assert_eq!(ring.pop_lossy(1), Err(RecvError::Lagged(2)));
            assert_eq!(ring.read_pos(1), 2);
            for i in 2..6 {
                assert_eq!(ring.pop_lossy(1), Ok(i));
            }
            assert_eq!(ring.pop_lossy(1), Err(RecvError::Empty));
        }
    }

    #[test]
    fn reader_exactly_capacity_behind_still_reads() {
        let ring: Ring<u64, 4, 1> = Ring::new();

        unsafe {
            for i in 0..4 {
                ring.push_overwrite(i);
            }
            // write_seq - read_seq == capacity: no loss yet.
            assert_eq!(ring.pop_lossy(0), Ok(0));
        }
    }

    #[test]
    fn cursor_rewind_redelivers() {
        let ring: Ring<u64, 8, 1> = Ring::new();

        unsafe {
            assert!(ring.push(7).is_ok());
            assert!(ring.push(8).is_ok());

            assert_eq!(ring.pop(0), Some(7));
            ring.fetch_sub_read_pos(0, 1);
            assert_eq!(ring.pop(0), Some(7));
            assert_eq!(ring.pop(0), Some(8));
        }
    }

    #[test]
    fn cursor_accessors_round_trip() {
        let ring: Ring<u64, 8, 2> = Ring::new();

        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            assert_eq!(ring.pop(0), Some(0));
            assert_eq!(ring.read_pos(0), 1);

            ring.set_read_pos(0, 3);
            assert_eq!(ring.pop(0), Some(3));

            assert_eq!(ring.fetch_add_read_pos(1, 2), 0);
            assert_eq!(ring.pop(1), Some(2));
        }
    }
}
