//! Lock-free SPSC queue over POSIX shared memory.
//!
//! A bounded wait-free queue for cross-process communication: a ring buffer
//! with atomic sequence counters placement-constructed into a shared memory
//! segment. No mutexes or syscalls in the hot path.
//!
//! # Overview
//!
//! - [`Producer`] - write end (exactly one across all processes)
//! - [`Consumer`] - read end (exactly one across all processes)
//!
//! # Basic usage
//!
//! ```no_run
//! use sluice::ipc::spsc::{Consumer, Producer};
//!
//! // Process A: create the queue (daemon/server).
//! let producer = Producer::<u64, 1024, _>::create("/my-queue")?;
//!
//! // Process B: open it (client).
//! let consumer = Consumer::<u64, 1024, _>::open("/my-queue")?;
//!
//! producer.push(42).expect("Queue full");
//! assert_eq!(consumer.pop(), Some(42));
//! # Ok::<(), sluice::ipc::shmem::ShmError>(())
//! ```
//!
//! # Creator vs Opener
//!
//! Either end may be the creator; the typestate decides cleanup (the
//! creator unlinks the name on drop). A daemon typically creates its inbox
//! as `Consumer::create` and clients attach with `Producer::open`.
//!
//! # Mapped layout
//!
//! ```text
//! Queue in shared memory (/dev/shm):
//! ┌────────────────────────────────────────┐
//! │ Header (64-byte aligned)               │
//! │  - init marker, element type hash      │
//! ├────────────────────────────────────────┤
//! │ ProducerState (64-byte aligned)        │
//! │  - write_seq: AtomicU64                │
//! │  - cached_read: u64                    │
//! ├────────────────────────────────────────┤
//! │ ConsumerState (64-byte aligned)        │
//! │  - read_seq: AtomicU64                 │
//! │  - cached_write: u64                   │
//! ├────────────────────────────────────────┤
//! │ Padding (64 bytes)                     │
//! ├────────────────────────────────────────┤
//! │ Buffer: [Slot<T>; N]                   │
//! ├────────────────────────────────────────┤
//! │ Padding (64 bytes)                     │
//! └────────────────────────────────────────┘
//! ```

use std::marker::PhantomData;
use std::ptr;

use minstant::Instant;
use type_hash::TypeHash;

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode};
use super::{Header, INIT_TIMEOUT};
use crate::SharedMemorySafe;
use crate::cell::PhantomUnsync;
use crate::spsc::ring::Ring;
use crate::sync::Timeout;

const INIT_MAGIC: u64 = 0x5350_5343_494E_4954; // "SPSCINIT" in ASCII

/// Shared-memory layout: header + core ring + tail padding.
#[repr(C)]
struct IpcQueue<T: SharedMemorySafe, const N: usize> {
    /// Init marker and element hash, released last by the creator.
    header: Header,

    /// The core ring buffer.
    ring: Ring<T, N>,

    /// Prevents false sharing with adjacent shared memory regions.
    _padding_tail: [u8; 64],
}

// SAFETY: IpcQueue is repr(C) and all fields are SharedMemorySafe.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for IpcQueue<T, N> {}

impl<T: SharedMemorySafe, const N: usize> IpcQueue<T, N> {
    /// Initializes the queue directly inside shared memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, aligned and exclusively owned; afterwards the
    /// memory must be treated as initialized.
    unsafe fn init_shared(ptr: *mut Self, elem_hash: u64) {
        // SAFETY: field-by-field placement writes under the caller's
        // exclusivity guarantee; the magic is released last so openers that
        // observe it see a fully initialized queue.
        unsafe {
            Header::prepare(ptr::addr_of_mut!((*ptr).header), elem_hash);
            Ring::init_in_place(ptr::addr_of_mut!((*ptr).ring));
            Header::publish(ptr::addr_of_mut!((*ptr).header), INIT_MAGIC);
        }
    }
}

/// Opens and validates an existing queue mapping.
fn open_queue<T: SharedMemorySafe + TypeHash, const N: usize>(
    name: &str,
) -> Result<Shm<IpcQueue<T, N>, Opener>, ShmError> {
    let shm = Shm::<IpcQueue<T, N>, Opener>::open(name)?;

    // SAFETY: Shm::open returns a live, correctly sized mapping.
    let ready = unsafe {
        Header::wait_ready(
            ptr::addr_of!((*shm).header),
            INIT_MAGIC,
            INIT_TIMEOUT,
        )
    };
    if !ready {
        return Err(ShmError::InitTimeout {
            name: shm.name().to_string(),
        });
    }

    let actual = shm.header.elem_hash();
    let expected = T::type_hash();
    if actual != expected {
        return Err(ShmError::TypeMismatch {
            name: shm.name().to_string(),
            expected,
            actual,
        });
    }

    Ok(shm)
}

/// Write end of the SPSC queue.
///
/// Exactly one producer may exist per queue, across all processes.
/// `Producer` is [`Send`] but not [`Sync`], which enforces the contract
/// within a process; nothing stops another process from calling
/// [`Producer::open`] on the same name, so deployment must ensure a single
/// producer globally.
pub struct Producer<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe + TypeHash, const N: usize> Producer<T, N, Creator> {
    /// Creates the queue in a new shared memory segment and returns the
    /// producer end. The segment is unlinked when this handle drops.
    ///
    /// # Errors
    ///
    /// Propagates [`ShmError`] from segment creation.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcQueue<T, N>, Creator>::create(name, |ptr| {
            // SAFETY: create() hands the closure an exclusive mapping.
            unsafe { IpcQueue::<T, N>::init_shared(ptr, T::type_hash()) }
        })?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + TypeHash, const N: usize> Producer<T, N, Opener> {
    /// Opens an existing queue and returns the producer end.
    ///
    /// Waits up to one second for the creator to finish initializing.
    ///
    /// # Errors
    ///
    /// [`ShmError::System`] if the object does not exist (yet),
    /// [`ShmError::SizeMismatch`] / [`ShmError::TypeMismatch`] for
    /// incompatible capacity or element type, [`ShmError::InitTimeout`] if
    /// the creator stalls.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Ok(Self {
            shm: open_queue(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> Producer<T, N, Mode> {
    /// Attempts to push an item onto the queue (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the single producer per the type contract;
        // the mapping was initialized before the handle existed.
        unsafe { self.shm.ring.push(item) }
    }

    /// Spins until space is available, then pushes.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    #[inline]
    pub fn push_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        return Err(item);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }
}

/// Read end of the SPSC queue.
///
/// Exactly one consumer may exist per queue, across all processes. Same
/// thread-safety shape as [`Producer`].
pub struct Consumer<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> std::fmt::Debug
    for Consumer<T, N, Mode>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").field("shm", &self.shm).finish()
    }
}

impl<T: SharedMemorySafe + TypeHash, const N: usize> Consumer<T, N, Creator> {
    /// Creates the queue and returns the consumer end (the daemon-inbox
    /// pattern: the reader owns the segment, writers attach).
    ///
    /// # Errors
    ///
    /// Propagates [`ShmError`] from segment creation.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcQueue<T, N>, Creator>::create(name, |ptr| {
            // SAFETY: create() hands the closure an exclusive mapping.
            unsafe { IpcQueue::<T, N>::init_shared(ptr, T::type_hash()) }
        })?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + TypeHash, const N: usize> Consumer<T, N, Opener> {
    /// Opens an existing queue and returns the consumer end.
    ///
    /// # Errors
    ///
    /// As for [`Producer::open`].
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Ok(Self {
            shm: open_queue(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> Consumer<T, N, Mode> {
    /// Attempts to pop an item from the queue (wait-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle is the single consumer per the type contract;
        // the mapping was initialized before the handle existed.
        unsafe { self.shm.ring.pop() }
    }

    /// Spins until an item is available, then pops.
    ///
    /// Returns `None` on timeout.
    #[inline]
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::io;

    macro_rules! unwrap_or_skip {
        ($expr:expr) => {
            match $expr {
                Ok(value) => value,
                Err(ShmError::System { source, .. }) if source == io::Errno::ACCESS => {
                    eprintln!("Skipping test due to shared memory permission denial");
                    return;
                }
                Err(err) => panic!("Unexpected shared memory error: {err}"),
            }
        };
    }

    #[test]
    fn mapped_struct_puts_ring_behind_the_header() {
        use std::mem::offset_of;

        type TestQueue = IpcQueue<u64, 16>;
        assert_eq!(std::mem::size_of::<Header>(), 64);
        assert_eq!(offset_of!(TestQueue, ring), 64);
    }

    #[test]
    fn basic_push_pop() {
        let producer = unwrap_or_skip!(Producer::<u64, 8, _>::create("/sluice-spsc-basic"));
        let consumer = unwrap_or_skip!(Consumer::<u64, 8, _>::open("/sluice-spsc-basic"));

        assert!(producer.push(42).is_ok());
        assert_eq!(consumer.pop(), Some(42));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn queue_full_pop_releases_space() {
        let producer = unwrap_or_skip!(Producer::<u64, 4, _>::create("/sluice-spsc-full"));
        let consumer = unwrap_or_skip!(Consumer::<u64, 4, _>::open("/sluice-spsc-full"));

        for i in 0..4 {
            assert!(producer.push(i).is_ok(), "Failed to push item {i}");
        }
        assert_eq!(producer.push(999), Err(999));

        assert_eq!(consumer.pop(), Some(0));
        assert!(producer.push(4).is_ok());
        assert_eq!(producer.push(1000), Err(1000));

        for i in 1..=4 {
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn wrapping_across_rounds() {
        let producer = unwrap_or_skip!(Producer::<u64, 4, _>::create("/sluice-spsc-wrap"));
        let consumer = unwrap_or_skip!(Consumer::<u64, 4, _>::open("/sluice-spsc-wrap"));

        for round in 0..5 {
            for i in 0..4 {
                assert!(producer.push(round * 10 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(consumer.pop(), Some(round * 10 + i));
            }
            assert_eq!(consumer.pop(), None);
        }
    }

    #[test]
    fn consumer_creates_producer_opens() {
        let consumer = unwrap_or_skip!(Consumer::<u64, 8, _>::create("/sluice-spsc-inbox"));
        let producer = unwrap_or_skip!(Producer::<u64, 8, _>::open("/sluice-spsc-inbox"));

        producer.push(100).unwrap();
        producer.push(200).unwrap();

        assert_eq!(consumer.pop(), Some(100));
        assert_eq!(consumer.pop(), Some(200));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn element_type_is_checked_on_open() {
        // Same size, different structural hash.
        let _producer = unwrap_or_skip!(Producer::<u64, 8, _>::create("/sluice-spsc-type"));

        match Consumer::<i64, 8, Opener>::open("/sluice-spsc-type") {
            Err(ShmError::TypeMismatch { .. }) => {}
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
    }
}
