//! SPMC broadcast queue over POSIX shared memory.
//!
//! One publisher process fans items out to up to `R` subscriber processes,
//! each identified by an explicit reader index and progressing at its own
//! pace. The ring lives in a shared segment; see
//! [`crate::spmc::broadcast`] for the protocol, the overwrite discipline and
//! the cursor recovery primitives.
//!
//! Every reader cursor counts toward the publisher's fullness bound, so in
//! refuse mode all `R` indices must belong to live subscribers.
//!
//! # Example
//!
//! ```no_run
//! use sluice::ipc::broadcast::{Publisher, Subscriber};
//!
//! // Publishing process.
//! let publisher = Publisher::<u64, 128, 16, _>::create("/ticks")?;
//! publisher.send(42).expect("ring full");
//!
//! // Subscribing process, reader index 0.
//! let subscriber = Subscriber::<u64, 128, 16, _>::open("/ticks", 0)?;
//! assert_eq!(subscriber.try_recv(), Some(42));
//! # Ok::<(), sluice::ipc::shmem::ShmError>(())
//! ```
//!
//! A subscriber started before its publisher busy-retries `open` until the
//! segment appears:
//!
//! ```no_run
//! use sluice::ipc::broadcast::Subscriber;
//! use sluice::ipc::shmem::{Opener, ShmError};
//!
//! let subscriber = loop {
//!     match Subscriber::<u64, 128, 16, Opener>::open("/ticks", 0) {
//!         Ok(sub) => break sub,
//!         Err(ShmError::System { .. }) => std::thread::yield_now(),
//!         Err(err) => return Err(err),
//!     }
//! };
//! # Ok::<(), ShmError>(())
//! ```

use std::marker::PhantomData;
use std::ptr;

use minstant::Instant;
use type_hash::TypeHash;

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode};
use super::{Header, INIT_TIMEOUT};
use crate::SharedMemorySafe;
use crate::cell::PhantomUnsync;
use crate::spmc::broadcast::Ring;
use crate::sync::Timeout;

pub use crate::spmc::broadcast::RecvError;

const INIT_MAGIC: u64 = 0x4243_5354_494E_4954; // "BCSTINIT" in ASCII

/// Shared-memory layout: header + core ring + tail padding.
#[repr(C)]
struct IpcQueue<T: SharedMemorySafe, const N: usize, const R: usize> {
    header: Header,
    ring: Ring<T, N, R>,
    _padding_tail: [u8; 64],
}

// SAFETY: IpcQueue is repr(C) and all fields are SharedMemorySafe.
unsafe impl<T: SharedMemorySafe, const N: usize, const R: usize> SharedMemorySafe
    for IpcQueue<T, N, R>
{
}

impl<T: Copy + SharedMemorySafe, const N: usize, const R: usize> IpcQueue<T, N, R> {
    /// # Safety
    ///
    /// `ptr` must be valid, aligned and exclusively owned.
    unsafe fn init_shared(ptr: *mut Self, elem_hash: u64) {
        // SAFETY: placement writes under the caller's exclusivity guarantee;
        // the magic is released last.
        unsafe {
            Header::prepare(ptr::addr_of_mut!((*ptr).header), elem_hash);
            Ring::init_in_place(ptr::addr_of_mut!((*ptr).ring));
            Header::publish(ptr::addr_of_mut!((*ptr).header), INIT_MAGIC);
        }
    }
}

fn open_queue<T: Copy + SharedMemorySafe + TypeHash, const N: usize, const R: usize>(
    name: &str,
) -> Result<Shm<IpcQueue<T, N, R>, Opener>, ShmError> {
    let shm = Shm::<IpcQueue<T, N, R>, Opener>::open(name)?;

    // SAFETY: Shm::open returns a live, correctly sized mapping.
    let ready = unsafe {
        Header::wait_ready(ptr::addr_of!((*shm).header), INIT_MAGIC, INIT_TIMEOUT)
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

/// Publishing end of the broadcast queue.
///
/// Exactly one publisher may exist per queue, across all processes. `Send`
/// but not `Sync`.
pub struct Publisher<T, const N: usize, const R: usize, Mode: ShmMode>
where
    T: Copy + SharedMemorySafe + TypeHash,
{
    shm: Shm<IpcQueue<T, N, R>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: Copy + SharedMemorySafe + TypeHash, const N: usize, const R: usize>
    Publisher<T, N, R, Creator>
{
    /// Creates the queue and returns the publishing end.
    ///
    /// # Errors
    ///
    /// Propagates [`ShmError`] from segment creation.
    pub fn create(name: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcQueue<T, N, R>, Creator>::create(name, |ptr| {
            // SAFETY: create() hands the closure an exclusive mapping.
            unsafe { IpcQueue::<T, N, R>::init_shared(ptr, T::type_hash()) }
        })?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: Copy + SharedMemorySafe + TypeHash, const N: usize, const R: usize>
    Publisher<T, N, R, Opener>
{
    /// Opens an existing queue and returns the publishing end.
    ///
    /// # Errors
    ///
    /// Missing object, size/type mismatch, or init timeout.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Ok(Self {
            shm: open_queue(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T, const N: usize, const R: usize, Mode: ShmMode> Publisher<T, N, R, Mode>
where
    T: Copy + SharedMemorySafe + TypeHash,
{
    /// Attempts to broadcast an item, refusing when the slowest subscriber
    /// is a full ring behind.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    #[inline]
    pub fn send(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the single publisher per the type contract.
        unsafe { self.shm.ring.push(item) }
    }

    /// Broadcasts unconditionally, lapping subscribers that are a full ring
    /// behind. Pair with [`Subscriber::try_recv_lossy`].
    #[inline]
    pub fn send_overwrite(&self, item: T) {
        // SAFETY: as in send.
        unsafe { self.shm.ring.push_overwrite(item) }
    }

    /// Spins until every subscriber has room, then broadcasts.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    #[inline]
    pub fn send_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.send(item) {
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

/// One subscriber's end of the broadcast queue, bound to reader index
/// `reader`.
///
/// Each index must be used by at most one subscriber at a time, across all
/// processes. `Send` but not `Sync`.
pub struct Subscriber<T, const N: usize, const R: usize, Mode: ShmMode>
where
    T: Copy + SharedMemorySafe + TypeHash,
{
    shm: Shm<IpcQueue<T, N, R>, Mode>,
    reader: usize,
    _unsync: PhantomUnsync,
}

impl<T: Copy + SharedMemorySafe + TypeHash, const N: usize, const R: usize>
    Subscriber<T, N, R, Creator>
{
    /// Creates the queue and returns a subscribing end for `reader`
    /// (the subscriber-owns-the-segment pattern).
    ///
    /// # Errors
    ///
    /// Propagates [`ShmError`] from segment creation.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    pub fn create(name: &str, reader: usize) -> Result<Self, ShmError> {
        assert!(reader < R, "reader index {reader} out of range (max {R})");
        let shm = Shm::<IpcQueue<T, N, R>, Creator>::create(name, |ptr| {
            // SAFETY: create() hands the closure an exclusive mapping.
            unsafe { IpcQueue::<T, N, R>::init_shared(ptr, T::type_hash()) }
        })?;
        Ok(Self {
            shm,
            reader,
            _unsync: PhantomData,
        })
    }
}

impl<T: Copy + SharedMemorySafe + TypeHash, const N: usize, const R: usize>
    Subscriber<T, N, R, Opener>
{
    /// Opens an existing queue and returns a subscribing end for `reader`.
    ///
    /// # Errors
    ///
    /// Missing object, size/type mismatch, or init timeout.
    ///
    /// # Panics
    ///
    /// Panics if `reader >= R`.
    pub fn open(name: &str, reader: usize) -> Result<Self, ShmError> {
        assert!(reader < R, "reader index {reader} out of range (max {R})");
        Ok(Self {
            shm: open_queue(name)?,
            reader,
            _unsync: PhantomData,
        })
    }
}

impl<T, const N: usize, const R: usize, Mode: ShmMode> Subscriber<T, N, R, Mode>
where
    T: Copy + SharedMemorySafe + TypeHash,
{
    /// The reader index this subscriber owns.
    #[must_use]
    pub fn reader(&self) -> usize {
        self.reader
    }

    /// Attempts to receive the next item (wait-free). Use against a
    /// refuse-mode publisher.
    #[inline]
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        // SAFETY: this handle owns its reader index exclusively.
        unsafe { self.shm.ring.pop(self.reader) }
    }

    /// Attempts to receive the next item, tolerating publisher overwrites.
    ///
    /// # Errors
    ///
    /// [`RecvError::Empty`] when caught up; [`RecvError::Lagged`] once per
    /// lap, after which the cursor resumes at the oldest retained item.
    #[inline]
    pub fn try_recv_lossy(&self) -> Result<T, RecvError> {
        // SAFETY: as in try_recv.
        unsafe { self.shm.ring.pop_lossy(self.reader) }
    }

    /// Spins until an item is available, then receives it.
    ///
    /// Returns `None` on timeout.
    #[inline]
    #[must_use]
    pub fn recv_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(item) = self.try_recv() {
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

    /// This subscriber's cursor position.
    #[must_use]
    pub fn read_pos(&self) -> u64 {
        self.shm.ring.read_pos(self.reader)
    }

    /// Overwrites this subscriber's cursor. Flow control for redelivery
    /// (a failed downstream send); keep the position within
    /// `[write_seq - N, write_seq]`.
    pub fn set_read_pos(&self, pos: u64) {
        self.shm.ring.set_read_pos(self.reader, pos);
    }

    /// Advances this subscriber's cursor by `n`, returning the previous
    /// position.
    pub fn fetch_add_read_pos(&self, n: u64) -> u64 {
        self.shm.ring.fetch_add_read_pos(self.reader, n)
    }

    /// Moves this subscriber's cursor back by `n`, returning the previous
    /// position. Same range contract as [`Subscriber::set_read_pos`].
    pub fn fetch_sub_read_pos(&self, n: u64) -> u64 {
        self.shm.ring.fetch_sub_read_pos(self.reader, n)
    }
}
