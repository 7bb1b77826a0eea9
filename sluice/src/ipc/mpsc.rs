//! Lock-free MPSC queue over POSIX shared memory.
//!
//! Multiple producer processes, one consumer process. Producers reserve
//! slots with a CAS on the shared write counter and publish in sequence
//! order through the commit counter; see [`crate::mpsc::ring`] for the
//! protocol.
//!
//! # Example
//!
//! ```no_run
//! use sluice::ipc::mpsc::{Consumer, Producer};
//!
//! // Daemon creates its inbox (consumer end).
//! let consumer = Consumer::<u64, 1024, _>::create("/my-inbox")?;
//!
//! // Clients open the inbox; any number of producers is fine.
//! let producer1 = Producer::<u64, 1024, _>::open("/my-inbox")?;
//! let producer2 = Producer::<u64, 1024, _>::open("/my-inbox")?;
//!
//! producer1.push(1).expect("Queue full");
//! producer2.push(2).expect("Queue full");
//!
//! assert!(consumer.pop().is_some());
//! assert!(consumer.pop().is_some());
//! # Ok::<(), sluice::ipc::shmem::ShmError>(())
//! ```

use std::marker::PhantomData;
use std::ptr;

use minstant::Instant;
use type_hash::TypeHash;

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode};
use super::{Header, INIT_TIMEOUT};
use crate::SharedMemorySafe;
use crate::cell::PhantomUnsync;
use crate::mpsc::ring::Ring;
use crate::sync::Timeout;

const INIT_MAGIC: u64 = 0x4D50_5343_494E_4954; // "MPSCINIT" in ASCII

/// Shared-memory layout: header + core ring + tail padding.
#[repr(C)]
struct IpcQueue<T: SharedMemorySafe, const N: usize> {
    header: Header,
    ring: Ring<T, N>,
    _padding_tail: [u8; 64],
}

// SAFETY: IpcQueue is repr(C) and all fields are SharedMemorySafe.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for IpcQueue<T, N> {}

impl<T: SharedMemorySafe, const N: usize> IpcQueue<T, N> {
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

fn open_queue<T: SharedMemorySafe + TypeHash, const N: usize>(
    name: &str,
) -> Result<Shm<IpcQueue<T, N>, Opener>, ShmError> {
    let shm = Shm::<IpcQueue<T, N>, Opener>::open(name)?;

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

/// Write end of the MPSC queue.
///
/// Any number of producers is allowed: open one handle per producing
/// process (or clone-by-open within a process). `Send` but not `Sync`.
pub struct Producer<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe + TypeHash, const N: usize> Producer<T, N, Creator> {
    /// Creates the queue and returns a producer end.
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
    /// Opens an existing queue and returns a producer end.
    ///
    /// # Errors
    ///
    /// As for SPSC: missing object, size/type mismatch, or init timeout.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        Ok(Self {
            shm: open_queue(name)?,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> Producer<T, N, Mode> {
    /// Attempts to push an item onto the queue (lock-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: push tolerates any number of producers; the mapping was
        // initialized before the handle existed.
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

/// Read end of the MPSC queue.
///
/// Exactly one consumer may exist per queue, across all processes. `Send`
/// but not `Sync`.
pub struct Consumer<T: SharedMemorySafe + TypeHash, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe + TypeHash, const N: usize> Consumer<T, N, Creator> {
    /// Creates the queue and returns the consumer end (daemon inbox).
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
        // SAFETY: this handle is the single consumer per the type contract.
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
