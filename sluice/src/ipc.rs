//! Cross-process queues over POSIX shared memory.
//!
//! Each queue wrapper maps a `#[repr(C)]` struct of header + core ring into
//! a [`shmem::Shm`] segment. The header carries an init marker (released
//! last by the creator, spun on by openers) and the structural hash of the
//! element type, so two processes compiled against different element
//! definitions fail fast instead of exchanging garbage.
//!
//! The mapped layout is stable for the lifetime of every process using the
//! same name; recompiling any participant with a different capacity, reader
//! count or element representation invalidates the mapping (the size and
//! type-hash checks catch the common cases).

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub mod broadcast;
pub mod mpsc;
pub mod shmem;
pub mod spsc;

use self::shmem::SharedMemorySafe;

/// How long openers spin waiting for the creator's init marker.
pub(crate) const INIT_TIMEOUT: Duration = Duration::from_secs(1);

// SAFETY: a RingCell is repr(transparent) over UnsafeCell<T>; access safety
// comes from the queue protocols, not the type system.
unsafe impl<T: SharedMemorySafe, Role> SharedMemorySafe for crate::cell::RingCell<T, Role> {}

// SAFETY: a slot is a bare T with possibly uninitialized bytes; integers and
// atomics have no invalid representations the protocols could expose.
unsafe impl<T: SharedMemorySafe> SharedMemorySafe for crate::cell::Slot<T> {}

// SAFETY: the core ring types below are repr(C), hold only atomics,
// role-owned plain integers and slots, and synchronize entirely through
// their counters.
unsafe impl SharedMemorySafe for crate::spsc::ring::ProducerState {}
unsafe impl SharedMemorySafe for crate::spsc::ring::ConsumerState {}
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for crate::spsc::ring::Ring<T, N> {}

unsafe impl SharedMemorySafe for crate::mpsc::ring::ProducerState {}
unsafe impl SharedMemorySafe for crate::mpsc::ring::CommitState {}
unsafe impl SharedMemorySafe for crate::mpsc::ring::ConsumerState {}
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for crate::mpsc::ring::Ring<T, N> {}

unsafe impl SharedMemorySafe for crate::spmc::ring::ProducerState {}
unsafe impl SharedMemorySafe for crate::spmc::ring::ConsumerState {}
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for crate::spmc::ring::Ring<T, N> {}

unsafe impl SharedMemorySafe for crate::spmc::broadcast::ProducerState {}
unsafe impl SharedMemorySafe for crate::spmc::broadcast::ReaderCursor {}
unsafe impl<T: SharedMemorySafe, const N: usize, const R: usize> SharedMemorySafe
    for crate::spmc::broadcast::Ring<T, N, R>
{
}

unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for crate::mpmc::ring::Ring<T, N> {}
unsafe impl<T: SharedMemorySafe, const N: usize, const R: usize> SharedMemorySafe
    for crate::mpmc::broadcast::Ring<T, N, R>
{
}

/// Leading cache line of every mapped queue: init marker + element hash.
#[repr(C)]
#[repr(align(64))]
pub(crate) struct Header {
    /// Init marker; holds the wrapper's magic once the creator is done.
    init: AtomicU64,

    /// `type_hash` of the element type the creator compiled against.
    elem_hash: AtomicU64,
}

// SAFETY: two atomics, repr(C).
unsafe impl SharedMemorySafe for Header {}

impl Header {
    /// Writes the hash and clears the marker. Called first by the creator's
    /// init, before the ring state.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, aligned and exclusively owned.
    pub(crate) unsafe fn prepare(ptr: *mut Self, elem_hash: u64) {
        // SAFETY: per contract.
        unsafe {
            ptr::addr_of_mut!((*ptr).init).write(AtomicU64::new(0));
            ptr::addr_of_mut!((*ptr).elem_hash).write(AtomicU64::new(elem_hash));
        }
    }

    /// Release-stores the magic, publishing the whole mapped struct. Called
    /// last by the creator's init.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid and aligned; `prepare` must have run.
    pub(crate) unsafe fn publish(ptr: *mut Self, magic: u64) {
        // SAFETY: per contract; the release store pairs with wait_ready's
        // acquire loads in the openers.
        unsafe {
            (*ptr).init.store(magic, Ordering::Release);
        }
    }

    /// Spins until the marker holds `magic` or the timeout expires.
    ///
    /// The acquire load synchronizes with [`Header::publish`], so a `true`
    /// return guarantees the full initialization is visible.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a live mapping for the duration of the call.
    pub(crate) unsafe fn wait_ready(ptr: *const Self, magic: u64, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            // SAFETY: reading an AtomicU64 is sound regardless of logical
            // initialization state.
            if unsafe { (*ptr).init.load(Ordering::Acquire) } == magic {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::hint::spin_loop();
        }
    }

    /// The element hash the creator recorded.
    pub(crate) fn elem_hash(&self) -> u64 {
        self.elem_hash.load(Ordering::Relaxed)
    }
}
