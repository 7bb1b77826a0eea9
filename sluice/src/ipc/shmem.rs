//! POSIX shared memory handle with type safety and automatic cleanup.
//!
//! [`Shm<T, Mode>`] names, creates, maps, unmaps and unlinks a POSIX shared
//! memory object holding a single value of `T`. The queue rings are laid out
//! as plain `#[repr(C)]` values precisely so they can be placement-
//! constructed into such a mapping and addressed from several processes.
//!
//! # Typestate cleanup
//!
//! The `Mode` parameter decides what `Drop` does:
//!
//! - [`Creator`]: `munmap` then `shm_unlink` (removes the name)
//! - [`Opener`]: `munmap` only (the name persists for the creator)
//!
//! Unlinking while other processes still hold mappings is fine; the kernel
//! defers reclamation until the last `munmap`.
//!
//! # Names
//!
//! A leading `/` is prepended when absent. After normalization the name must
//! contain no further `/` and fit in 255 bytes. On Linux the object appears
//! under `/dev/shm`.
//!
//! # Element requirements
//!
//! `T` must implement [`SharedMemorySafe`]: stable `#[repr(C)]` layout, no
//! pointer-carrying fields (virtual addresses do not transfer between
//! processes), safe without `Drop` ever running (a SIGKILL bypasses
//! destructors), and `Send + Sync`. Use `#[derive(SharedMemorySafe)]` for
//! compile-time validation of custom types.
//!
//! # Basic usage
//!
//! ```no_run
//! use sluice::SharedMemorySafe;
//! use sluice::ipc::shmem::{Creator, Opener, Shm};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(SharedMemorySafe)]
//! #[repr(C)]
//! struct Counter {
//!     value: AtomicU64,
//! }
//!
//! // Process A: create and initialize in place.
//! let counter = Shm::<Counter, Creator>::create("/my-counter", |ptr| unsafe {
//!     ptr.write(Counter { value: AtomicU64::new(0) });
//! })?;
//! counter.value.store(42, Ordering::Release);
//!
//! // Process B: open and read.
//! let counter = Shm::<Counter, Opener>::open("/my-counter")?;
//! assert_eq!(counter.value.load(Ordering::Acquire), 42);
//! # Ok::<(), sluice::ipc::shmem::ShmError>(())
//! ```

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

use crate::trace;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors produced by the shared memory layer.
///
/// OS-level failures collapse into the single [`ShmError::System`] kind
/// carrying the operation that failed and the errno; callers recover by
/// retrying (a subscriber waiting for its publisher to create the object)
/// or by surfacing the error.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The shared memory name is malformed.
    #[error("invalid shared memory name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// `shm_open`, `ftruncate`, `fstat` or `mmap` failed with an errno.
    #[error("{op} failed for `{name}`: {source}")]
    System {
        op: &'static str,
        name: String,
        source: io::Errno,
    },

    /// The existing object's size does not match `size_of::<T>()`.
    #[error("shared memory `{name}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: i64,
    },

    /// The object holds a queue of a different element type.
    #[error(
        "shared memory `{name}` element type mismatch: \
         expected hash {expected:#018x}, found {actual:#018x}"
    )]
    TypeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// The creator did not finish initializing the object in time.
    #[error("timed out waiting for `{name}` to be initialized")]
    InitTimeout { name: String },
}

impl ShmError {
    pub(crate) fn system(op: &'static str, name: &str, err: io::Errno) -> Self {
        Self::System {
            op,
            name: name.to_string(),
            source: err,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// Normalizes and validates a shared memory object name.
///
/// A missing leading `/` is prepended; interior slashes and over-long names
/// are rejected (portable `shm_open` requirements).
pub(crate) fn normalize_shm_name(name: &str) -> Result<String> {
    let normalized = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if normalized[1..].contains('/') {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
            reason: "name must not contain interior '/' characters",
        });
    }

    if normalized.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
            reason: "name must be at most 255 bytes",
        });
    }

    Ok(normalized)
}

/// Trait defining cleanup behavior for shared memory modes.
///
/// Internal to the typestate pattern; use the [`Creator`] or [`Opener`]
/// markers rather than implementing this.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates (and owns) the object.
///
/// Dropping a `Shm<T, Creator>` unmaps the memory and unlinks the name.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that open an existing object.
///
/// Dropping a `Shm<T, Opener>` only unmaps; the creator owns the name.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory and access from multiple
/// processes.
///
/// # Safety
///
/// Implementers must guarantee all of:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]`, so separately
///   compiled processes agree on field offsets
/// - **No pointers**: no heap allocations, references or raw pointers;
///   virtual addresses are process-specific
/// - **Fields**: every field is itself `SharedMemorySafe`
/// - **Drop**: remains sound if `Drop` never runs (crashes bypass it)
/// - **Concurrency**: shared mutable state goes through atomics
///
/// Prefer `#[derive(SharedMemorySafe)]`, which checks the layout and
/// pointer-freedom requirements at compile time.
pub unsafe trait SharedMemorySafe: Send + Sync {}

macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    // Signed integers
    i8, i16, i32, i64, i128, isize,
    // Unsigned integers
    u8, u16, u32, u64, u128, usize,
    // Floats
    f32, f64,
    // Bool
    bool,
    // Atomics
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are SharedMemorySafe if their elements are.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Smart pointer to a POSIX shared memory object holding one `T`.
///
/// Move-only: construction acquires the mapping, drop releases it (and the
/// name, in [`Creator`] mode). Access goes through [`Deref`]; all shared
/// mutation inside `T` must use atomics.
impl<T: SharedMemorySafe, Mode: ShmMode> std::fmt::Debug for Shm<T, Mode> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shm")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("name", &self.name)
            .finish()
    }
}

pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    name: String,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointer targets shared memory, not thread-local data, and
// T: SharedMemorySafe already requires Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates (or re-opens) the named object, sizes it to `T`, maps it
    /// read-write shared, and runs `init` on the raw mapping.
    ///
    /// Create-or-open semantics: an object left behind by a previous run is
    /// reused and re-initialized rather than failing with `EEXIST`. The
    /// mapping is truncated to `size_of::<T>()` first.
    ///
    /// `init` must leave `*ptr` fully initialized; it runs exactly once,
    /// before any other process can observe a consistent object (queue
    /// wrappers publish an init marker last for that purpose).
    ///
    /// # Errors
    ///
    /// [`ShmError::InvalidName`] for malformed names, [`ShmError::System`]
    /// when `shm_open`, `ftruncate` or `mmap` fail.
    pub fn create(name: &str, init: impl FnOnce(*mut T)) -> Result<Self> {
        let name = normalize_shm_name(name)?;

        let fd = shm::open(
            &name,
            shm::OFlags::CREATE | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::system("shm_open", &name, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(&name);
            return Err(ShmError::system("ftruncate", &name, err));
        }

        // SAFETY: fresh independent mapping of a correctly sized object;
        // mmap returns page-aligned addresses, satisfying any T's alignment,
        // and aliases no existing Rust object in this process.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(&name);
                return Err(ShmError::system("mmap", &name, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut T) };

        init(ptr.as_ptr());

        trace::debug!(name = %name, bytes = size_of::<T>(), "created shared memory segment");

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            name,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens an existing object created by another process and maps it.
    ///
    /// The object's size must equal `size_of::<T>()` exactly.
    ///
    /// # Errors
    ///
    /// [`ShmError::System`] with `shm_open`/`ENOENT` while the creator has
    /// not created the object yet (callers typically busy-retry on that),
    /// [`ShmError::SizeMismatch`] when the object was created with a
    /// different `T` or capacity.
    pub fn open(name: &str) -> Result<Self> {
        let name = normalize_shm_name(name)?;

        let fd = shm::open(&name, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::system("shm_open", &name, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::system("fstat", &name, err));
            }
        };
        if stat.st_size != size_of::<T>() as i64 {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                name,
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: existing object of verified size; fresh mapping aliasing
        // no local Rust object; page alignment satisfies T.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ShmError::system("mmap", &name, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr as *mut T) };

        trace::debug!(name = %name, bytes = size_of::<T>(), "opened shared memory segment");

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            name,
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Shm<T, Mode> {
    /// The normalized object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: the mapping was established in create/open with this
        // pointer and size and has not been unmapped since.
        unsafe {
            let _ = munmap(self.ptr.as_ptr() as *mut _, self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(&self.name);
        }

        trace::trace!(name = %self.name, unlink = Mode::SHOULD_UNLINK, "released shared memory segment");
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping stays valid for the lifetime of self, and
        // T: SharedMemorySafe covers concurrent cross-process access.
        unsafe { self.ptr.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[derive(crate::SharedMemorySafe)]
    #[repr(C)]
    struct Counter {
        value: AtomicU64,
    }

    fn init_counter(ptr: *mut Counter) {
        // SAFETY: create() hands us an exclusive, well-aligned mapping.
        unsafe {
            ptr.write(Counter {
                value: AtomicU64::new(0),
            });
        }
    }

    #[test]
    fn name_normalization_prepends_slash() {
        assert_eq!(normalize_shm_name("plain").unwrap(), "/plain");
        assert_eq!(normalize_shm_name("/already").unwrap(), "/already");
    }

    #[test]
    fn name_with_interior_slash_is_rejected() {
        assert!(matches!(
            normalize_shm_name("/foo/bar"),
            Err(ShmError::InvalidName { reason, .. })
                if reason == "name must not contain interior '/' characters"
        ));
    }

    #[test]
    fn name_length_is_bounded() {
        let long = format!("/{}", "a".repeat(255));
        assert!(matches!(
            normalize_shm_name(&long),
            Err(ShmError::InvalidName { .. })
        ));

        let max = format!("/{}", "a".repeat(254));
        assert!(normalize_shm_name(&max).is_ok());
    }

    #[test]
    fn create_write_read_drop() {
        let shm = unwrap_or_skip!(Shm::<Counter, Creator>::create(
            "/sluice-test-counter",
            init_counter
        ));

        shm.value.store(42, Ordering::SeqCst);
        assert_eq!(shm.value.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn opener_sees_creator_writes_and_vice_versa() {
        let shm = unwrap_or_skip!(Shm::<Counter, Creator>::create(
            "/sluice-test-shared",
            init_counter
        ));
        shm.value.store(100, Ordering::SeqCst);

        {
            let opened = Shm::<Counter, Opener>::open("/sluice-test-shared").unwrap();
            assert_eq!(opened.value.load(Ordering::SeqCst), 100);
            opened.value.store(200, Ordering::SeqCst);
        } // Opener drop: unmap only.

        assert_eq!(shm.value.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn open_rejects_wrong_size() {
        #[derive(crate::SharedMemorySafe)]
        #[repr(C)]
        struct Larger {
            a: AtomicU64,
            b: AtomicU64,
            c: AtomicU64,
        }

        let _shm = unwrap_or_skip!(Shm::<Counter, Creator>::create(
            "/sluice-test-size-mismatch",
            init_counter
        ));

        match Shm::<Larger, Opener>::open("/sluice-test-size-mismatch") {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, size_of::<Larger>());
                assert_eq!(actual, size_of::<Counter>() as i64);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn open_missing_object_reports_shm_open() {
        match Shm::<Counter, Opener>::open("/sluice-test-never-created") {
            Err(ShmError::System { op, .. }) => assert_eq!(op, "shm_open"),
            other => panic!("expected System error, got {other:?}"),
        }
    }
}
