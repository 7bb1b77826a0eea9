//! Bounded, lock-free ring buffer queues for message passing between
//! threads and between processes.
//!
//! Four producer/consumer shapes, each a distinct monomorphic type selected
//! at compile time, with unicast (each item consumed exactly once) and
//! broadcast (each item delivered to every registered reader) delivery:
//!
//! | variant | producers | consumers | delivery |
//! |---------|-----------|-----------|----------|
//! | [`spsc`] | 1 | 1 | point-to-point |
//! | [`mpsc`] | many | 1 | point-to-point |
//! | [`spmc`] | 1 | many | unicast (work stealing) or broadcast |
//! | [`mpmc`] | many | many | unicast or broadcast |
//!
//! The core rings are plain `#[repr(C)]` values driven entirely by 64-bit
//! atomic sequence counters (indices derive from `seq & (capacity - 1)`,
//! capacities are powers of two), so the same bytes work on the heap and
//! inside a shared memory mapping. Three access layers sit on top:
//!
//! - [`sync`] - safe in-process channels over `Arc`-shared heap rings
//! - [`ipc`] - cross-process queues placement-constructed into POSIX shared
//!   memory, with typestate cleanup and element-type verification
//! - the raw cores ([`spsc::ring`], [`mpsc::ring`], [`spmc::ring`],
//!   [`spmc::broadcast`], [`mpmc::ring`], [`mpmc::broadcast`]) for placing a
//!   queue into storage you manage yourself
//!
//! Nothing ever blocks in the queues: a full push and an empty pop return
//! immediately, and the caller decides whether to spin, yield or walk away.
//! The broadcast producer additionally offers an overwrite discipline that
//! trades bounded loss for liveness; lagging readers are resynchronized and
//! told how much they missed.
//!
//! [`pool`] is a small worked example: a thread pool whose workers drain
//! type-erased tasks from the MPMC unicast queue.

// Allow the crate to reference itself as ::sluice for derive macro usage
extern crate self as sluice;

pub mod cell;

pub mod ipc;
pub mod mpmc;
pub mod mpsc;
pub mod pool;
pub mod spmc;
pub mod spsc;
pub mod sync;
pub mod trace;

#[doc(inline)]
pub use sluice_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::SharedMemorySafe as __SharedMemorySafePrivate;

pub use trace::init_tracing;
