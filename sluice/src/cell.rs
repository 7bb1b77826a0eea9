//! Interior-mutability cells shared by the ring buffer cores.
//!
//! Every queue variant stores its payload in `UnsafeCell`s whose access is
//! mediated by the sequence counters, not by the type system. The `Role`
//! marker makes the different logical kinds of cells distinct types at
//! compile time without affecting layout.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;

/// Marker type to opt-out of `Sync` while remaining `Send`.
pub(crate) type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Role marker: fields owned exclusively by the producer side.
pub struct ProducerRole;

/// Role marker: fields owned exclusively by the consumer side.
pub struct ConsumerRole;

/// Role marker: buffer slots whose ownership transfers via the queue protocol.
pub struct SlotRole;

/// Interior-mutable cell with a role marker for nominal type safety.
///
/// `RingCell<T, Role>` wraps an `UnsafeCell<T>` with a phantom `Role`
/// parameter. The role has no runtime effect; it only keeps producer-owned
/// caches, consumer-owned caches, and shared slots from being mixed up.
#[repr(transparent)]
pub struct RingCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> RingCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> &UnsafeCell<T> {
        &self.0
    }
}

// SAFETY: RingCell is Sync because each queue protocol guarantees that a cell
// is accessed by at most one side at a time: role-owned caches are touched
// only by their owner, and slot cells only between a successful reservation
// and the matching publication. The atomic sequence counters with
// Release/Acquire ordering provide the synchronization barrier.
unsafe impl<T: Send, Role> Sync for RingCell<T, Role> {}
unsafe impl<T: Send, Role> Send for RingCell<T, Role> {}

/// Cache cell owned exclusively by the producer.
pub type ProducerCache<T> = RingCell<T, ProducerRole>;

/// Cache cell owned exclusively by the consumer.
pub type ConsumerCache<T> = RingCell<T, ConsumerRole>;

/// Cell for ring buffer slots.
pub type SlotCell<T> = RingCell<T, SlotRole>;

/// A single slot in a ring buffer.
///
/// Slots start uninitialized; a slot holds a live `T` exactly between the
/// producer's write and the point where the owning protocol allows reuse.
#[repr(C)]
pub struct Slot<T> {
    pub value: SlotCell<MaybeUninit<T>>,
}
