//! Core SPMC (Single-Producer Multi-Consumer) queue primitives.
//!
//! Two delivery disciplines with distinct, monomorphic layouts:
//!
//! - [`ring`] - unicast: consumers race on one shared read counter, each
//!   item is claimed by exactly one of them (work stealing)
//! - [`broadcast`] - every registered reader observes every item exactly
//!   once through its own cursor
//!
//! Used by:
//! - [`crate::ipc::broadcast`] - Cross-process fan-out over shared memory
//! - [`crate::sync::spmc`] / [`crate::sync::broadcast`] - In-process queues

pub mod broadcast;
pub mod ring;
