//! Core MPMC (Multi-Producer Multi-Consumer) queue primitives.
//!
//! Combines the MPSC producer path (CAS reservation + in-order commit) with
//! the SPMC consumer paths:
//!
//! - [`ring`] - unicast: point-to-point, consumers race on one read counter
//! - [`broadcast`] - fan-out to every registered reader
//!
//! Used by:
//! - [`crate::sync::mpmc`] - In-process queues over heap memory
//! - [`crate::pool`] - Worker threads draining type-erased tasks

pub mod broadcast;
pub mod ring;
