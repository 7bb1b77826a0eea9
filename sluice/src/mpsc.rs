//! Core MPSC (Multi-Producer Single-Consumer) queue primitives.
//!
//! Producers reserve slots with a CAS on the shared write counter and
//! publish them in sequence order through a separate commit counter.
//!
//! Used by:
//! - [`crate::ipc::mpsc`] - Cross-process queues over shared memory
//! - [`crate::sync::mpsc`] - In-process queues over heap memory

pub mod ring;
