//! In-process (inter-thread) queue wrappers over heap-allocated rings.
//!
//! Each submodule pairs a core ring with safe `channel()` construction and
//! role handles. No shared memory, no `SharedMemorySafe` bound: the ring
//! lives in an `Arc` and only requires `T: Send`.
//!
//! Queue operations never block; the `*_blocking` variants spin with a
//! [`Timeout`] deadline and are meant for short waits.

use std::time::Duration;

pub mod broadcast;
pub mod mpmc;
pub mod mpsc;
pub mod spmc;
pub mod spsc;

/// Timeout specification for blocking operations.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}
