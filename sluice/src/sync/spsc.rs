//! Lock-free SPSC queue for in-process (inter-thread) communication.
//!
//! A wait-free bounded queue over a heap-allocated ring buffer.
//!
//! # Example
//!
//! ```
//! use sluice::sync::spsc;
//!
//! let (producer, consumer) = spsc::channel::<u64, 1024>();
//!
//! // Producer thread
//! producer.push(42).expect("Queue full");
//!
//! // Consumer thread
//! assert_eq!(consumer.pop(), Some(42));
//! ```
//!
//! # Differences from [`crate::ipc::spsc`]
//!
//! - No shared memory: uses heap allocation via `Arc`
//! - No `SharedMemorySafe` bound: only requires `T: Send`
//! - Simpler construction: `channel()` returns a `(Producer, Consumer)` pair

use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::cell::PhantomUnsync;
use crate::spsc::ring::Ring;
use crate::sync::Timeout;

/// Write end of the SPSC queue.
///
/// Only one producer may exist per queue. `Producer` is [`Send`] but not
/// [`Sync`]: ownership can move to another thread, but `&Producer` cannot be
/// shared, which enforces the single-producer contract at compile time.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Read end of the SPSC queue.
///
/// Only one consumer may exist per queue; same thread-safety shape as
/// [`Producer`].
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Creates a new SPSC channel with capacity `N` (a power of two >= 2,
/// enforced at compile time).
///
/// # Example
///
/// ```
/// use sluice::sync::spsc;
///
/// let (tx, rx) = spsc::channel::<String, 16>();
///
/// tx.push("hello".to_string()).unwrap();
/// assert_eq!(rx.pop(), Some("hello".to_string()));
/// ```
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let ring = Arc::new(Ring::new());

    let producer = Producer {
        ring: Arc::clone(&ring),
        _unsync: PhantomData,
    };

    let consumer = Consumer {
        ring,
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Attempts to push an item onto the queue (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the unique producer (not Clone, not Sync)
        // and the ring was initialized in channel().
        unsafe { self.ring.push(item) }
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

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Attempts to pop an item from the queue (wait-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle is the unique consumer and the ring was
        // initialized in channel().
        unsafe { self.ring.pop() }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_push_pop() {
        let (producer, consumer) = channel::<u64, 8>();

        assert!(producer.push(42).is_ok());
        assert_eq!(consumer.pop(), Some(42));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn queue_full_then_released() {
        let (producer, consumer) = channel::<u64, 4>();

        for i in 0..4 {
            assert!(producer.push(i).is_ok(), "Failed to push item {i}");
        }

        assert_eq!(producer.push(999), Err(999));

        assert_eq!(consumer.pop(), Some(0));
        assert!(producer.push(4).is_ok());
        assert_eq!(producer.push(1000), Err(1000));
    }

    #[test]
    fn wrapping_behavior() {
        let (producer, consumer) = channel::<u64, 4>();

        for round in 0..5 {
            for i in 0..4 {
                assert!(producer.push(round * 10 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(consumer.pop(), Some(round * 10 + i));
            }
            assert_eq!(consumer.pop(), None);
        }
    }

    #[test]
    fn push_blocking_times_out_when_full() {
        let (producer, _consumer) = channel::<u64, 2>();

        producer.push(1).unwrap();
        producer.push(2).unwrap();

        let timeout = Timeout::from(std::time::Duration::from_millis(10));
        assert_eq!(producer.push_blocking(3, timeout), Err(3));
    }

    #[test]
    fn concurrent_push_pop_preserves_fifo() {
        let (producer, consumer) = channel::<u64, 64>();
        let count = 10_000u64;

        let producer_handle = std::thread::spawn(move || {
            for i in 0..count {
                while producer.push(i).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        let consumer_handle = std::thread::spawn(move || {
            let mut expected = 0u64;
            while expected < count {
                if let Some(item) = consumer.pop() {
                    assert_eq!(item, expected);
                    expected += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        producer_handle.join().unwrap();
        consumer_handle.join().unwrap();
    }

    #[test]
    fn non_copy_type() {
        let (producer, consumer) = channel::<String, 8>();

        producer.push("hello".to_string()).unwrap();
        producer.push("world".to_string()).unwrap();

        assert_eq!(consumer.pop(), Some("hello".to_string()));
        assert_eq!(consumer.pop(), Some("world".to_string()));
        assert_eq!(consumer.pop(), None);
    }
}
