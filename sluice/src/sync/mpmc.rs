//! Lock-free MPMC unicast queue for in-process communication.
//!
//! Many producers, many consumers, each item delivered to exactly one
//! consumer. Both operations serialize their slot access through CAS, so
//! unlike the single-role queues the handles here are [`Sync`] as well as
//! [`Clone`]: sharing `&Producer` or `&Consumer` across threads is safe.
//!
//! # Example
//!
//! ```
//! use sluice::sync::mpmc;
//!
//! let (producer, consumer) = mpmc::channel::<u64, 1024>();
//!
//! producer.push(1).expect("Queue full");
//! assert_eq!(consumer.pop(), Some(1));
//! ```

use std::sync::Arc;

use minstant::Instant;

use crate::mpmc::ring::Ring;
use crate::sync::Timeout;

/// Write end of the MPMC queue. `Clone` + `Send` + `Sync`.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T: Send, const N: usize> Clone for Producer<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the MPMC queue. `Clone` + `Send` + `Sync`.
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T: Send, const N: usize> Clone for Consumer<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Creates a new MPMC unicast channel with capacity `N` (a power of two
/// >= 2, enforced at compile time).
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let ring = Arc::new(Ring::new());

    let producer = Producer {
        ring: Arc::clone(&ring),
    };

    let consumer = Consumer { ring };

    (producer, consumer)
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Attempts to push an item onto the queue (lock-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: push tolerates any number of callers; the ring was
        // initialized in channel().
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
    /// Attempts to claim the next item (lock-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: pop tolerates any number of callers; the ring was
        // initialized in channel().
        unsafe { self.ring.pop() }
    }

    /// Spins until an item is claimed, then returns it.
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
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn basic_push_pop() {
        let (producer, consumer) = channel::<u64, 8>();

        producer.push(11).unwrap();
        assert_eq!(consumer.pop(), Some(11));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn four_by_four_multiset_roundtrip() {
        let (producer, consumer) = channel::<u64, 1024>();
        let producers = 4u64;
        let per_producer = 1_000u64;
        let total = producers * per_producer;

        let producer_handles: Vec<_> = (0..producers)
            .map(|p| {
                let tx = producer.clone();
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let value = p * per_producer + i;
                        while tx.push(value).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let counted = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let consumer_handles: Vec<_> = (0..4)
            .map(|_| {
                let rx = consumer.clone();
                let counted = Arc::clone(&counted);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while counted.load(std::sync::atomic::Ordering::Relaxed) < total {
                        if let Some(v) = rx.pop() {
                            counted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            got.push(v);
                        } else {
                            thread::yield_now();
                        }
                    }
                    got
                })
            })
            .collect();

        for h in producer_handles {
            h.join().unwrap();
        }

        let mut all = HashSet::new();
        for h in consumer_handles {
            for v in h.join().unwrap() {
                assert!(all.insert(v), "value {v} consumed twice");
            }
        }
        assert_eq!(all.len() as u64, total);
        for v in 0..total {
            assert!(all.contains(&v), "value {v} lost");
        }
    }
}
