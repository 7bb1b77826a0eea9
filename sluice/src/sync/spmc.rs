//! Lock-free SPMC unicast queue for in-process communication.
//!
//! One producer, many consumers racing to claim items (work stealing): each
//! item is received by exactly one consumer. For fan-out delivery where
//! every consumer sees every item, use [`crate::sync::broadcast`] instead.
//!
//! Keep the capacity above the number of consumers; see the claim-then-move
//! note on the core ring.
//!
//! # Example
//!
//! ```
//! use sluice::sync::spmc;
//!
//! let (producer, consumer) = spmc::channel::<u64, 1024>();
//! let stealer = consumer.clone();
//!
//! producer.push(5).expect("Queue full");
//!
//! // Exactly one of the two consumers gets the item.
//! let got = consumer.pop().or_else(|| stealer.pop());
//! assert_eq!(got, Some(5));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::cell::PhantomUnsync;
use crate::spmc::ring::Ring;
use crate::sync::Timeout;

/// Write end of the SPMC queue.
///
/// Only one producer may exist per queue: not `Clone`, [`Send`] but not
/// [`Sync`].
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Read end of the SPMC queue.
///
/// `Consumer` is [`Send`] and [`Clone`] but not [`Sync`]: clone one handle
/// per consuming thread instead of sharing a reference.
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

impl<T: Send, const N: usize> Clone for Consumer<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            _unsync: PhantomData,
        }
    }
}

/// Creates a new SPMC unicast channel with capacity `N` (a power of two
/// >= 2, enforced at compile time).
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
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the unique producer and the ring was
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
    /// Returns `None` if the queue is empty. Each item is claimed by exactly
    /// one consumer.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: pop tolerates any number of consumers; the ring was
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
    use std::thread;

    #[test]
    fn basic_push_pop() {
        let (producer, consumer) = channel::<u64, 8>();

        producer.push(3).unwrap();
        assert_eq!(consumer.pop(), Some(3));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn work_stealing_claims_each_item_once() {
        let (producer, consumer) = channel::<u64, 64>();
        let total = 4_000u64;
        let workers = 4;

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = consumer.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    loop {
                        match rx.pop() {
                            Some(v) if v == u64::MAX => break,
                            Some(v) => got.push(v),
                            None => thread::yield_now(),
                        }
                    }
                    got
                })
            })
            .collect();
        drop(consumer);

        for i in 0..total {
            while producer.push(i).is_err() {
                thread::yield_now();
            }
        }
        for _ in 0..workers {
            while producer.push(u64::MAX).is_err() {
                thread::yield_now();
            }
        }

        let mut seen = vec![false; total as usize];
        for h in handles {
            for v in h.join().unwrap() {
                assert!(!seen[v as usize], "value {v} claimed twice");
                seen[v as usize] = true;
            }
        }
        assert!(seen.iter().all(|&s| s), "some values were lost");
    }
}
