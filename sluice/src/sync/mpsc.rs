//! Lock-free MPSC queue for in-process (inter-thread) communication.
//!
//! Many producers, one consumer, over a heap-allocated ring buffer. The
//! producer handle is `Clone`: hand one clone to each producing thread.
//!
//! # Example
//!
//! ```
//! use sluice::sync::mpsc;
//!
//! let (producer, consumer) = mpsc::channel::<u64, 1024>();
//! let second = producer.clone();
//!
//! producer.push(1).expect("Queue full");
//! second.push(2).expect("Queue full");
//!
//! assert_eq!(consumer.pop(), Some(1));
//! assert_eq!(consumer.pop(), Some(2));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::cell::PhantomUnsync;
use crate::mpsc::ring::Ring;
use crate::sync::Timeout;

/// Write end of the MPSC queue.
///
/// `Producer` is [`Send`] and [`Clone`] but not [`Sync`]: clone one handle
/// per producing thread instead of sharing a reference.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

impl<T: Send, const N: usize> Clone for Producer<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            _unsync: PhantomData,
        }
    }
}

/// Read end of the MPSC queue.
///
/// Only one consumer may exist per queue: not `Clone`, [`Send`] but not
/// [`Sync`].
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

/// Creates a new MPSC channel with capacity `N` (a power of two >= 2,
/// enforced at compile time).
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
    /// Attempts to push an item onto the queue (lock-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: push tolerates any number of producers; the ring was
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
    use std::thread;

    #[test]
    fn basic_push_pop() {
        let (producer, consumer) = channel::<u64, 8>();

        producer.push(7).unwrap();
        assert_eq!(consumer.pop(), Some(7));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn cloned_producers_share_the_queue() {
        let (producer, consumer) = channel::<u64, 8>();
        let second = producer.clone();

        producer.push(1).unwrap();
        second.push(2).unwrap();

        assert_eq!(consumer.pop(), Some(1));
        assert_eq!(consumer.pop(), Some(2));
    }

    #[test]
    fn multi_producer_stress_no_loss() {
        let (producer, consumer) = channel::<u64, 128>();
        let producers = 4u64;
        let per_producer = 2_000u64;

        let handles: Vec<_> = (0..producers)
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
        drop(producer);

        let total = (producers * per_producer) as usize;
        let mut seen = vec![false; total];
        let mut received = 0usize;
        while received < total {
            if let Some(v) = consumer.pop() {
                assert!(!seen[v as usize], "value {v} delivered twice");
                seen[v as usize] = true;
                received += 1;
            } else {
                thread::yield_now();
            }
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(seen.iter().all(|&s| s));
    }
}
