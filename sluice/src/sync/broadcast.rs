//! Lock-free SPMC broadcast channel for in-process communication.
//!
//! One sender, `R` receivers, every receiver observes every item exactly
//! once at its own pace. `channel()` returns all `R` receivers up front
//! because every reader cursor counts toward the sender's fullness bound
//! from sequence 0: an unclaimed cursor would stall refuse-mode sends after
//! `N` items.
//!
//! Two pairings:
//!
//! - `send` / `try_recv`: the sender refuses when the slowest receiver is a
//!   full ring behind; nothing is ever lost.
//! - `send_overwrite` / `try_recv_lossy`: the sender never refuses; a lapped
//!   receiver gets [`RecvError::Lagged`] once and resumes from the oldest
//!   retained item.
//!
//! # Example
//!
//! ```
//! use sluice::sync::broadcast;
//!
//! let (tx, mut receivers) = broadcast::channel::<u64, 8, 2>();
//! let rx_b = receivers.pop().unwrap();
//! let rx_a = receivers.pop().unwrap();
//!
//! tx.send(7).expect("ring full");
//!
//! assert_eq!(rx_a.try_recv(), Some(7));
//! assert_eq!(rx_b.try_recv(), Some(7));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::cell::PhantomUnsync;
use crate::spmc::broadcast::Ring;
use crate::sync::Timeout;

pub use crate::spmc::broadcast::RecvError;

/// Sending half of the broadcast channel.
///
/// Only one sender may exist per channel: not `Clone`, [`Send`] but not
/// [`Sync`].
pub struct Sender<T: Copy + Send, const N: usize, const R: usize> {
    ring: Arc<Ring<T, N, R>>,
    _unsync: PhantomUnsync,
}

/// One receiver's half of the broadcast channel, bound to a fixed cursor.
///
/// Not `Clone` (the cursor index is an identity); [`Send`] but not [`Sync`].
pub struct Receiver<T: Copy + Send, const N: usize, const R: usize> {
    ring: Arc<Ring<T, N, R>>,
    reader: usize,
    _unsync: PhantomUnsync,
}

/// Creates a broadcast channel with capacity `N` and exactly `R` receivers.
///
/// `N` must be a power of two >= 2 and `R` at least 1, enforced at compile
/// time. Receiver `i` in the returned vector owns cursor `i`.
#[must_use]
pub fn channel<T: Copy + Send, const N: usize, const R: usize>()
-> (Sender<T, N, R>, Vec<Receiver<T, N, R>>) {
    let ring = Arc::new(Ring::new());

    let receivers = (0..R)
        .map(|reader| Receiver {
            ring: Arc::clone(&ring),
            reader,
            _unsync: PhantomData,
        })
        .collect();

    let sender = Sender {
        ring,
        _unsync: PhantomData,
    };

    (sender, receivers)
}

impl<T: Copy + Send, const N: usize, const R: usize> Sender<T, N, R> {
    /// Attempts to broadcast an item, refusing when the slowest receiver is
    /// a full ring behind.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full.
    #[inline]
    pub fn send(&self, item: T) -> Result<(), T> {
        // SAFETY: this handle is the unique sender and the ring was
        // initialized in channel().
        unsafe { self.ring.push(item) }
    }

    /// Broadcasts unconditionally, lapping receivers that are a full ring
    /// behind. Pair with [`Receiver::try_recv_lossy`].
    #[inline]
    pub fn send_overwrite(&self, item: T) {
        // SAFETY: as in send.
        unsafe { self.ring.push_overwrite(item) }
    }

    /// Spins until every receiver has room, then broadcasts.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    #[inline]
    pub fn send_blocking(&self, mut item: T, timeout: Timeout) -> Result<(), T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.send(item) {
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

impl<T: Copy + Send, const N: usize, const R: usize> Receiver<T, N, R> {
    /// The cursor index this receiver owns.
    #[must_use]
    pub fn reader(&self) -> usize {
        self.reader
    }

    /// Attempts to receive the next item (wait-free).
    ///
    /// Returns `None` when caught up. Use against a refuse-mode sender; an
    /// overwriting sender requires [`Receiver::try_recv_lossy`] to surface
    /// losses.
    #[inline]
    #[must_use]
    pub fn try_recv(&self) -> Option<T> {
        // SAFETY: this handle owns cursor `reader` exclusively.
        unsafe { self.ring.pop(self.reader) }
    }

    /// Attempts to receive the next item, tolerating sender overwrites.
    ///
    /// # Errors
    ///
    /// [`RecvError::Empty`] when caught up; [`RecvError::Lagged`] once per
    /// lap, after which the cursor has been reset to the oldest retained
    /// item.
    #[inline]
    pub fn try_recv_lossy(&self) -> Result<T, RecvError> {
        // SAFETY: as in try_recv.
        unsafe { self.ring.pop_lossy(self.reader) }
    }

    /// Spins until an item is available, then receives it.
    ///
    /// Returns `None` on timeout.
    #[inline]
    #[must_use]
    pub fn recv_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(item) = self.try_recv() {
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

    /// This receiver's cursor position.
    #[must_use]
    pub fn read_pos(&self) -> u64 {
        self.ring.read_pos(self.reader)
    }

    /// Overwrites this receiver's cursor. Flow control for redelivery; the
    /// position must stay within `[write_seq - N, write_seq]`.
    pub fn set_read_pos(&self, pos: u64) {
        self.ring.set_read_pos(self.reader, pos);
    }

    /// Advances this receiver's cursor by `n` (skipping items), returning
    /// the previous position.
    pub fn fetch_add_read_pos(&self, n: u64) -> u64 {
        self.ring.fetch_add_read_pos(self.reader, n)
    }

    /// Moves this receiver's cursor back by `n` (redelivering items),
    /// returning the previous position. Same range contract as
    /// [`Receiver::set_read_pos`].
    pub fn fetch_sub_read_pos(&self, n: u64) -> u64 {
        self.ring.fetch_sub_read_pos(self.reader, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fan_out_delivers_to_every_receiver_in_order() {
        let (tx, receivers) = channel::<u64, 8, 3>();

        for i in 0..8 {
            assert!(tx.send(i).is_ok());
        }
        for rx in &receivers {
            for i in 0..8 {
                assert_eq!(rx.try_recv(), Some(i));
            }
            assert_eq!(rx.try_recv(), None);
        }
    }

    #[test]
    fn lossy_receiver_resumes_after_lap() {
        let (tx, receivers) = channel::<u64, 4, 2>();

        // Receiver 0 keeps up, receiver 1 never receives.
        for i in 0..6 {
            tx.send_overwrite(i);
            assert_eq!(receivers[0].try_recv_lossy(), Ok(i));
        }

        assert_eq!(receivers[1].try_recv_lossy(), Err(RecvError::Lagged(2)));
        assert_eq!(receivers[1].read_pos(), 2);
        for i in 2..6 {
            assert_eq!(receivers[1].try_recv_lossy(), Ok(i));
        }
        assert_eq!(receivers[1].try_recv_lossy(), Err(RecvError::Empty));
    }

    #[test]
    fn rewind_redelivers_the_same_item() {
        let (tx, receivers) = channel::<u64, 8, 1>();
        let rx = &receivers[0];

        tx.send(41).unwrap();
        tx.send(42).unwrap();

        assert_eq!(rx.try_recv(), Some(41));
        rx.fetch_sub_read_pos(1);
        assert_eq!(rx.try_recv(), Some(41));
        assert_eq!(rx.try_recv(), Some(42));
    }

    #[test]
    fn concurrent_receivers_each_see_the_full_sequence() {
        let (tx, receivers) = channel::<u64, 16, 3>();
        let count = 5_000u64;

        let handles: Vec<_> = receivers
            .into_iter()
            .map(|rx| {
                thread::spawn(move || {
                    let mut expected = 0u64;
                    while expected < count {
                        if let Some(v) = rx.try_recv() {
                            assert_eq!(v, expected);
                            expected += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        for i in 0..count {
            while tx.send(i).is_err() {
                std::hint::spin_loop();
            }
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
