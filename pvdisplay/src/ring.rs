// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Single-producer single-consumer rings with a notification handshake.
//!
//! The producer and the consumer each own a cursor, `prod` and `cons`. Slot `x & (N - 1)` holds
//! item number `x`, and both cursors only ever grow (wrapping at `u32::MAX`).
//!
//! Neither side polls. Before going to sleep, a side arms a notification threshold on the other
//! side:
//!
//! - A producer that finds the ring full calls [`prod_wait`], which sets `notify_on_cons` to
//!   `cons + 1`. The consumer's next [`pop`] then reports that the producer must be woken up.
//! - A consumer that finds the ring empty calls [`cons_wait`], which sets `notify_on_prod` to
//!   `prod + 1`. The producer's next [`push`] then reports that the consumer must be woken up.
//!
//! Arming is followed by a full fence and a recheck, so that an update racing with the arming is
//! never lost. How the wake-up is delivered (a port write, an event) is up to the user of the
//! ring.
//!
//! [`prod_wait`]: Ring::prod_wait
//! [`cons_wait`]: Ring::cons_wait
//! [`push`]: Ring::push
//! [`pop`]: Ring::pop

use std::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{fence, AtomicU32, Ordering},
};

pub struct Ring<T, const N: usize> {
    prod: AtomicU32,
    notify_on_prod: AtomicU32,
    cons: AtomicU32,
    notify_on_cons: AtomicU32,
    items: Box<[UnsafeCell<Option<T>>]>,
}

// SAFETY: Items are moved in by the single producer and out by the single consumer, and a slot is
// never accessed by both at once because the cursors are published with release/acquire ordering.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    const MASK: u32 = {
        assert!(N.is_power_of_two() && N <= 1 << 31);

        (N - 1) as u32
    };

    pub fn new() -> Self {
        let _ = Self::MASK;

        Ring {
            prod: AtomicU32::new(0),
            notify_on_prod: AtomicU32::new(1),
            cons: AtomicU32::new(0),
            notify_on_cons: AtomicU32::new(1),
            items: (0..N).map(|_| UnsafeCell::new(None)).collect(),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of items published and not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        let cons = self.cons.load(Ordering::Acquire);
        let prod = self.prod.load(Ordering::Acquire);

        prod.wrapping_sub(cons) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    /// Total number of items ever published.
    #[inline]
    pub fn produced(&self) -> u32 {
        self.prod.load(Ordering::Acquire)
    }

    /// Returns `true` if the ring is full and the producer has to wait.
    ///
    /// In that case the next pop reports that the producer needs to be woken up.
    pub fn prod_wait(&self) -> bool {
        if !self.is_full() {
            return false;
        }

        let cons = self.cons.load(Ordering::Acquire);
        self.notify_on_cons
            .store(cons.wrapping_add(1), Ordering::Release);
        fence(Ordering::SeqCst);

        self.is_full()
    }

    /// Returns `true` if the ring is empty and the consumer has to wait.
    ///
    /// In that case the next push reports that the consumer needs to be woken up.
    pub fn cons_wait(&self) -> bool {
        if !self.is_empty() {
            return false;
        }

        let prod = self.prod.load(Ordering::Acquire);
        self.notify_on_prod
            .store(prod.wrapping_add(1), Ordering::Release);
        fence(Ordering::SeqCst);

        self.is_empty()
    }

    /// Publishes `item`. Returns whether the consumer asked to be notified, or gives the item back
    /// if the ring is full.
    ///
    /// # Safety
    ///
    /// - There must be no concurrent call to `push` on the same ring.
    pub unsafe fn push(&self, item: T) -> Result<bool, T> {
        let prod = self.prod.load(Ordering::Relaxed);

        if prod.wrapping_sub(self.cons.load(Ordering::Acquire)) as usize >= N {
            return Err(item);
        }

        let slot = &self.items[(prod & Self::MASK) as usize];
        // SAFETY: The slot is past `cons`, so the consumer doesn't touch it, and the caller
        // guarantees there is no other producer.
        unsafe { *slot.get() = Some(item) };

        let prod = prod.wrapping_add(1);
        self.prod.store(prod, Ordering::Release);
        fence(Ordering::SeqCst);

        Ok(prod == self.notify_on_prod.load(Ordering::Acquire))
    }

    /// Takes the oldest item. Returns it together with whether the producer asked to be notified,
    /// or `None` if the ring is empty.
    ///
    /// # Safety
    ///
    /// - There must be no concurrent call to `pop` on the same ring.
    pub unsafe fn pop(&self) -> Option<(T, bool)> {
        let cons = self.cons.load(Ordering::Relaxed);

        if cons == self.prod.load(Ordering::Acquire) {
            return None;
        }

        let slot = &self.items[(cons & Self::MASK) as usize];
        // SAFETY: The slot is before `prod`, so the producer doesn't touch it, and the caller
        // guarantees there is no other consumer.
        let item = unsafe { (*slot.get()).take() }?;

        let cons = cons.wrapping_add(1);
        self.cons.store(cons, Ordering::Release);
        fence(Ordering::SeqCst);

        Some((item, cons == self.notify_on_cons.load(Ordering::Acquire)))
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for Ring<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &N)
            .field("prod", &self.prod)
            .field("cons", &self.cons)
            .field("notify_on_prod", &self.notify_on_prod)
            .field("notify_on_cons", &self.notify_on_cons)
            .finish_non_exhaustive()
    }
}
