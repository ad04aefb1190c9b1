//! Cross-thread signalling between the controller and the transport
//!
//! Two channel shapes are used:
//!
//! * [`SignalSet`] accumulates independent flags. Raising a flag twice before
//!   the receiver wakes is the same as raising it once, and distinct flags
//!   never overwrite each other.
//! * [`Mailbox`] keeps only the latest posted value.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A flag that can live in a [`SignalSet`]
pub trait Signal: Copy + 'static {
    /// Every flag, in the order receivers should handle them
    const ALL: &'static [Self];

    fn mask(self) -> u32;
}

/// Snapshot of raised flags
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signals<T> {
    bits: u32,
    _marker: PhantomData<T>,
}

impl<T: Signal> Signals<T> {
    fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }

    pub fn contains(&self, signal: T) -> bool {
        self.bits & signal.mask() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Raised flags in handling order
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        T::ALL.iter().copied().filter(move |s| self.contains(*s))
    }
}

impl<T: Signal + std::fmt::Debug> std::fmt::Debug for Signals<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Accumulating flag channel
pub struct SignalSet<T> {
    bits: Mutex<u32>,
    raised: Condvar,
    _marker: PhantomData<T>,
}

impl<T: Signal> Default for SignalSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Signal> SignalSet<T> {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(0),
            raised: Condvar::new(),
            _marker: PhantomData,
        }
    }

    pub fn raise(&self, signal: T) {
        *self.bits.lock() |= signal.mask();
        self.raised.notify_all();
    }

    /// Raise several flags at once; the receiver sees them in the same wakeup
    pub fn raise_all(&self, signals: &[T]) {
        let mask = signals.iter().fold(0, |acc, s| acc | s.mask());
        *self.bits.lock() |= mask;
        self.raised.notify_all();
    }

    /// Raise `signal` and withdraw `cancels` if still pending
    pub fn replace(&self, signal: T, cancels: T) {
        let mut bits = self.bits.lock();
        *bits &= !cancels.mask();
        *bits |= signal.mask();
        drop(bits);
        self.raised.notify_all();
    }

    pub fn is_raised(&self, signal: T) -> bool {
        *self.bits.lock() & signal.mask() != 0
    }

    /// Take every pending flag without waiting
    pub fn take(&self) -> Signals<T> {
        Signals::from_bits(std::mem::take(&mut *self.bits.lock()))
    }

    /// Wait up to `timeout` for at least one flag, then take all of them
    pub fn wait(&self, timeout: Duration) -> Signals<T> {
        let deadline = Instant::now() + timeout;
        let mut bits = self.bits.lock();
        while *bits == 0 {
            if self.raised.wait_until(&mut bits, deadline).timed_out() {
                break;
            }
        }
        Signals::from_bits(std::mem::take(&mut *bits))
    }
}

/// Single-slot channel where a new value overwrites an unread one
pub struct Mailbox<T> {
    slot: Mutex<(Option<T>, u64)>,
    posted: Condvar,
}

impl<T: Clone> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new((None, 0)),
            posted: Condvar::new(),
        }
    }

    pub fn post(&self, value: T) {
        let mut slot = self.slot.lock();
        slot.0 = Some(value);
        slot.1 += 1;
        drop(slot);
        self.posted.notify_all();
    }

    /// Latest value, leaving it in place
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().0.clone()
    }

    /// Number of posts so far
    pub fn version(&self) -> u64 {
        self.slot.lock().1
    }

    /// Wait until something newer than `seen` is posted
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> Option<(T, u64)> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.1 <= seen {
            if self.posted.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        if slot.1 > seen {
            slot.0.clone().map(|v| (v, slot.1))
        } else {
            None
        }
    }

    /// Wait up to `timeout` for a value matching `pred`
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&T) -> bool) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.0.as_ref().filter(|v| pred(v)) {
                return Some(value.clone());
            }
            if self.posted.wait_until(&mut slot, deadline).timed_out() {
                return slot.0.as_ref().filter(|v| pred(v)).cloned();
            }
        }
    }
}
