//! Sleepable locks: spinlocks whose guards can sleep on a built-in wait
//! channel until another holder signals the condition (ticks, log space).
use core::ops::{Deref, DerefMut};

use super::{Spinlock, SpinlockGuard};
use crate::kernel::Kernel;
use crate::proc::WaitChannel;

pub struct Sleepablelock<T> {
    inner: Spinlock<T>,

    /// WaitChannel saying the condition may have changed.
    chan: WaitChannel,
}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    guard: SpinlockGuard<'s, T>,
}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            inner: Spinlock::new(name, data),
            chan: WaitChannel::new(),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        SleepablelockGuard {
            lock: self,
            guard: self.inner.lock(),
        }
    }

    /// Returns a mutable pointer to the inner data. The caller must
    /// ensure the access does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.inner.get_mut_raw()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep on the built-in channel;
    /// reacquires before returning.
    pub fn sleep(&mut self, kernel: &Kernel) {
        self.lock.chan.sleep(&mut self.guard, kernel);
    }

    /// Wake all sleepers on the built-in channel.
    pub fn wakeup(&self, kernel: &Kernel) {
        self.lock.chan.wakeup(kernel);
    }

    /// Temporarily releases the lock, runs `f`, and reacquires.
    /// The data must not be accessed through `self` inside `f`.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.guard.reacquire_after(f)
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
