//! Sleeping locks: long-term locks for processes. Holding one across
//! disk I/O is fine; contenders give up the CPU instead of spinning.
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::Spinlock;
use crate::kernel::Kernel;
use crate::proc::{Pid, WaitChannel};

struct SleepLockInfo {
    /// Is the lock held?
    locked: bool,

    /// Process holding the lock.
    pid: Pid,
}

/// A blocking lock layered on a spinlock guarding `locked`.
pub struct SleepLock<T> {
    lk: Spinlock<SleepLockInfo>,

    /// WaitChannel saying the lock was released.
    chan: WaitChannel,

    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
    kernel: &'s Kernel,
    _marker: PhantomData<*const ()>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lk: Spinlock::new(name, SleepLockInfo { locked: false, pid: 0 }),
            chan: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, sleeping while another process holds it.
    pub fn lock<'s>(&'s self, kernel: &'s Kernel) -> SleepLockGuard<'s, T> {
        let pid = kernel.current_pid();
        let mut info = self.lk.lock();
        while info.locked {
            self.chan.sleep(&mut info, kernel);
        }
        info.locked = true;
        info.pid = pid;
        drop(info);

        SleepLockGuard {
            lock: self,
            kernel,
            _marker: PhantomData,
        }
    }

    /// Does the current process hold this lock?
    pub fn holding(&self, kernel: &Kernel) -> bool {
        let info = self.lk.lock();
        info.locked && info.pid == kernel.current_pid()
    }

    /// Returns a mutable pointer to the inner data. The caller must
    /// ensure the access does not race, e.g. a disk interrupt completing
    /// a buffer whose holder is asleep.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` is exclusive.
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut info = self.lock.lk.lock();
        info.locked = false;
        info.pid = 0;
        self.lock.chan.wakeup(self.kernel);
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}
