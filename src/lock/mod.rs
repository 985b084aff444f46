//! Locks: a busy-waiting, interrupt-disabling spinlock; a blocking
//! sleep-lock layered on it; and a spinlock whose guard can sleep on a
//! built-in wait channel.

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{pop_off, push_off, RawSpinlock, Spinlock, SpinlockGuard};
