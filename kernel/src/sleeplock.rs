// Long-term locks for processes: safe to hold across blocking
// operations, unlike a spin lock.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

pub struct Sleeplock {
    locked: AtomicBool, // Is the lock held?
    lk: Spinlock,       // spinlock protecting this sleep lock

    // For debugging:
    #[allow(dead_code)]
    name: &'static str, // Name of lock.
    pid: AtomicU32,     // Process holding lock
}

impl Sleeplock {
    pub const fn new(name: &'static str) -> Self {
        Sleeplock {
            locked: AtomicBool::new(false),
            lk: Spinlock::new("sleep lock"),
            name,
            pid: AtomicU32::new(0),
        }
    }

    pub fn acquire_sleep(&self) {
        self.lk.acquire();
        while self.locked.load(Ordering::Relaxed) {
            sleep(self as *const Sleeplock as usize, &self.lk);
        }
        self.locked.store(true, Ordering::Relaxed);
        self.pid.store(myproc().pid, Ordering::Relaxed);
        self.lk.release();
    }

    pub fn release_sleep(&self) {
        self.lk.acquire();
        self.locked.store(false, Ordering::Relaxed);
        self.pid.store(0, Ordering::Relaxed);
        wakeup(self as *const Sleeplock as usize);
        self.lk.release();
    }

    pub fn holding_sleep(&self) -> bool {
        self.lk.acquire();
        let held = self.locked.load(Ordering::Relaxed) && self.pid.load(Ordering::Relaxed) == myproc().pid;
        self.lk.release();
        held
    }
}
