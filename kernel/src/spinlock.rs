// Mutual exclusion spin locks.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::proc::{cpuid, mycpu};
use crate::riscv::{intr_get, intr_off, intr_on};

pub struct Spinlock {
    locked: AtomicBool, // Is the lock held?

    // For debugging:
    name: &'static str, // Name of lock.
    cpu: AtomicUsize,   // cpuid() + 1 of the holding cpu, 0 when free.
}

impl Spinlock {
    pub const fn new(name: &'static str) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
            cpu: AtomicUsize::new(0),
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub fn acquire(&self) {
        push_off(); // disable interrupts to avoid deadlock.
        if self.holding() {
            panic!("acquire {}", self.name);
        }

        // On RISC-V, the swap compiles to an atomic amoswap with
        // acquire ordering, so the critical section's memory
        // references happen strictly after the lock is acquired.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        // Record info about lock acquisition for holding() and debugging.
        self.cpu.store(cpuid() + 1, Ordering::Relaxed);
    }

    /// Release the lock.
    pub fn release(&self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }

        self.cpu.store(0, Ordering::Relaxed);

        // The release store keeps all the stores in the critical
        // section visible to other CPUs before the lock is released,
        // and keeps the critical section's loads strictly before it.
        // On RISC-V, this emits a fence instruction.
        self.locked.store(false, Ordering::Release);

        pop_off();
    }

    /// Check whether this cpu is holding the lock.
    /// Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpuid() + 1
    }
}

// push_off/pop_off are like intr_off()/intr_on() except that they are
// matched: it takes two pop_off()s to undo two push_off()s.  Also, if
// interrupts are initially off, then push_off, pop_off leaves them off.

pub fn push_off() {
    let old = intr_get();

    intr_off();
    let cpu = mycpu();
    if cpu.noff == 0 {
        cpu.intena = old;
    }
    cpu.noff += 1;
}

pub fn pop_off() {
    if intr_get() {
        panic!("pop_off - interruptible");
    }

    let cpu = mycpu();
    if cpu.noff < 1 {
        panic!("pop_off");
    }
    cpu.noff -= 1;
    if cpu.noff == 0 && cpu.intena {
        intr_on();
    }
}
