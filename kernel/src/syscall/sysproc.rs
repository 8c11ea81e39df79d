use core::ptr;

use crate::proc::{exit, fork, growproc, kill, killed, myproc, sleep, wait};
use crate::syscall::syscall::{argaddr, argint};
use crate::trap::{TICKS, TICKS_LOCK};

pub fn sys_exit() -> u64 {
    let n = argint(0);
    exit(n)
    // not reached
}

pub fn sys_getpid() -> u64 {
    myproc().pid as u64
}

pub fn sys_fork() -> u64 {
    fork() as u64
}

pub fn sys_wait() -> u64 {
    let addr = argaddr(0);
    wait(addr) as u64
}

pub fn sys_sbrk() -> u64 {
    let n = argint(0);
    let addr = myproc().sz;
    if growproc(n as isize) < 0 {
        return u64::MAX;
    }
    addr as u64
}

pub fn sys_sleep() -> u64 {
    let n = core::cmp::max(argint(0), 0) as u32;

    TICKS_LOCK.acquire();
    let ticks0 = unsafe { TICKS };
    while unsafe { TICKS } - ticks0 < n {
        if killed(myproc()) {
            TICKS_LOCK.release();
            return u64::MAX;
        }
        sleep(unsafe { ptr::addr_of!(TICKS) } as usize, &TICKS_LOCK);
    }
    TICKS_LOCK.release();
    0
}

pub fn sys_kill() -> u64 {
    let pid = argint(0);
    kill(pid as u32) as u64
}

// return how many clock tick interrupts have occurred
// since start.
pub fn sys_uptime() -> u64 {
    TICKS_LOCK.acquire();
    let xticks = unsafe { TICKS };
    TICKS_LOCK.release();
    xticks as u64
}
