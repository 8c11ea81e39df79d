use core::mem;

use crate::printf;
use crate::proc::myproc;
use crate::syscall::sysfile::{
    sys_chdir, sys_close, sys_dup, sys_exec, sys_fstat, sys_link, sys_mkdir, sys_mknod, sys_open,
    sys_pipe, sys_read, sys_unlink, sys_write,
};
use crate::syscall::sysproc::{
    sys_exit, sys_fork, sys_getpid, sys_kill, sys_sbrk, sys_sleep, sys_uptime, sys_wait,
};
use crate::syscall::*;
use crate::vm::{copyin, copyinstr};

// Fetch the usize at addr from the current process.
pub fn fetchaddr(addr: usize, ip: &mut usize) -> i32 {
    let p = myproc();
    if addr >= p.sz || addr + mem::size_of::<usize>() > p.sz {
        // both tests needed, in case of overflow
        return -1;
    }
    if copyin(
        p.pagetable,
        ip as *mut usize as *mut u8,
        addr,
        mem::size_of::<usize>(),
    ) != 0
    {
        return -1;
    }
    0
}

// Fetch the nul-terminated string at addr from the current process.
// Returns length of string, not including nul, or -1 for error.
pub fn fetchstr(addr: usize, buf: &mut [u8]) -> i32 {
    let p = myproc();
    if copyinstr(p.pagetable, buf.as_mut_ptr(), addr, buf.len()) < 0 {
        return -1;
    }
    buf.iter().position(|&c| c == 0).unwrap_or(buf.len()) as i32
}

fn argraw(n: usize) -> u64 {
    let tf = unsafe { &*myproc().trapframe };
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

// Fetch the nth 32-bit system call argument.
pub fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

// Retrieve an argument as a pointer.
// Doesn't check for legality, since
// copyin/copyout will do that.
pub fn argaddr(n: usize) -> usize {
    argraw(n) as usize
}

// Fetch the nth word-sized system call argument as a null-terminated string.
// Copies into buf, at most buf.len().
// Returns string length if OK (excluding nul), or -1 if error.
pub fn argstr(n: usize, buf: &mut [u8]) -> i32 {
    let addr = argaddr(n);
    fetchstr(addr, buf)
}

// An array mapping syscall numbers from syscall/mod.rs
// to the function that handles the system call.
const SYSCALLS: [Option<fn() -> u64>; 22] = {
    let mut arr: [Option<fn() -> u64>; 22] = [None; 22];
    arr[SYS_FORK] = Some(sys_fork as fn() -> u64);
    arr[SYS_EXIT] = Some(sys_exit as fn() -> u64);
    arr[SYS_WAIT] = Some(sys_wait as fn() -> u64);
    arr[SYS_PIPE] = Some(sys_pipe as fn() -> u64);
    arr[SYS_READ] = Some(sys_read as fn() -> u64);
    arr[SYS_KILL] = Some(sys_kill as fn() -> u64);
    arr[SYS_EXEC] = Some(sys_exec as fn() -> u64);
    arr[SYS_FSTAT] = Some(sys_fstat as fn() -> u64);
    arr[SYS_CHDIR] = Some(sys_chdir as fn() -> u64);
    arr[SYS_DUP] = Some(sys_dup as fn() -> u64);
    arr[SYS_GETPID] = Some(sys_getpid as fn() -> u64);
    arr[SYS_SBRK] = Some(sys_sbrk as fn() -> u64);
    arr[SYS_SLEEP] = Some(sys_sleep as fn() -> u64);
    arr[SYS_UPTIME] = Some(sys_uptime as fn() -> u64);
    arr[SYS_OPEN] = Some(sys_open as fn() -> u64);
    arr[SYS_WRITE] = Some(sys_write as fn() -> u64);
    arr[SYS_MKNOD] = Some(sys_mknod as fn() -> u64);
    arr[SYS_UNLINK] = Some(sys_unlink as fn() -> u64);
    arr[SYS_LINK] = Some(sys_link as fn() -> u64);
    arr[SYS_MKDIR] = Some(sys_mkdir as fn() -> u64);
    arr[SYS_CLOSE] = Some(sys_close as fn() -> u64);
    arr
};

pub fn syscall() {
    let p = myproc();
    let tf = unsafe { &mut *p.trapframe };
    let num = tf.a7 as usize;

    if num > 0 && num < SYSCALLS.len() {
        if let Some(handler) = SYSCALLS[num] {
            // Use num to lookup the system call function for num,
            // call it, and store its return value in p->trapframe->a0.
            tf.a0 = handler();
            return;
        }
    }

    let len = p.name.iter().position(|&c| c == 0).unwrap_or(p.name.len());
    let name = core::str::from_utf8(&p.name[..len]).unwrap_or("?");
    printf!("{} {}: unknown sys call {}\n", p.pid, name, num);
    tf.a0 = u64::MAX;
}
