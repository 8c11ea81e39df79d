use core::ptr;

use crate::file::file::{filealloc, fileclose};
use crate::file::{FDType, File};
use crate::kalloc::KMEM;
use crate::proc::{killed, myproc, sleep, wakeup};
use crate::spinlock::Spinlock;
use crate::vm::{copyin, copyout};

pub const PIPESIZE: usize = 512;

pub struct Pipe {
    lock: Spinlock,
    data: [u8; PIPESIZE],
    nread: u32,      // number of bytes read
    nwrite: u32,     // number of bytes written
    readopen: bool,  // read fd is still open
    writeopen: bool, // write fd is still open
}

// Allocate a pipe and two file structures wrapping its ends.
// On success f0 is the read end and f1 the write end.
pub fn pipealloc(f0: &mut *mut File, f1: &mut *mut File) -> i32 {
    *f0 = ptr::null_mut();
    *f1 = ptr::null_mut();

    let bad = |f0: &mut *mut File, f1: &mut *mut File, pi: *mut Pipe| {
        if !pi.is_null() {
            unsafe { KMEM.kfree(pi as *mut u8) };
        }
        if !f0.is_null() {
            fileclose(*f0);
        }
        if !f1.is_null() {
            fileclose(*f1);
        }
        -1
    };

    match filealloc() {
        Some(file0) => *f0 = file0,
        None => return bad(f0, f1, ptr::null_mut()),
    }
    match filealloc() {
        Some(file1) => *f1 = file1,
        None => return bad(f0, f1, ptr::null_mut()),
    }

    // the pipe lives in its own page; it is comfortably smaller.
    let pi = unsafe { KMEM.kalloc() } as *mut Pipe;
    if pi.is_null() {
        return bad(f0, f1, pi);
    }
    unsafe {
        ptr::write(
            pi,
            Pipe {
                lock: Spinlock::new("pipe"),
                data: [0; PIPESIZE],
                nread: 0,
                nwrite: 0,
                readopen: true,
                writeopen: true,
            },
        );

        (**f0).ftype = FDType::Pipe;
        (**f0).readable = true;
        (**f0).writable = false;
        (**f0).pipe = pi;

        (**f1).ftype = FDType::Pipe;
        (**f1).readable = false;
        (**f1).writable = true;
        (**f1).pipe = pi;
    }

    0
}

impl Pipe {
    pub fn close(&mut self, writable: bool) {
        self.lock.acquire();
        if writable {
            self.writeopen = false;
            wakeup(ptr::addr_of!(self.nread) as usize);
        } else {
            self.readopen = false;
            wakeup(ptr::addr_of!(self.nwrite) as usize);
        }

        if !self.readopen && !self.writeopen {
            self.lock.release();
            unsafe { KMEM.kfree(self as *mut Pipe as *mut u8) };
        } else {
            self.lock.release();
        }
    }

    pub fn write(&mut self, addr: usize, n: usize) -> i32 {
        let p = myproc();
        let mut i = 0;

        self.lock.acquire();
        while i < n {
            if !self.readopen || killed(p) {
                self.lock.release();
                return -1;
            }
            if self.nwrite == self.nread + PIPESIZE as u32 {
                // pipewrite-full
                wakeup(ptr::addr_of!(self.nread) as usize);
                sleep(ptr::addr_of!(self.nwrite) as usize, &self.lock);
            } else {
                let mut ch = 0u8;
                if copyin(p.pagetable, &mut ch as *mut u8, addr + i, 1) == -1 {
                    break;
                }
                self.data[self.nwrite as usize % PIPESIZE] = ch;
                self.nwrite += 1;
                i += 1;
            }
        }
        wakeup(ptr::addr_of!(self.nread) as usize);
        self.lock.release();

        i as i32
    }

    pub fn read(&mut self, addr: usize, n: usize) -> i32 {
        let p = myproc();

        self.lock.acquire();
        while self.nread == self.nwrite && self.writeopen {
            // pipe-empty
            if killed(p) {
                self.lock.release();
                return -1;
            }
            sleep(ptr::addr_of!(self.nread) as usize, &self.lock); // pipe-sleep
        }

        let mut i = 0;
        while i < n {
            // pipe-copy
            if self.nread == self.nwrite {
                break;
            }
            let ch = self.data[self.nread as usize % PIPESIZE];
            self.nread += 1;
            if copyout(p.pagetable, addr + i, &ch as *const u8, 1) == -1 {
                break;
            }
            i += 1;
        }
        wakeup(ptr::addr_of!(self.nwrite) as usize); // pipe-wakeup
        self.lock.release();

        i as i32
    }
}
