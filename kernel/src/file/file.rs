//
// Support functions for system calls that involve file descriptors.
//

use core::ptr;

use crate::file::{Devsw, FDType, File, DEVSW};
use crate::fs::BSIZE;
use crate::log::{begin_op, end_op};
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::proc::myproc;
use crate::spinlock::Spinlock;
use crate::stat::Stat;
use crate::vm::copyout;

struct FTable {
    lock: Spinlock,
    file: [File; NFILE],
}

static mut FTABLE: FTable = FTable {
    lock: Spinlock::new("ftable"),
    file: [const { File::new() }; NFILE],
};

// Allocate a file structure.
pub fn filealloc() -> Option<&'static mut File> {
    unsafe {
        FTABLE.lock.acquire();
        for f in FTABLE.file.iter_mut() {
            if f.ref_cnt == 0 {
                f.ref_cnt = 1;
                FTABLE.lock.release();
                return Some(f);
            }
        }
        FTABLE.lock.release();
        None
    }
}

// Increment ref count for file f.
pub fn filedup(f: *mut File) -> *mut File {
    unsafe {
        FTABLE.lock.acquire();
        if (*f).ref_cnt < 1 {
            panic!("filedup");
        }
        (*f).ref_cnt += 1;
        FTABLE.lock.release();
    }
    f
}

// Close file f.  (Decrement ref count, close when reaches 0.)
pub fn fileclose(f: *mut File) {
    unsafe {
        FTABLE.lock.acquire();
        let f = &mut *f;
        if f.ref_cnt < 1 {
            panic!("fileclose");
        }
        f.ref_cnt -= 1;
        if f.ref_cnt > 0 {
            FTABLE.lock.release();
            return;
        }

        let ftype = f.ftype;
        let pipe = f.pipe;
        let writable = f.writable;
        let ip = f.ip;

        f.ref_cnt = 0;
        f.ftype = FDType::None;
        f.pipe = ptr::null_mut();
        f.ip = ptr::null_mut();
        FTABLE.lock.release();

        match ftype {
            FDType::Pipe => (*pipe).close(writable),
            FDType::INode | FDType::Device => {
                begin_op();
                (*ip).iput();
                end_op();
            }
            FDType::None => panic!("fileclose: none"),
        }
    }
}

// Get metadata about file f.
// addr is a user virtual address, pointing to a struct stat.
pub fn filestat(f: &mut File, addr: usize) -> i32 {
    let p = myproc();

    match f.ftype {
        FDType::INode | FDType::Device => {
            let mut st = Stat::default();
            let ip = unsafe { &mut *f.ip };
            ip.ilock();
            ip.stati(&mut st);
            ip.iunlock();
            if copyout(
                p.pagetable,
                addr,
                ptr::addr_of!(st) as *const u8,
                core::mem::size_of::<Stat>(),
            ) < 0
            {
                return -1;
            }
            0
        }
        _ => -1,
    }
}

// Read from file f.
// addr is a user virtual address.
pub fn fileread(f: &mut File, addr: usize, n: i32) -> i32 {
    if !f.readable {
        return -1;
    }

    match f.ftype {
        FDType::Pipe => unsafe { (*f.pipe).read(addr, n as usize) },
        FDType::Device => {
            if f.major < 0 || f.major as usize >= NDEV {
                return -1;
            }
            let dev: Devsw = unsafe { DEVSW[f.major as usize] };
            match dev.read {
                Some(read) => read(true, addr, n as usize),
                None => -1,
            }
        }
        FDType::INode => {
            let ip = unsafe { &mut *f.ip };
            ip.ilock();
            let r = ip.readi(true, addr, f.off, n as u32);
            if r > 0 {
                f.off += r as u32;
            }
            ip.iunlock();
            r
        }
        FDType::None => panic!("fileread"),
    }
}

// Write to file f.
// addr is a user virtual address.
pub fn filewrite(f: &mut File, addr: usize, n: i32) -> i32 {
    if !f.writable {
        return -1;
    }

    match f.ftype {
        FDType::Pipe => unsafe { (*f.pipe).write(addr, n as usize) },
        FDType::Device => {
            if f.major < 0 || f.major as usize >= NDEV {
                return -1;
            }
            let dev: Devsw = unsafe { DEVSW[f.major as usize] };
            match dev.write {
                Some(write) => write(true, addr, n as usize),
                None => -1,
            }
        }
        FDType::INode => {
            // write a few blocks at a time to avoid exceeding
            // the maximum log transaction size, including
            // i-node, indirect block, allocation blocks,
            // and 2 blocks of slop for non-aligned writes.
            // this really belongs lower down, since writei()
            // might be writing a device like the console.
            let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
            let n = n as usize;
            let mut i = 0;
            while i < n {
                let n1 = core::cmp::min(n - i, max);

                begin_op();
                let ip = unsafe { &mut *f.ip };
                ip.ilock();
                let r = ip.writei(true, addr + i, f.off, n1 as u32);
                if r > 0 {
                    f.off += r as u32;
                }
                ip.iunlock();
                end_op();

                if r != n1 as i32 {
                    // error from writei
                    break;
                }
                i += r as usize;
            }
            if i == n {
                n as i32
            } else {
                -1
            }
        }
        FDType::None => panic!("filewrite"),
    }
}
