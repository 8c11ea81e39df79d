use core::ptr;

use crate::bio::{bpin, bread, brelse, bunpin, bwrite};
use crate::buf::Buf;
use crate::fs::{SuperBlock, BSIZE};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::proc::{sleep, wakeup};
use crate::spinlock::Spinlock;
use crate::string::memmove;

// Simple logging that allows concurrent FS system calls.
//
// A log transaction contains the updates of multiple FS system
// calls. The logging system only commits when there are
// no FS system calls active. Thus there is never
// any reasoning required about whether a commit might
// write an uncommitted system call's updates to disk.
//
// A system call should call begin_op()/end_op() to mark
// its start and end. Usually begin_op() just increments
// the count of in-progress FS system calls and returns.
// But if it thinks the log is close to running out, it
// sleeps until the last outstanding end_op() commits.
//
// The log is a physical re-do log containing disk blocks.
// The on-disk log format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.

// Contents of the header block, used for both the on-disk header block
// and to keep track in memory of logged block# before commit.
#[derive(Clone, Copy)]
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

struct Log {
    lock: Spinlock,
    start: u32,
    size: u32,
    outstanding: u32, // how many FS sys calls are executing.
    committing: bool, // in commit(), please wait.
    dev: u32,
    lh: LogHeader,
}

static mut LOG: Log = Log {
    lock: Spinlock::new("log"),
    start: 0,
    size: 0,
    outstanding: 0,
    committing: false,
    dev: 0,
    lh: LogHeader {
        n: 0,
        block: [0; LOGSIZE],
    },
};

pub fn initlog(dev: u32, sb: &SuperBlock) {
    if core::mem::size_of::<LogHeader>() >= BSIZE {
        panic!("initlog: too big logheader");
    }

    unsafe {
        LOG.start = sb.logstart;
        LOG.size = sb.nlog;
        LOG.dev = dev;
    }
    recover_from_log();
}

// Copy committed blocks from log to their home location
fn install_trans(recovering: bool) {
    let log = unsafe { &mut LOG };
    for tail in 0..log.lh.n {
        let lbuf = bread(log.dev, log.start + tail + 1); // read log block
        let dbuf = bread(log.dev, log.lh.block[tail as usize]); // read dst
        memmove(dbuf.data.as_mut_ptr(), lbuf.data.as_ptr(), BSIZE); // copy block to dst
        bwrite(dbuf); // write dst to disk
        if !recovering {
            bunpin(dbuf);
        }
        brelse(lbuf);
        brelse(dbuf);
    }
}

// Read the log header from disk into the in-memory log header
fn read_head() {
    let log = unsafe { &mut LOG };
    let buf = bread(log.dev, log.start);
    // the header need not be aligned within the buffer's byte array.
    let lh = unsafe { ptr::read_unaligned(buf.data.as_ptr() as *const LogHeader) };
    log.lh.n = lh.n;
    for i in 0..log.lh.n as usize {
        log.lh.block[i] = lh.block[i];
    }
    brelse(buf);
}

// Write in-memory log header to disk.
// This is the true point at which the
// current transaction commits.
fn write_head() {
    let log = unsafe { &mut LOG };
    let buf = bread(log.dev, log.start);
    unsafe { ptr::write_unaligned(buf.data.as_mut_ptr() as *mut LogHeader, log.lh) };
    bwrite(buf);
    brelse(buf);
}

fn recover_from_log() {
    read_head();
    install_trans(true); // if committed, copy from log to disk
    unsafe { LOG.lh.n = 0 };
    write_head(); // clear the log
}

// called at the start of each FS system call.
pub fn begin_op() {
    let log = unsafe { &mut LOG };
    log.lock.acquire();
    loop {
        if log.committing {
            sleep(unsafe { ptr::addr_of!(LOG) } as usize, &log.lock);
        } else if log.lh.n as usize + (log.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
            // this op might exhaust log space; wait for commit.
            sleep(unsafe { ptr::addr_of!(LOG) } as usize, &log.lock);
        } else {
            log.outstanding += 1;
            log.lock.release();
            break;
        }
    }
}

// called at the end of each FS system call.
// commits if this was the last outstanding operation.
pub fn end_op() {
    let log = unsafe { &mut LOG };
    let mut do_commit = false;

    log.lock.acquire();
    log.outstanding -= 1;
    if log.committing {
        panic!("log committing");
    }
    if log.outstanding == 0 {
        do_commit = true;
        log.committing = true;
    } else {
        // begin_op() may be waiting for log space,
        // and decrementing log.outstanding has decreased
        // the amount of reserved space.
        wakeup(unsafe { ptr::addr_of!(LOG) } as usize);
    }
    log.lock.release();

    if do_commit {
        // call commit w/o holding locks, since not allowed
        // to sleep with locks.
        commit();
        log.lock.acquire();
        log.committing = false;
        wakeup(unsafe { ptr::addr_of!(LOG) } as usize);
        log.lock.release();
    }
}

// Copy modified blocks from cache to log.
fn write_log() {
    let log = unsafe { &mut LOG };
    for tail in 0..log.lh.n {
        let to = bread(log.dev, log.start + tail + 1); // log block
        let from = bread(log.dev, log.lh.block[tail as usize]); // cache block
        memmove(to.data.as_mut_ptr(), from.data.as_ptr(), BSIZE);
        bwrite(to); // write the log
        brelse(from);
        brelse(to);
    }
}

fn commit() {
    if unsafe { LOG.lh.n } > 0 {
        write_log(); // Write modified blocks from cache to log
        write_head(); // Write header to disk -- the real commit
        install_trans(false); // Now install writes to home locations
        unsafe { LOG.lh.n = 0 };
        write_head(); // Erase the transaction from the log
    }
}

// Caller has modified b->data and is done with the buffer.
// Record the block number and pin in the cache by increasing refcnt.
// commit()/write_log() will do the disk write.
//
// log_write() replaces bwrite(); a typical use is:
//   bp = bread(...)
//   modify bp->data[]
//   log_write(bp)
//   brelse(bp)
pub fn log_write(b: &mut Buf) {
    let log = unsafe { &mut LOG };
    log.lock.acquire();

    if log.lh.n as usize >= LOGSIZE || log.lh.n >= log.size - 1 {
        panic!("too big a transaction");
    }
    if log.outstanding < 1 {
        panic!("log_write outside of trans");
    }

    let n = log.lh.n as usize;
    let mut i = 0;
    while i < n {
        if log.lh.block[i] == b.blockno {
            // log absorption
            break;
        }
        i += 1;
    }
    log.lh.block[i] = b.blockno;
    if i == n {
        // Add new block to log
        bpin(b);
        log.lh.n += 1;
    }

    log.lock.release();
}
