// Physical memory allocator, for user pages, kernel stacks,
// page-table pages, and pipe buffers. Allocates whole 4096-byte
// pages from the RAM between the end of the kernel image and
// PHYSTOP, threaded through a free list.

use core::ptr;

use crate::memlayout::PHYSTOP;
use crate::riscv::{pg_round_up, PGSIZE};
use crate::spinlock::Spinlock;
use crate::string::memset;

extern "C" {
    // first address after kernel.
    // defined by kernel.ld.
    static mut end: u8;
}

struct Run {
    next: *mut Run,
}

pub struct KMem {
    lock: Spinlock,
    freelist: *mut Run,
}

pub static mut KMEM: KMem = KMem {
    lock: Spinlock::new("kmem"),
    freelist: ptr::null_mut(),
};

pub fn kinit() {
    unsafe {
        let pa_start = ptr::addr_of_mut!(end) as usize;
        KMEM.freerange(pa_start, PHYSTOP);
    }
}

impl KMem {
    fn freerange(&mut self, pa_start: usize, pa_end: usize) {
        let mut p = pg_round_up(pa_start);
        while p + PGSIZE <= pa_end {
            self.kfree(p as *mut u8);
            p += PGSIZE;
        }
    }

    /// Free the page of physical memory pointed at by pa,
    /// which normally should have been returned by a
    /// call to kalloc().  (The exception is when
    /// initializing the allocator; see kinit above.)
    pub fn kfree(&mut self, pa: *mut u8) {
        let addr = pa as usize;
        let image_end = unsafe { ptr::addr_of!(end) as usize };
        if addr % PGSIZE != 0 || addr < image_end || addr >= PHYSTOP {
            panic!("kfree");
        }

        // Fill with junk to catch dangling refs.
        memset(pa, 1, PGSIZE);

        let r = pa as *mut Run;

        self.lock.acquire();
        unsafe { (*r).next = self.freelist };
        self.freelist = r;
        self.lock.release();
    }

    /// Allocate one 4096-byte page of physical memory.
    /// Returns a pointer that the kernel can use.
    /// Returns null if the memory cannot be allocated.
    pub fn kalloc(&mut self) -> *mut u8 {
        self.lock.acquire();
        let r = self.freelist;
        if !r.is_null() {
            self.freelist = unsafe { (*r).next };
        }
        self.lock.release();

        if !r.is_null() {
            memset(r as *mut u8, 5, PGSIZE); // fill with junk
        }
        r as *mut u8
    }
}
