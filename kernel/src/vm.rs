use core::ptr;

use crate::kalloc::KMEM;
use crate::memlayout::{KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, UART0, VIRTIO0};
use crate::proc::{myproc, proc_mapstacks};
use crate::riscv::{
    make_satp, pg_round_down, pg_round_up, px, sfence_vma, w_satp, PageTable, Pte, PteFlags,
    MAXVA, PGSIZE,
};
use crate::string::{memmove, memset};

// the kernel's page table.
pub static mut KERNEL_PAGETABLE: *mut PageTable = ptr::null_mut();

extern "C" {
    static etext: u8; // kernel.ld sets this to end of kernel code.
    static trampoline: u8; // trampoline.S
}

// Make a direct-map page table for the kernel.
fn kvmmake() -> *mut PageTable {
    let kpgtbl = uvmcreate();
    if kpgtbl.is_null() {
        panic!("kvmmake: out of memory");
    }

    let rw = PteFlags::R | PteFlags::W;
    let rx = PteFlags::R | PteFlags::X;

    // uart registers
    kvmmap(kpgtbl, UART0, UART0, PGSIZE, rw);

    // virtio mmio disk interface
    kvmmap(kpgtbl, VIRTIO0, VIRTIO0, PGSIZE, rw);

    // PLIC
    kvmmap(kpgtbl, PLIC, PLIC, 0x40_0000, rw);

    // map kernel text executable and read-only.
    let etext_addr = unsafe { ptr::addr_of!(etext) as usize };
    kvmmap(kpgtbl, KERNBASE, KERNBASE, etext_addr - KERNBASE, rx);

    // map kernel data and the physical RAM we'll make use of.
    kvmmap(kpgtbl, etext_addr, etext_addr, PHYSTOP - etext_addr, rw);

    // map the trampoline for trap entry/exit to
    // the highest virtual address in the kernel.
    let trampoline_addr = unsafe { ptr::addr_of!(trampoline) as usize };
    kvmmap(kpgtbl, TRAMPOLINE, trampoline_addr, PGSIZE, rx);

    // allocate and map a kernel stack for each process.
    proc_mapstacks(kpgtbl);

    kpgtbl
}

// Initialize the one kernel_pagetable.
pub fn kvminit() {
    unsafe {
        KERNEL_PAGETABLE = kvmmake();
    }
}

// Switch h/w page table register to the kernel's page table,
// and enable paging.
pub fn kvminithart() {
    // wait for any previous writes to the page table memory to finish.
    sfence_vma();

    w_satp(make_satp(unsafe { KERNEL_PAGETABLE } as usize));

    // flush stale entries from the TLB.
    sfence_vma();
}

// Return the address of the PTE in page table pagetable
// that corresponds to virtual address va.  If alloc,
// create any required page-table pages.
//
// The risc-v Sv39 scheme has three levels of page-table
// pages. A page-table page contains 512 64-bit PTEs.
// A 64-bit virtual address is split into five fields:
//   39..63 -- must be zero.
//   30..38 -- 9 bits of level-2 index.
//   21..29 -- 9 bits of level-1 index.
//   12..20 -- 9 bits of level-0 index.
//    0..11 -- 12 bits of byte offset within the page.
fn walk(pagetable: *mut PageTable, va: usize, alloc: bool) -> *mut Pte {
    if va >= MAXVA {
        panic!("walk");
    }

    let mut pagetable = pagetable;
    for level in [2, 1] {
        let pte = unsafe { &mut (*pagetable).0[px(level, va)] };
        if pte.is_valid() {
            pagetable = pte.pa() as *mut PageTable;
        } else {
            if !alloc {
                return ptr::null_mut();
            }
            let next = unsafe { KMEM.kalloc() } as *mut PageTable;
            if next.is_null() {
                return ptr::null_mut();
            }
            memset(next as *mut u8, 0, PGSIZE);
            *pte = Pte::new(next as usize, PteFlags::V);
            pagetable = next;
        }
    }

    unsafe { &mut (*pagetable).0[px(0, va)] }
}

// Look up a virtual address, return the physical address,
// or 0 if not mapped.
// Can only be used to look up user pages.
pub fn walkaddr(pagetable: *mut PageTable, va: usize) -> usize {
    if va >= MAXVA {
        return 0;
    }

    let pte = walk(pagetable, va, false);
    if pte.is_null() {
        return 0;
    }
    let pte = unsafe { *pte };
    if !pte.is_valid() || !pte.flags().contains(PteFlags::U) {
        return 0;
    }
    pte.pa()
}

// add a mapping to the kernel page table.
// only used when booting.
// does not flush TLB or enable paging.
pub fn kvmmap(kpgtbl: *mut PageTable, va: usize, pa: usize, sz: usize, perm: PteFlags) {
    if mappages(kpgtbl, va, pa, sz, perm) != 0 {
        panic!("kvmmap");
    }
}

// Create PTEs for virtual addresses starting at va that refer to
// physical addresses starting at pa.
// va and size MUST be page-aligned.
// Returns 0 on success, -1 if walk() couldn't
// allocate a needed page-table page.
pub fn mappages(pagetable: *mut PageTable, va: usize, pa: usize, size: usize, perm: PteFlags) -> i32 {
    if va % PGSIZE != 0 {
        panic!("mappages: va not aligned");
    }
    if size % PGSIZE != 0 {
        panic!("mappages: size not aligned");
    }
    if size == 0 {
        panic!("mappages: size");
    }

    let mut a = va;
    let mut pa = pa;
    let last = va + size - PGSIZE;
    loop {
        let pte = walk(pagetable, a, true);
        if pte.is_null() {
            return -1;
        }
        unsafe {
            if (*pte).is_valid() {
                panic!("mappages: remap");
            }
            *pte = Pte::new(pa, perm | PteFlags::V);
        }
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    0
}

// Remove npages of mappings starting from va. va must be
// page-aligned. With lazy allocation in play a page in the range
// may never have been touched, so missing mappings are skipped.
// Optionally free the physical memory.
pub fn uvmunmap(pagetable: *mut PageTable, va: usize, npages: usize, do_free: bool) {
    if va % PGSIZE != 0 {
        panic!("uvmunmap: not aligned");
    }

    let mut a = va;
    while a < va + npages * PGSIZE {
        let pte = walk(pagetable, a, false);
        if !pte.is_null() {
            let entry = unsafe { *pte };
            if entry.is_valid() {
                if !entry.is_leaf() {
                    panic!("uvmunmap: not a leaf");
                }
                if do_free {
                    unsafe { KMEM.kfree(entry.pa() as *mut u8) };
                }
                unsafe { *pte = Pte::invalid() };
            }
        }
        a += PGSIZE;
    }
}

// create an empty user page table.
// returns null if out of memory.
pub fn uvmcreate() -> *mut PageTable {
    let pagetable = unsafe { KMEM.kalloc() } as *mut PageTable;
    if pagetable.is_null() {
        return ptr::null_mut();
    }
    memset(pagetable as *mut u8, 0, PGSIZE);
    pagetable
}

// Load the user initcode into address 0 of pagetable,
// for the very first process.
// sz must be less than a page.
pub fn uvmfirst(pagetable: *mut PageTable, src: *const u8, sz: usize) {
    if sz >= PGSIZE {
        panic!("uvmfirst: more than a page");
    }

    let mem = unsafe { KMEM.kalloc() };
    if mem.is_null() {
        panic!("uvmfirst: out of memory");
    }
    memset(mem, 0, PGSIZE);
    mappages(
        pagetable,
        0,
        mem as usize,
        PGSIZE,
        PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
    );
    memmove(mem, src, sz);
}

// Allocate PTEs and physical memory to grow process from oldsz to
// newsz, which need not be page aligned.  Returns new size or 0 on error.
pub fn uvmalloc(pagetable: *mut PageTable, oldsz: usize, newsz: usize, xperm: PteFlags) -> usize {
    if newsz < oldsz {
        return oldsz;
    }

    let oldsz = pg_round_up(oldsz);
    let mut a = oldsz;
    while a < newsz {
        let mem = unsafe { KMEM.kalloc() };
        if mem.is_null() {
            uvmdealloc(pagetable, a, oldsz);
            return 0;
        }
        memset(mem, 0, PGSIZE);
        if mappages(
            pagetable,
            a,
            mem as usize,
            PGSIZE,
            PteFlags::R | PteFlags::U | xperm,
        ) != 0
        {
            unsafe { KMEM.kfree(mem) };
            uvmdealloc(pagetable, a, oldsz);
            return 0;
        }
        a += PGSIZE;
    }
    newsz
}

// Deallocate user pages to bring the process size from oldsz to
// newsz.  oldsz and newsz need not be page-aligned, nor does newsz
// need to be less than oldsz.  oldsz can be larger than the actual
// process size.  Returns the new process size.
pub fn uvmdealloc(pagetable: *mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    if pg_round_up(newsz) < pg_round_up(oldsz) {
        let npages = (pg_round_up(oldsz) - pg_round_up(newsz)) / PGSIZE;
        uvmunmap(pagetable, pg_round_up(newsz), npages, true);
    }

    newsz
}

// Recursively free page-table pages.
// All leaf mappings must already have been removed.
fn freewalk(pagetable: *mut PageTable) {
    // there are 2^9 = 512 PTEs in a page table.
    for i in 0..512 {
        let pte = unsafe { (*pagetable).0[i] };
        if pte.is_valid() && !pte.is_leaf() {
            // this PTE points to a lower-level page table.
            freewalk(pte.pa() as *mut PageTable);
            unsafe { (*pagetable).0[i] = Pte::invalid() };
        } else if pte.is_valid() {
            panic!("freewalk: leaf");
        }
    }
    unsafe { KMEM.kfree(pagetable as *mut u8) };
}

// Free user memory pages,
// then free page-table pages.
pub fn uvmfree(pagetable: *mut PageTable, sz: usize) {
    if sz > 0 {
        uvmunmap(pagetable, 0, pg_round_up(sz) / PGSIZE, true);
    }
    freewalk(pagetable);
}

// Given a parent process's page table, copy
// its memory into a child's page table.
// Copies both the page table and the
// physical memory. Pages the parent never touched
// (lazily allocated, still unmapped) are skipped.
// returns 0 on success, -1 on failure.
// frees any allocated pages on failure.
pub fn uvmcopy(old: *mut PageTable, new: *mut PageTable, sz: usize) -> i32 {
    let mut i = 0;
    while i < sz {
        let pte = walk(old, i, false);
        if !pte.is_null() {
            let entry = unsafe { *pte };
            if entry.is_valid() {
                if !entry.is_leaf() {
                    panic!("uvmcopy: not a leaf");
                }
                let mem = unsafe { KMEM.kalloc() };
                if mem.is_null() {
                    uvmunmap(new, 0, i / PGSIZE, true);
                    return -1;
                }
                memmove(mem, entry.pa() as *const u8, PGSIZE);
                if mappages(new, i, mem as usize, PGSIZE, entry.flags() & !PteFlags::V) != 0 {
                    unsafe { KMEM.kfree(mem) };
                    uvmunmap(new, 0, i / PGSIZE, true);
                    return -1;
                }
            }
        }
        i += PGSIZE;
    }
    0
}

// mark a PTE invalid for user access.
// used by exec for the user stack guard page.
pub fn uvmclear(pagetable: *mut PageTable, va: usize) {
    let pte = walk(pagetable, va, false);
    if pte.is_null() {
        panic!("uvmclear");
    }
    unsafe {
        *pte = Pte((*pte).0 & !PteFlags::U.bits());
    }
}

// allocate and map user memory if the process is touching a page
// that sbrk() grew into but that has no frame yet.
// returns 0 if va is invalid, already mapped, or out of physical
// memory, and the new physical address on success.
pub fn vmfault(pagetable: *mut PageTable, va: usize, _read: bool) -> usize {
    let p = myproc();

    if va >= p.sz {
        return 0;
    }
    let va = pg_round_down(va);
    if ismapped(pagetable, va) {
        return 0;
    }

    let mem = unsafe { KMEM.kalloc() };
    if mem.is_null() {
        return 0;
    }
    memset(mem, 0, PGSIZE);
    if mappages(
        pagetable,
        va,
        mem as usize,
        PGSIZE,
        PteFlags::R | PteFlags::W | PteFlags::U,
    ) != 0
    {
        unsafe { KMEM.kfree(mem) };
        return 0;
    }
    mem as usize
}

pub fn ismapped(pagetable: *mut PageTable, va: usize) -> bool {
    let pte = walk(pagetable, va, false);
    if pte.is_null() {
        return false;
    }
    unsafe { (*pte).is_valid() }
}

// Copy from kernel to user.
// Copy len bytes from src to virtual address dstva in a given page table.
// Fills unmapped but in-range pages on demand.
// Return 0 on success, -1 on error.
pub fn copyout(pagetable: *mut PageTable, dstva: usize, src: *const u8, len: usize) -> i32 {
    let mut dstva = dstva;
    let mut src = src;
    let mut len = len;

    while len > 0 {
        let va0 = pg_round_down(dstva);
        if va0 >= MAXVA {
            return -1;
        }
        let mut pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            pa0 = vmfault(pagetable, va0, false);
            if pa0 == 0 {
                return -1;
            }
        }
        let n = core::cmp::min(PGSIZE - (dstva - va0), len);
        memmove((pa0 + (dstva - va0)) as *mut u8, src, n);

        len -= n;
        src = unsafe { src.add(n) };
        dstva = va0 + PGSIZE;
    }
    0
}

// Copy from user to kernel.
// Copy len bytes to dst from virtual address srcva in a given page table.
// Return 0 on success, -1 on error.
pub fn copyin(pagetable: *mut PageTable, dst: *mut u8, srcva: usize, len: usize) -> i32 {
    let mut dst = dst;
    let mut srcva = srcva;
    let mut len = len;

    while len > 0 {
        let va0 = pg_round_down(srcva);
        let mut pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            pa0 = vmfault(pagetable, va0, true);
            if pa0 == 0 {
                return -1;
            }
        }
        let n = core::cmp::min(PGSIZE - (srcva - va0), len);
        memmove(dst, (pa0 + (srcva - va0)) as *const u8, n);

        len -= n;
        dst = unsafe { dst.add(n) };
        srcva = va0 + PGSIZE;
    }
    0
}

// Copy a null-terminated string from user to kernel.
// Copy bytes to dst from virtual address srcva in a given page table,
// until a '\0', or max.
// Return 0 on success, -1 on error.
pub fn copyinstr(pagetable: *mut PageTable, dst: *mut u8, srcva: usize, max: usize) -> i32 {
    let mut dst = dst;
    let mut srcva = srcva;
    let mut max = max;
    let mut got_null = false;

    while !got_null && max > 0 {
        let va0 = pg_round_down(srcva);
        let pa0 = walkaddr(pagetable, va0);
        if pa0 == 0 {
            return -1;
        }

        let mut n = core::cmp::min(PGSIZE - (srcva - va0), max);
        let mut p = (pa0 + (srcva - va0)) as *const u8;
        while n > 0 {
            unsafe {
                if p.read() == 0 {
                    dst.write(0);
                    got_null = true;
                    break;
                }
                dst.write(p.read());
                p = p.add(1);
                dst = dst.add(1);
            }
            n -= 1;
            max -= 1;
        }

        srcva = va0 + PGSIZE;
    }

    if got_null {
        0
    } else {
        -1
    }
}
