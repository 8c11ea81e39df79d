use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::file::file::{fileclose, filedup};
use crate::file::{File, INode};
use crate::fs::fs::{fsinit, namei};
use crate::kalloc::KMEM;
use crate::log::{begin_op, end_op};
use crate::memlayout::{kstack, KSTACK_PAGES, TRAMPOLINE, TRAPFRAME};
use crate::param::{NCPU, NOFILE, NPROC, ROOTDEV};
use crate::printf;
use crate::riscv::{intr_get, intr_on, r_tp, wfi, PageTable, PteFlags, PGSIZE};
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::string::{memmove, safestrcpy};
use crate::trap::usertrapret;
use crate::vm::{
    copyin, copyout, kvmmap, mappages, uvmcopy, uvmcreate, uvmdealloc, uvmfirst, uvmfree,
    uvmunmap,
};

// Saved registers for kernel context switches.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,

    // callee-saved
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

impl Context {
    pub const fn zero() -> Self {
        Context {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

// Per-CPU state.
pub struct Cpu {
    pub proc: *mut Proc,  // The process running on this cpu, or null.
    pub context: Context, // swtch() here to enter scheduler().
    pub noff: i32,        // Depth of push_off() nesting.
    pub intena: bool,     // Were interrupts enabled before push_off()?
}

impl Cpu {
    const fn new() -> Self {
        Cpu {
            proc: ptr::null_mut(),
            context: Context::zero(),
            noff: 0,
            intena: false,
        }
    }
}

// per-process data for the trap handling code in trampoline.S.
// sits in a page by itself just under the trampoline page in the
// user page table. not specially mapped in the kernel page table.
// uservec in trampoline.S saves user registers in the trapframe,
// then initializes registers from the trapframe's
// kernel_sp, kernel_hartid, kernel_satp, and jumps to kernel_trap.
// usertrapret() and userret in trampoline.S set up
// the trapframe's kernel_*, restore user registers from the
// trapframe, switch to the user page table, and enter user space.
// the trapframe includes callee-saved user registers like s0-s11 because the
// return-to-user path via usertrapret() doesn't return through
// the entire kernel call stack.
#[repr(C)]
pub struct Trapframe {
    /*   0 */ pub kernel_satp: u64, // kernel page table
    /*   8 */ pub kernel_sp: u64, // top of process's kernel stack
    /*  16 */ pub kernel_trap: u64, // usertrap()
    /*  24 */ pub epc: u64, // saved user program counter
    /*  32 */ pub kernel_hartid: u64, // saved kernel tp
    /*  40 */ pub ra: u64,
    /*  48 */ pub sp: u64,
    /*  56 */ pub gp: u64,
    /*  64 */ pub tp: u64,
    /*  72 */ pub t0: u64,
    /*  80 */ pub t1: u64,
    /*  88 */ pub t2: u64,
    /*  96 */ pub s0: u64,
    /* 104 */ pub s1: u64,
    /* 112 */ pub a0: u64,
    /* 120 */ pub a1: u64,
    /* 128 */ pub a2: u64,
    /* 136 */ pub a3: u64,
    /* 144 */ pub a4: u64,
    /* 152 */ pub a5: u64,
    /* 160 */ pub a6: u64,
    /* 168 */ pub a7: u64,
    /* 176 */ pub s2: u64,
    /* 184 */ pub s3: u64,
    /* 192 */ pub s4: u64,
    /* 200 */ pub s5: u64,
    /* 208 */ pub s6: u64,
    /* 216 */ pub s7: u64,
    /* 224 */ pub s8: u64,
    /* 232 */ pub s9: u64,
    /* 240 */ pub s10: u64,
    /* 248 */ pub s11: u64,
    /* 256 */ pub t3: u64,
    /* 264 */ pub t4: u64,
    /* 272 */ pub t5: u64,
    /* 280 */ pub t6: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Procstate {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

// Per-process state
pub struct Proc {
    pub lock: Spinlock,

    // p->lock must be held when using these:
    pub state: Procstate, // Process state
    pub chan: usize,      // If non-zero, sleeping on chan
    pub killed: bool,     // Have we been killed?
    pub xstate: i32,      // Exit status to be returned to parent's wait
    pub pid: u32,         // Process ID

    // WAIT_LOCK must be held when using this:
    pub parent: *mut Proc, // Parent process

    // these are private to the process, so p->lock need not be held.
    pub kstack: usize,             // Virtual address of kernel stack
    pub sz: usize,                 // Size of process memory (bytes)
    pub pagetable: *mut PageTable, // User page table
    pub trapframe: *mut Trapframe, // data page for trampoline.S
    pub context: Context,          // swtch() here to run process
    pub ofile: [*mut File; NOFILE], // Open files
    pub cwd: *mut INode,           // Current directory
    pub name: [u8; 16],            // Process name (debugging)
}

impl Proc {
    const fn new() -> Self {
        Proc {
            lock: Spinlock::new("proc"),
            state: Procstate::Unused,
            chan: 0,
            killed: false,
            xstate: 0,
            pid: 0,
            parent: ptr::null_mut(),
            kstack: 0,
            sz: 0,
            pagetable: ptr::null_mut(),
            trapframe: ptr::null_mut(),
            context: Context::zero(),
            ofile: [ptr::null_mut(); NOFILE],
            cwd: ptr::null_mut(),
            name: [0; 16],
        }
    }
}

pub static mut CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];
pub static mut PROCS: [Proc; NPROC] = [const { Proc::new() }; NPROC];

static mut INITPROC: *mut Proc = ptr::null_mut();

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

// helps ensure that wakeups of wait()ing
// parents are not lost. helps obey the
// memory model when using p->parent.
// must be acquired before any p->lock.
pub static WAIT_LOCK: Spinlock = Spinlock::new("wait_lock");

extern "C" {
    static trampoline: u8; // trampoline.S

    // switch.S: save the current registers in old, load from new.
    fn swtch(old: *mut Context, new: *mut Context);
}

// Must be called with interrupts disabled,
// to prevent race with process being moved
// to a different CPU.
pub fn cpuid() -> usize {
    r_tp() as usize
}

// Return this CPU's cpu struct.
// Interrupts must be disabled.
pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut CPUS[cpuid()] }
}

// Return the current struct proc.
pub fn myproc() -> &'static mut Proc {
    push_off();
    let p = mycpu().proc;
    pop_off();
    if p.is_null() {
        panic!("myproc");
    }
    unsafe { &mut *p }
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

// Allocate pages for each process's kernel stack.
// Map them high in memory, each stack followed by an
// invalid guard page.
pub fn proc_mapstacks(kpgtbl: *mut PageTable) {
    for i in 0..NPROC {
        for j in 0..KSTACK_PAGES {
            let pa = unsafe { KMEM.kalloc() };
            if pa.is_null() {
                panic!("proc_mapstacks");
            }
            let va = kstack(i) + j * PGSIZE;
            kvmmap(kpgtbl, va, pa as usize, PGSIZE, PteFlags::R | PteFlags::W);
        }
    }
}

// initialize the proc table.
pub fn procinit() {
    for (i, p) in unsafe { PROCS.iter_mut().enumerate() } {
        p.kstack = kstack(i);
    }
}

// Look in the process table for an Unused proc.
// If found, initialize state required to run in the kernel,
// and return with p->lock held.
// If there are no free procs, or a memory allocation fails, return None.
fn allocproc() -> Option<&'static mut Proc> {
    let mut found: Option<&'static mut Proc> = None;
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.state == Procstate::Unused {
            found = Some(p);
            break;
        }
        p.lock.release();
    }

    let p = found?;
    p.pid = allocpid();
    p.state = Procstate::Used;

    // Allocate a trapframe page.
    p.trapframe = unsafe { KMEM.kalloc() } as *mut Trapframe;
    if p.trapframe.is_null() {
        freeproc(p);
        p.lock.release();
        return None;
    }

    // An empty user page table.
    p.pagetable = proc_pagetable(p);
    if p.pagetable.is_null() {
        freeproc(p);
        p.lock.release();
        return None;
    }

    // Set up new context to start executing at forkret,
    // which returns to user space.
    p.context = Context::zero();
    p.context.ra = forkret as usize as u64;
    p.context.sp = (p.kstack + KSTACK_PAGES * PGSIZE) as u64;

    Some(p)
}

// free a proc structure and the data hanging from it,
// including user pages.
// p->lock must be held.
fn freeproc(p: &mut Proc) {
    if !p.trapframe.is_null() {
        unsafe { KMEM.kfree(p.trapframe as *mut u8) };
    }
    p.trapframe = ptr::null_mut();

    if !p.pagetable.is_null() {
        proc_freepagetable(p.pagetable, p.sz);
    }
    p.pagetable = ptr::null_mut();

    p.sz = 0;
    p.pid = 0;
    p.parent = ptr::null_mut();
    p.name[0] = 0;
    p.chan = 0;
    p.killed = false;
    p.xstate = 0;
    p.state = Procstate::Unused;
}

// Create a user page table for a given process, with no user memory,
// but with trampoline and trapframe pages.
pub fn proc_pagetable(p: &Proc) -> *mut PageTable {
    // An empty page table.
    let pagetable = uvmcreate();
    if pagetable.is_null() {
        return ptr::null_mut();
    }

    // map the trampoline code (for system call return)
    // at the highest user virtual address.
    // only the supervisor uses it, on the way
    // to/from user space, so not PteFlags::U.
    let trampoline_addr = unsafe { ptr::addr_of!(trampoline) as usize };
    if mappages(
        pagetable,
        TRAMPOLINE,
        trampoline_addr,
        PGSIZE,
        PteFlags::R | PteFlags::X,
    ) < 0
    {
        uvmfree(pagetable, 0);
        return ptr::null_mut();
    }

    // map the trapframe page just below the trampoline page, for
    // trampoline.S.
    if mappages(
        pagetable,
        TRAPFRAME,
        p.trapframe as usize,
        PGSIZE,
        PteFlags::R | PteFlags::W,
    ) < 0
    {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return ptr::null_mut();
    }

    pagetable
}

// Free a process's page table, and free the
// physical memory it refers to.
pub fn proc_freepagetable(pagetable: *mut PageTable, sz: usize) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    uvmunmap(pagetable, TRAPFRAME, 1, false);
    uvmfree(pagetable, sz);
}

// a user program that calls exec("/init")
// assembled from user/initcode.S
// od -t xC initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35,
    0x02, 0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, 0x93, 0x08, 0x20, 0x00, 0x73, 0x00,
    0x00, 0x00, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Set up first user process.
pub fn userinit() {
    let p = allocproc().expect("userinit: no procs");
    unsafe { INITPROC = p as *mut Proc };

    // allocate one user page and copy initcode's instructions
    // and data into it.
    uvmfirst(p.pagetable, INITCODE.as_ptr(), INITCODE.len());
    p.sz = PGSIZE;

    // prepare for the very first "return" from kernel to user.
    let tf = unsafe { &mut *p.trapframe };
    tf.epc = 0; // user program counter
    tf.sp = PGSIZE as u64; // user stack pointer

    safestrcpy(&mut p.name, b"initcode");
    p.cwd = namei(b"/").map_or(ptr::null_mut(), |ip| ip as *mut INode);

    p.state = Procstate::Runnable;

    p.lock.release();
}

// Grow or shrink user memory by n bytes.
// Growth is lazy: raise p->sz and let vmfault() allocate
// frames when the process first touches the new pages.
// Return 0 on success, -1 on failure.
pub fn growproc(n: isize) -> i32 {
    let p = myproc();
    let mut sz = p.sz;

    if n > 0 {
        if sz + n as usize >= TRAPFRAME {
            return -1;
        }
        sz += n as usize;
    } else if n < 0 {
        sz = uvmdealloc(p.pagetable, sz, sz.wrapping_add_signed(n));
    }
    p.sz = sz;
    0
}

// Create a new process, copying the parent.
// Sets up child kernel stack to return as if from fork() system call.
pub fn fork() -> i64 {
    let p = myproc();

    // Allocate process.
    let np = match allocproc() {
        Some(np) => np,
        None => return -1,
    };

    // Copy user memory from parent to child.
    if uvmcopy(p.pagetable, np.pagetable, p.sz) < 0 {
        freeproc(np);
        np.lock.release();
        return -1;
    }
    np.sz = p.sz;

    // copy saved user registers.
    memmove(
        np.trapframe as *mut u8,
        p.trapframe as *const u8,
        core::mem::size_of::<Trapframe>(),
    );

    // Cause fork to return 0 in the child.
    unsafe { (*np.trapframe).a0 = 0 };

    // increment reference counts on open file descriptors.
    for fd in 0..NOFILE {
        if !p.ofile[fd].is_null() {
            filedup(p.ofile[fd]);
            np.ofile[fd] = p.ofile[fd];
        }
    }
    if !p.cwd.is_null() {
        unsafe { (*p.cwd).idup() };
        np.cwd = p.cwd;
    }

    let name = p.name;
    safestrcpy(&mut np.name, &name);

    let pid = np.pid;

    np.lock.release();

    WAIT_LOCK.acquire();
    np.parent = p as *mut Proc;
    WAIT_LOCK.release();

    np.lock.acquire();
    np.state = Procstate::Runnable;
    np.lock.release();

    pid as i64
}

// Pass p's abandoned children to init.
// Caller must hold WAIT_LOCK.
fn reparent(p: *mut Proc) {
    for i in 0..NPROC {
        let pp = unsafe { &mut PROCS[i] };
        if pp.parent == p {
            pp.parent = unsafe { INITPROC };
            wakeup(unsafe { INITPROC } as usize);
        }
    }
}

// Exit the current process.  Does not return.
// An exited process remains in the zombie state
// until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let p = myproc();

    if p as *mut Proc == unsafe { INITPROC } {
        panic!("init exiting");
    }

    // Close all open files.
    for fd in 0..NOFILE {
        if !p.ofile[fd].is_null() {
            fileclose(p.ofile[fd]);
            p.ofile[fd] = ptr::null_mut();
        }
    }

    begin_op();
    if !p.cwd.is_null() {
        unsafe { (*p.cwd).iput() };
    }
    end_op();
    p.cwd = ptr::null_mut();

    WAIT_LOCK.acquire();

    // Give any children to init.
    reparent(p as *mut Proc);

    // Parent might be sleeping in wait().
    wakeup(p.parent as usize);

    p.lock.acquire();
    p.xstate = status;
    p.state = Procstate::Zombie;

    WAIT_LOCK.release();

    // Jump into the scheduler, never to return.
    sched();
    panic!("zombie exit");
}

// Wait for a child process to exit and return its pid.
// Return -1 if this process has no children.
// addr is the user address to copy the exit status to, or 0 to ignore it.
pub fn wait(addr: usize) -> i64 {
    let p = myproc();

    WAIT_LOCK.acquire();

    loop {
        // Scan through table looking for exited children.
        let mut havekids = false;
        for i in 0..NPROC {
            let pp = unsafe { &mut PROCS[i] };
            if pp.parent == p as *mut Proc {
                // make sure the child isn't still in exit() or swtch().
                pp.lock.acquire();

                havekids = true;
                if pp.state == Procstate::Zombie {
                    // Found one.
                    let pid = pp.pid;
                    if addr != 0
                        && copyout(
                            p.pagetable,
                            addr,
                            &pp.xstate as *const i32 as *const u8,
                            core::mem::size_of::<i32>(),
                        ) < 0
                    {
                        pp.lock.release();
                        WAIT_LOCK.release();
                        return -1;
                    }
                    freeproc(pp);
                    pp.lock.release();
                    WAIT_LOCK.release();
                    return pid as i64;
                }
                pp.lock.release();
            }
        }

        // No point waiting if we don't have any children.
        if !havekids || killed(p) {
            WAIT_LOCK.release();
            return -1;
        }

        // Wait for a child to exit.
        sleep(p as *const Proc as usize, &WAIT_LOCK); //DOC: wait-sleep
    }
}

// Per-CPU process scheduler.
// Each CPU calls scheduler() after setting itself up.
// Scheduler never returns.  It loops, doing:
//  - choose a process to run.
//  - swtch to start running that process.
//  - eventually that process transfers control
//    via swtch back to the scheduler.
pub fn scheduler() -> ! {
    let c = mycpu();
    c.proc = ptr::null_mut();

    loop {
        // The most recent process to run may have had interrupts
        // turned off; enable them to avoid a deadlock if all
        // processes are waiting. Then turn them back off
        // to avoid a possible race between an interrupt
        // and wfi.
        intr_on();

        let mut found = false;
        for i in 0..NPROC {
            let p = unsafe { &mut PROCS[i] };
            p.lock.acquire();
            if p.state == Procstate::Runnable {
                // Switch to chosen process.  It is the process's job
                // to release its lock and then reacquire it
                // before jumping back to us.
                p.state = Procstate::Running;
                c.proc = p as *mut Proc;
                unsafe { swtch(&mut c.context, &mut p.context) };

                // Process is done running for now.
                // It should have changed its p->state before coming back.
                c.proc = ptr::null_mut();
                found = true;
            }
            p.lock.release();
        }

        if !found {
            // nothing to run; stop running on this core until an interrupt.
            intr_on();
            wfi();
        }
    }
}

// Switch to scheduler.  Must hold only p->lock
// and have changed proc->state. Saves and restores
// intena because intena is a property of this
// kernel thread, not this CPU. It should
// be proc->intena and proc->noff, but that would
// break in the few places where a lock is held but
// there's no process.
pub fn sched() {
    let p = myproc();

    if !p.lock.holding() {
        panic!("sched p->lock");
    }
    if mycpu().noff != 1 {
        panic!("sched locks");
    }
    if p.state == Procstate::Running {
        panic!("sched running");
    }
    if intr_get() {
        panic!("sched interruptible");
    }

    let intena = mycpu().intena;
    unsafe { swtch(&mut p.context, &mut mycpu().context) };
    mycpu().intena = intena;
}

// Give up the CPU for one scheduling round.
pub fn yield_proc() {
    let p = myproc();
    p.lock.acquire();
    p.state = Procstate::Runnable;
    sched();
    p.lock.release();
}

// A fork child's very first scheduling by scheduler()
// will swtch to forkret.
extern "C" fn forkret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding p->lock from scheduler.
    myproc().lock.release();

    if FIRST.load(Ordering::Acquire) {
        // File system initialization must be run in the context of a
        // regular process (e.g., because it calls sleep), and thus cannot
        // be run from main().
        fsinit(ROOTDEV);
        FIRST.store(false, Ordering::Release);
    }

    usertrapret();
}

// Atomically release lock and sleep on chan.
// Reacquires lock when awakened.
pub fn sleep(chan: usize, lk: &Spinlock) {
    let p = myproc();

    // Must acquire p->lock in order to
    // change p->state and then call sched.
    // Once we hold p->lock, we can be
    // guaranteed that we won't miss any wakeup
    // (wakeup locks p->lock),
    // so it's okay to release lk.

    p.lock.acquire(); //DOC: sleeplock1
    lk.release();

    // Go to sleep.
    p.chan = chan;
    p.state = Procstate::Sleeping;

    sched();

    // Tidy up.
    p.chan = 0;

    // Reacquire original lock.
    p.lock.release();
    lk.acquire();
}

// Wake up all processes sleeping on chan.
// Must be called without any p->lock.
pub fn wakeup(chan: usize) {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        if p as *mut Proc != mycpu().proc {
            p.lock.acquire();
            if p.state == Procstate::Sleeping && p.chan == chan {
                p.state = Procstate::Runnable;
            }
            p.lock.release();
        }
    }
}

// Kill the process with the given pid.
// The victim won't exit until it tries to return
// to user space (see usertrap()).
pub fn kill(pid: u32) -> i32 {
    for i in 0..NPROC {
        let p = unsafe { &mut PROCS[i] };
        p.lock.acquire();
        if p.pid == pid && p.state != Procstate::Unused {
            p.killed = true;
            if p.state == Procstate::Sleeping {
                // Wake process from sleep().
                p.state = Procstate::Runnable;
            }
            p.lock.release();
            return 0;
        }
        p.lock.release();
    }
    -1
}

pub fn setkilled(p: &mut Proc) {
    p.lock.acquire();
    p.killed = true;
    p.lock.release();
}

pub fn killed(p: &mut Proc) -> bool {
    p.lock.acquire();
    let k = p.killed;
    p.lock.release();
    k
}

// Copy to either a user address, or kernel address,
// depending on usr_dst.
// Returns 0 on success, -1 on error.
pub fn either_copyout(user_dst: bool, dst: usize, src: *const u8, len: usize) -> i32 {
    let p = myproc();
    if user_dst {
        copyout(p.pagetable, dst, src, len)
    } else {
        memmove(dst as *mut u8, src, len);
        0
    }
}

// Copy from either a user address, or kernel address,
// depending on usr_src.
// Returns 0 on success, -1 on error.
pub fn either_copyin(dst: *mut u8, user_src: bool, src: usize, len: usize) -> i32 {
    let p = myproc();
    if user_src {
        copyin(p.pagetable, dst, src, len)
    } else {
        memmove(dst, src as *const u8, len);
        0
    }
}

// Print a process listing to console.  For debugging.
// Runs when user types ^P on console.
// No lock to avoid wedging a stuck machine further.
pub fn procdump() {
    printf!("\n");
    for i in 0..NPROC {
        let p = unsafe { &PROCS[i] };
        if p.state == Procstate::Unused {
            continue;
        }
        let state = match p.state {
            Procstate::Unused => "unused",
            Procstate::Used => "used",
            Procstate::Sleeping => "sleep ",
            Procstate::Runnable => "runble",
            Procstate::Running => "run   ",
            Procstate::Zombie => "zombie",
        };
        let len = p.name.iter().position(|&c| c == 0).unwrap_or(p.name.len());
        let name = core::str::from_utf8(&p.name[..len]).unwrap_or("?");
        printf!("{} {} {}\n", p.pid, state, name);
    }
}
