use core::mem;
use core::ptr;

use crate::memlayout::{KSTACK_PAGES, TRAMPOLINE, UART0_IRQ, VIRTIO0_IRQ};
use crate::plic::{plic_claim, plic_complete};
use crate::printf;
use crate::proc::{
    cpuid, exit, killed, mycpu, myproc, setkilled, wakeup, yield_proc, Procstate,
};
use crate::riscv::{
    intr_get, intr_off, intr_on, make_satp, r_satp, r_scause, r_sepc, r_sip, r_sstatus, r_stval,
    r_tp, w_sepc, w_sip, w_sstatus, w_stvec, PGSIZE, SSTATUS_SPIE, SSTATUS_SPP,
};
use crate::spinlock::Spinlock;
use crate::syscall::syscall::syscall;
use crate::uart::uartintr;
use crate::virtio::virtio_disk::virtio_disk_intr;
use crate::vm::vmfault;

pub static TICKS_LOCK: Spinlock = Spinlock::new("time");
pub static mut TICKS: u32 = 0;

extern "C" {
    // in kernelvec.S, calls kerneltrap().
    fn kernelvec();

    static trampoline: u8; // trampoline.S
    static uservec: u8;
    static userret: u8;
}

pub fn trapinit() {
    // TICKS_LOCK is statically initialized; nothing to do yet.
}

// set up to take exceptions and traps while in the kernel.
pub fn trapinithart() {
    w_stvec(kernelvec as usize);
}

//
// handle an interrupt, exception, or system call from user space.
// called from trampoline.S
//
extern "C" fn usertrap() {
    if r_sstatus() & SSTATUS_SPP != 0 {
        panic!("usertrap: not from user mode");
    }

    // send interrupts and exceptions to kerneltrap(),
    // since we're now in the kernel.
    w_stvec(kernelvec as usize);

    let p = myproc();

    // save user program counter.
    let tf = unsafe { &mut *p.trapframe };
    tf.epc = r_sepc() as u64;

    let mut which_dev = 0;
    let scause = r_scause();
    if scause == 8 {
        // system call

        if killed(p) {
            exit(-1);
        }

        // sepc points to the ecall instruction,
        // but we want to return to the next instruction.
        tf.epc += 4;

        // an interrupt will change sepc, scause, and sstatus,
        // so enable only now that we're done with those registers.
        intr_on();

        syscall();
    } else {
        which_dev = devintr();
        if which_dev == 0 {
            if scause == 13 || scause == 15 {
                // load/store fault, possibly on a lazily-allocated page.
                if vmfault(p.pagetable, r_stval(), scause == 13) == 0 {
                    setkilled(p);
                }
            } else {
                printf!("usertrap(): unexpected scause {:#x} pid={}\n", scause, p.pid);
                printf!("            sepc={:#x} stval={:#x}\n", r_sepc(), r_stval());
                setkilled(p);
            }
        }
    }

    if killed(p) {
        exit(-1);
    }

    // give up the CPU if this is a timer interrupt.
    if which_dev == 2 {
        yield_proc();
    }

    usertrapret();
}

//
// return to user space
//
pub fn usertrapret() {
    let p = myproc();

    // we're about to switch the destination of traps from
    // kerneltrap() to usertrap(), so turn off interrupts until
    // we're back in user space, where usertrap() is correct.
    intr_off();

    // send syscalls, interrupts, and exceptions to uservec in trampoline.S
    let trampoline_addr = unsafe { ptr::addr_of!(trampoline) as usize };
    let uservec_addr = unsafe { ptr::addr_of!(uservec) as usize };
    let trampoline_uservec = TRAMPOLINE + (uservec_addr - trampoline_addr);
    w_stvec(trampoline_uservec);

    // set up trapframe values that uservec will need when
    // the process next traps into the kernel.
    let tf = unsafe { &mut *p.trapframe };
    tf.kernel_satp = r_satp() as u64; // kernel page table
    tf.kernel_sp = (p.kstack + KSTACK_PAGES * PGSIZE) as u64; // process's kernel stack
    tf.kernel_trap = usertrap as usize as u64;
    tf.kernel_hartid = r_tp(); // hartid for cpuid()

    // set up the registers that trampoline.S's sret will use
    // to get to user space.

    // set S Previous Privilege mode to User.
    let mut x = r_sstatus();
    x &= !SSTATUS_SPP; // clear SPP to 0 for user mode
    x |= SSTATUS_SPIE; // enable interrupts in user mode
    w_sstatus(x);

    // set S Exception Program Counter to the saved user pc.
    w_sepc(tf.epc as usize);

    // tell trampoline.S the user page table to switch to.
    let satp = make_satp(p.pagetable as usize);

    // jump to userret in trampoline.S at the top of memory, which
    // switches to the user page table, restores user registers,
    // and switches to user mode with sret.
    let userret_addr = unsafe { ptr::addr_of!(userret) as usize };
    let trampoline_userret = TRAMPOLINE + (userret_addr - trampoline_addr);
    let userret_fn: extern "C" fn(usize) = unsafe { mem::transmute(trampoline_userret) };
    userret_fn(satp);
}

// interrupts and exceptions from kernel code go here via kernelvec,
// on whatever the current kernel stack is.
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    if sstatus & SSTATUS_SPP == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which_dev = devintr();
    if which_dev == 0 {
        // interrupt or trap from an unknown source
        printf!("scause={:#x} sepc={:#x} stval={:#x}\n", scause, sepc, r_stval());
        panic!("kerneltrap");
    }

    // give up the CPU if this is a timer interrupt.
    if which_dev == 2 && !mycpu().proc.is_null() && myproc().state == Procstate::Running {
        yield_proc();
    }

    // the yield() may have caused some traps to occur,
    // so restore trap registers for use by kernelvec.S's sepc instruction.
    w_sepc(sepc);
    w_sstatus(sstatus);
}

fn clockintr() {
    TICKS_LOCK.acquire();
    unsafe { TICKS += 1 };
    wakeup(unsafe { ptr::addr_of!(TICKS) } as usize);
    TICKS_LOCK.release();
}

// check if it's an external interrupt or software interrupt,
// and handle it.
// returns 2 if timer interrupt,
// 1 if other device,
// 0 if not recognized.
fn devintr() -> i32 {
    let scause = r_scause();

    if scause == 0x8000_0000_0000_0009 {
        // this is a supervisor external interrupt, via PLIC.

        // irq indicates which device interrupted.
        let irq = plic_claim();

        if irq == UART0_IRQ {
            uartintr();
        } else if irq == VIRTIO0_IRQ {
            virtio_disk_intr();
        } else if irq != 0 {
            printf!("unexpected interrupt irq={}\n", irq);
        }

        // the PLIC allows each device to raise at most one
        // interrupt at a time; tell the PLIC the device is
        // now allowed to interrupt again.
        if irq != 0 {
            plic_complete(irq);
        }

        1
    } else if scause == 0x8000_0000_0000_0001 {
        // software interrupt from a machine-mode timer interrupt,
        // forwarded by timervec in kernelvec.S.

        if cpuid() == 0 {
            clockintr();
        }

        // acknowledge the software interrupt by clearing
        // the SSIP bit in sip.
        w_sip(r_sip() & !2);

        2
    } else {
        0
    }
}
