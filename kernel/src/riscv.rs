use bitflags::bitflags;
use core::arch::asm;

pub fn r_mhartid() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, mhartid", out(reg) x) }
    x
}

// Machine Status Register, mstatus
pub const MSTATUS_MPP_MASK: u64 = 3 << 11; // previous mode.
pub const MSTATUS_MPP_S: u64 = 1 << 11;
pub const MSTATUS_MIE: u64 = 1 << 3; // machine-mode interrupt enable.

pub fn r_mstatus() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, mstatus", out(reg) x) }
    x
}

pub fn w_mstatus(x: u64) {
    unsafe { asm!("csrw mstatus, {}", in(reg) x) }
}

// machine exception program counter, holds the
// instruction address to which a return from
// exception will go.
pub fn w_mepc(x: usize) {
    unsafe { asm!("csrw mepc, {}", in(reg) x) }
}

// Supervisor Status Register, sstatus
pub const SSTATUS_SPP: u64 = 1 << 8; // Previous mode, 1=Supervisor, 0=User
pub const SSTATUS_SPIE: u64 = 1 << 5; // Supervisor Previous Interrupt Enable
pub const SSTATUS_SIE: u64 = 1 << 1; // Supervisor Interrupt Enable

pub fn r_sstatus() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, sstatus", out(reg) x) }
    x
}

pub fn w_sstatus(x: u64) {
    unsafe { asm!("csrw sstatus, {}", in(reg) x) }
}

// Supervisor Interrupt Pending
pub fn r_sip() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, sip", out(reg) x) }
    x
}

pub fn w_sip(x: u64) {
    unsafe { asm!("csrw sip, {}", in(reg) x) }
}

// Supervisor Interrupt Enable
pub const SIE_SEIE: u64 = 1 << 9; // external
pub const SIE_STIE: u64 = 1 << 5; // timer
pub const SIE_SSIE: u64 = 1 << 1; // software

pub fn r_sie() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, sie", out(reg) x) }
    x
}

pub fn w_sie(x: u64) {
    unsafe { asm!("csrw sie, {}", in(reg) x) }
}

// Machine-mode Interrupt Enable
pub const MIE_MTIE: u64 = 1 << 7; // timer

pub fn r_mie() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, mie", out(reg) x) }
    x
}

pub fn w_mie(x: u64) {
    unsafe { asm!("csrw mie, {}", in(reg) x) }
}

// supervisor exception program counter, holds the
// instruction address to which a return from
// exception will go.
pub fn r_sepc() -> usize {
    let x: usize;
    unsafe { asm!("csrr {}, sepc", out(reg) x) }
    x
}

pub fn w_sepc(x: usize) {
    unsafe { asm!("csrw sepc, {}", in(reg) x) }
}

// Machine Exception Delegation
pub fn w_medeleg(x: u64) {
    unsafe { asm!("csrw medeleg, {}", in(reg) x) }
}

// Machine Interrupt Delegation
pub fn w_mideleg(x: u64) {
    unsafe { asm!("csrw mideleg, {}", in(reg) x) }
}

// Supervisor Trap-Vector Base Address
// low two bits are mode.
pub fn w_stvec(x: usize) {
    unsafe { asm!("csrw stvec, {}", in(reg) x) }
}

// Machine-mode interrupt vector
pub fn w_mtvec(x: usize) {
    unsafe { asm!("csrw mtvec, {}", in(reg) x) }
}

// Physical Memory Protection
pub fn w_pmpcfg0(x: u64) {
    unsafe { asm!("csrw pmpcfg0, {}", in(reg) x) }
}

pub fn w_pmpaddr0(x: u64) {
    unsafe { asm!("csrw pmpaddr0, {}", in(reg) x) }
}

// supervisor address translation and protection;
// holds the address of the page table.
pub fn r_satp() -> usize {
    let x: usize;
    unsafe { asm!("csrr {}, satp", out(reg) x) }
    x
}

pub fn w_satp(x: usize) {
    unsafe { asm!("csrw satp, {}", in(reg) x) }
}

pub fn w_mscratch(x: usize) {
    unsafe { asm!("csrw mscratch, {}", in(reg) x) }
}

// Supervisor Trap Cause
pub fn r_scause() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, scause", out(reg) x) }
    x
}

// Supervisor Trap Value
pub fn r_stval() -> usize {
    let x: usize;
    unsafe { asm!("csrr {}, stval", out(reg) x) }
    x
}

// enable device interrupts
pub fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

// disable device interrupts
pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

// are device interrupts enabled?
pub fn intr_get() -> bool {
    (r_sstatus() & SSTATUS_SIE) != 0
}

// read and write tp, the thread pointer, which holds
// this core's hartid (core number), the index into CPUS[].
pub fn r_tp() -> u64 {
    let x: u64;
    unsafe { asm!("mv {}, tp", out(reg) x) }
    x
}

pub fn w_tp(x: u64) {
    unsafe { asm!("mv tp, {}", in(reg) x) }
}

// flush the TLB.
pub fn sfence_vma() {
    // the zero, zero means flush all TLB entries.
    unsafe { asm!("sfence.vma zero, zero") }
}

pub fn wfi() {
    unsafe { asm!("wfi") }
}

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

pub const fn pg_round_up(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pg_round_down(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Leaf permission / state bits of an Sv39 page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const V = 1 << 0; // valid
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4; // user can access
    }
}

/// One Sv39 page-table entry: a 44-bit physical page number
/// over a 10-bit flag field.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(pub usize);

impl Pte {
    pub const fn new(pa: usize, flags: PteFlags) -> Self {
        Pte(((pa >> 12) << 10) | flags.bits())
    }

    pub const fn invalid() -> Self {
        Pte(0)
    }

    pub fn pa(self) -> usize {
        (self.0 >> 10) << 12
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0x3FF)
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid entry with none of R/W/X set points at the next
    /// page-table level rather than at a data frame.
    pub fn is_leaf(self) -> bool {
        self.flags()
            .intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

/// A page-table page: 512 PTEs filling exactly one 4 KiB frame.
#[repr(C, align(4096))]
pub struct PageTable(pub [Pte; 512]);

// extract the three 9-bit page table indices from a virtual address.
const PXMASK: usize = 0x1FF; // 9 bits

pub const fn px(level: usize, va: usize) -> usize {
    (va >> (PGSHIFT + 9 * level)) & PXMASK
}

// use riscv's sv39 page table scheme.
const SATP_SV39: usize = 8 << 60;

pub const fn make_satp(pagetable_pa: usize) -> usize {
    SATP_SV39 | (pagetable_pa >> 12)
}

// one beyond the highest possible virtual address.
// MAXVA is actually one bit less than the max allowed by
// Sv39, to avoid having to sign-extend virtual addresses
// that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
