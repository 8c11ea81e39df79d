#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![allow(static_mut_refs)]
// several statics are named after the linker symbols they must match.
#![allow(non_upper_case_globals)]

// Portable on-disk format and ABI definitions. These also build on the
// host, where mkfs and the unit tests consume this crate as a library.
pub mod elf;
pub mod fcntl;
pub mod fs;
pub mod param;
pub mod stat;

// The kernel proper only builds for the riscv64 target.
#[cfg(target_os = "none")]
mod asm;
#[cfg(target_os = "none")]
mod bio;
#[cfg(target_os = "none")]
mod buf;
#[cfg(target_os = "none")]
mod console;
#[cfg(target_os = "none")]
mod exec;
#[cfg(target_os = "none")]
mod file;
#[cfg(target_os = "none")]
mod kalloc;
#[cfg(target_os = "none")]
mod log;
#[cfg(target_os = "none")]
mod memlayout;
#[cfg(target_os = "none")]
mod pipe;
#[cfg(target_os = "none")]
mod plic;
#[cfg(target_os = "none")]
pub mod printf;
#[cfg(target_os = "none")]
mod proc;
#[cfg(target_os = "none")]
mod riscv;
#[cfg(target_os = "none")]
mod sleeplock;
#[cfg(target_os = "none")]
mod spinlock;
#[cfg(target_os = "none")]
mod start;
#[cfg(target_os = "none")]
mod string;
#[cfg(target_os = "none")]
mod syscall;
#[cfg(target_os = "none")]
mod trap;
#[cfg(target_os = "none")]
mod uart;
#[cfg(target_os = "none")]
mod virtio;
#[cfg(target_os = "none")]
mod vm;

#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(target_os = "none")]
static STARTED: AtomicBool = AtomicBool::new(false);

// start.rs mret's every hart here in supervisor mode.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    use ::log::info;

    if proc::cpuid() == 0 {
        console::consoleinit();
        printf::printfinit();
        printf!("\nokra kernel is booting\n\n");

        kalloc::kinit(); // physical page allocator
        info!("physical page allocator ready");

        vm::kvminit(); // create kernel page table
        vm::kvminithart(); // turn on paging
        info!("paging on");

        proc::procinit(); // process table
        trap::trapinit(); // trap vectors
        trap::trapinithart(); // install kernel trap vector
        plic::plicinit(); // set up interrupt controller
        plic::plicinithart(); // ask PLIC for device interrupts
        bio::binit(); // buffer cache
        virtio::virtio_disk::virtio_disk_init(); // emulated hard disk
        proc::userinit(); // first user process
        info!("first user process ready");

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        info!("hart {} starting", proc::cpuid());
        vm::kvminithart(); // turn on paging
        trap::trapinithart(); // install kernel trap vector
        plic::plicinithart(); // ask PLIC for device interrupts
    }

    proc::scheduler()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    unsafe { printf::PRINTER.panicked() };
    printf!("panic: ");
    if let Some(loc) = info.location() {
        printf!("{}:{}: ", loc.file(), loc.line());
    }
    printf!("{}\n", info.message());
    abort()
}

#[cfg(target_os = "none")]
fn abort() -> ! {
    loop {
        riscv::wfi();
    }
}

// The kernel binary only makes sense for the bare-metal target, but
// cargo still compiles this file for the host when running the test
// suite; give that build a main so it links.
#[cfg(not(target_os = "none"))]
#[allow(dead_code)]
fn main() {
    eprintln!("the kernel binary must be built with --target riscv64gc-unknown-none-elf");
    std::process::exit(1);
}
