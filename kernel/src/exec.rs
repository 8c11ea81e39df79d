use core::mem;
use core::ptr;

use crate::elf::{
    ElfHeader, ProgramHeader, ELF_MAGIC, ELF_PROG_FLAG_EXEC, ELF_PROG_FLAG_WRITE, ELF_PROG_LOAD,
};
use crate::file::INode;
use crate::fs::fs::namei;
use crate::log::{begin_op, end_op};
use crate::param::{MAXARG, USERSTACK};
use crate::proc::{myproc, proc_freepagetable, proc_pagetable};
use crate::riscv::{pg_round_up, PageTable, PteFlags, PGSIZE};
use crate::string::{safestrcpy, strlen};
use crate::vm::{copyout, uvmalloc, uvmclear, walkaddr};

fn flags2perm(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & ELF_PROG_FLAG_EXEC != 0 {
        perm |= PteFlags::X;
    }
    if flags & ELF_PROG_FLAG_WRITE != 0 {
        perm |= PteFlags::W;
    }
    perm
}

// free whatever has been built so far and surface the failure.
fn bad(pagetable: *mut PageTable, sz: usize, ip: Option<&mut INode>) -> i64 {
    if !pagetable.is_null() {
        proc_freepagetable(pagetable, sz);
    }
    if let Some(ip) = ip {
        ip.iunlockput();
        end_op();
    }
    -1
}

// Replace the current process image with the program at path.
// argv is a null-terminated array of kernel pointers to
// nul-terminated argument strings.
// Returns argc on success; on failure the old image is untouched.
pub fn exec(path: &[u8], argv: &[*mut u8; MAXARG]) -> i64 {
    let p = myproc();

    begin_op();

    let ip = match namei(path) {
        Some(ip) => ip,
        None => {
            end_op();
            return -1;
        }
    };
    ip.ilock();

    // Check ELF header
    let mut elf = ElfHeader::zero();
    let elf_sz = mem::size_of::<ElfHeader>() as u32;
    if ip.readi(false, ptr::addr_of_mut!(elf) as usize, 0, elf_sz) != elf_sz as i32 {
        return bad(ptr::null_mut(), 0, Some(ip));
    }
    if elf.magic != ELF_MAGIC {
        return bad(ptr::null_mut(), 0, Some(ip));
    }

    let pagetable = proc_pagetable(p);
    if pagetable.is_null() {
        return bad(ptr::null_mut(), 0, Some(ip));
    }

    // Load program into memory.
    let mut sz = 0usize;
    let ph_sz = mem::size_of::<ProgramHeader>() as u32;
    for i in 0..elf.phnum {
        let off = elf.phoff as u32 + i as u32 * ph_sz;
        let mut ph = ProgramHeader::zero();
        if ip.readi(false, ptr::addr_of_mut!(ph) as usize, off, ph_sz) != ph_sz as i32 {
            return bad(pagetable, sz, Some(ip));
        }
        if ph.ptype != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return bad(pagetable, sz, Some(ip));
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return bad(pagetable, sz, Some(ip));
        }
        if ph.vaddr as usize % PGSIZE != 0 {
            return bad(pagetable, sz, Some(ip));
        }
        let sz1 = uvmalloc(
            pagetable,
            sz,
            (ph.vaddr + ph.memsz) as usize,
            flags2perm(ph.flags),
        );
        if sz1 == 0 {
            return bad(pagetable, sz, Some(ip));
        }
        sz = sz1;
        if loadseg(pagetable, ph.vaddr as usize, ip, ph.off as u32, ph.filesz as u32) < 0 {
            return bad(pagetable, sz, Some(ip));
        }
    }
    ip.iunlockput();
    end_op();

    let oldsz = p.sz;

    // Allocate USERSTACK pages at the next page boundary, plus one
    // more below them that is stripped of its user bit to serve as
    // a stack guard.
    sz = pg_round_up(sz);
    let sz1 = uvmalloc(pagetable, sz, sz + (USERSTACK + 1) * PGSIZE, PteFlags::W);
    if sz1 == 0 {
        return bad(pagetable, sz, None);
    }
    sz = sz1;
    uvmclear(pagetable, sz - (USERSTACK + 1) * PGSIZE);
    let mut sp = sz;
    let stackbase = sp - USERSTACK * PGSIZE;

    // Push argument strings, prepare rest of stack in ustack.
    let mut ustack = [0u64; MAXARG];
    let mut argc = 0;
    loop {
        if argc >= MAXARG {
            return bad(pagetable, sz, None);
        }
        if argv[argc].is_null() {
            break;
        }
        let len = strlen(argv[argc]);
        sp -= len + 1;
        sp -= sp % 16; // riscv sp must be 16-byte aligned
        if sp < stackbase {
            return bad(pagetable, sz, None);
        }
        if copyout(pagetable, sp, argv[argc], len + 1) < 0 {
            return bad(pagetable, sz, None);
        }
        ustack[argc] = sp as u64;
        argc += 1;
    }
    ustack[argc] = 0;

    // push the array of argv[] pointers.
    sp -= (argc + 1) * mem::size_of::<u64>();
    sp -= sp % 16;
    if sp < stackbase {
        return bad(pagetable, sz, None);
    }
    if copyout(
        pagetable,
        sp,
        ustack.as_ptr() as *const u8,
        (argc + 1) * mem::size_of::<u64>(),
    ) < 0
    {
        return bad(pagetable, sz, None);
    }

    // arguments to user main(argc, argv)
    // argc is returned via the system call return
    // value, which goes in a0.
    let tf = unsafe { &mut *p.trapframe };
    tf.a1 = sp as u64;

    // Save program name for debugging.
    let mut last = 0;
    for (i, &c) in path.iter().enumerate() {
        if c == b'/' {
            last = i + 1;
        }
    }
    safestrcpy(&mut p.name, &path[last..]);

    // Commit to the user image.
    let oldpagetable = p.pagetable;
    p.pagetable = pagetable;
    p.sz = sz;
    tf.epc = elf.entry; // initial program counter = main
    tf.sp = sp as u64; // initial stack pointer
    proc_freepagetable(oldpagetable, oldsz);

    argc as i64 // this ends up in a0, the first argument to main(argc, argv)
}

// Load a program segment into pagetable at virtual address va.
// va must be page-aligned
// and the pages from va to va+sz must already be mapped.
// Returns 0 on success, -1 on failure.
fn loadseg(pagetable: *mut PageTable, va: usize, ip: &mut INode, offset: u32, sz: u32) -> i32 {
    let mut i = 0;
    while i < sz {
        let pa = walkaddr(pagetable, va + i as usize);
        if pa == 0 {
            panic!("loadseg: address should exist");
        }
        let n = if sz - i < PGSIZE as u32 {
            sz - i
        } else {
            PGSIZE as u32
        };
        if ip.readi(false, pa, offset + i, n) != n as i32 {
            return -1;
        }
        i += PGSIZE as u32;
    }
    0
}
