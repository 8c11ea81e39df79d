//
// File-system system calls.
// Mostly argument checking, since we don't trust
// user code, and calls into file.rs and fs/fs.rs.
//

use core::mem;
use core::ptr;

use crate::exec::exec;
use crate::fcntl::{O_CREATE, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use crate::file::file::{filealloc, fileclose, filedup, fileread, filestat, filewrite};
use crate::file::{FDType, File, INode};
use crate::fs::fs::{dirlink, dirlookup, ialloc, namei, nameiparent};
use crate::fs::{Dirent, DIRSIZ};
use crate::kalloc::KMEM;
use crate::log::{begin_op, end_op};
use crate::param::{MAXARG, MAXPATH, NDEV, NOFILE};
use crate::proc::myproc;
use crate::riscv::PGSIZE;
use crate::stat::{T_DEVICE, T_DIR, T_FILE};
use crate::syscall::syscall::{argaddr, argint, argstr, fetchaddr, fetchstr};
use crate::vm::copyout;

// Fetch the nth word-sized system call argument as a file descriptor
// and return both the descriptor and the corresponding struct File.
fn argfd(n: usize) -> Option<(usize, *mut File)> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return None;
    }
    let f = myproc().ofile[fd as usize];
    if f.is_null() {
        return None;
    }
    Some((fd as usize, f))
}

// Allocate a file descriptor for the given file.
// Takes over file reference from caller on success.
fn fdalloc(f: *mut File) -> Option<usize> {
    let p = myproc();

    for fd in 0..NOFILE {
        if p.ofile[fd].is_null() {
            p.ofile[fd] = f;
            return Some(fd);
        }
    }
    None
}

pub fn sys_dup() -> u64 {
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return u64::MAX,
    };
    let fd = match fdalloc(f) {
        Some(fd) => fd,
        None => return u64::MAX,
    };
    filedup(f);
    fd as u64
}

pub fn sys_read() -> u64 {
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let n = argint(2);
    fileread(unsafe { &mut *f }, addr, n) as u64
}

pub fn sys_write() -> u64 {
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return u64::MAX,
    };
    let addr = argaddr(1);
    let n = argint(2);
    filewrite(unsafe { &mut *f }, addr, n) as u64
}

pub fn sys_close() -> u64 {
    let (fd, f) = match argfd(0) {
        Some(x) => x,
        None => return u64::MAX,
    };
    myproc().ofile[fd] = ptr::null_mut();
    fileclose(f);
    0
}

pub fn sys_fstat() -> u64 {
    let (_, f) = match argfd(0) {
        Some(x) => x,
        None => return u64::MAX,
    };
    let st = argaddr(1); // user pointer to struct Stat
    filestat(unsafe { &mut *f }, st) as u64
}

// Create the path new as a link to the same inode as old.
pub fn sys_link() -> u64 {
    let mut new = [0u8; MAXPATH];
    let mut old = [0u8; MAXPATH];

    let oldlen = argstr(0, &mut old);
    let newlen = argstr(1, &mut new);
    if oldlen < 0 || newlen < 0 {
        return u64::MAX;
    }

    begin_op();

    let ip = match namei(&old[..oldlen as usize]) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };

    ip.ilock();
    if ip.typ == T_DIR {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }

    ip.nlink += 1;
    ip.iupdate();
    ip.iunlock();

    let mut name = [0u8; DIRSIZ];
    let bad = |ip: &mut INode| {
        ip.ilock();
        ip.nlink -= 1;
        ip.iupdate();
        ip.iunlockput();
        end_op();
        u64::MAX
    };

    let dp = match nameiparent(&new[..newlen as usize], &mut name) {
        Some(dp) => dp,
        None => return bad(ip),
    };
    dp.ilock();
    if dp.dev != ip.dev || dirlink(dp, &name, ip.inum as u16) < 0 {
        dp.iunlockput();
        return bad(ip);
    }
    dp.iunlockput();
    ip.iput();

    end_op();

    0
}

// Is the directory dp empty except for "." and ".." ?
fn isdirempty(dp: &mut INode) -> bool {
    let sz = mem::size_of::<Dirent>() as u32;
    let mut de = Dirent::zero();
    let mut off = 2 * sz;
    while off < dp.size {
        if dp.readi(false, ptr::addr_of_mut!(de) as usize, off, sz) != sz as i32 {
            panic!("isdirempty: readi");
        }
        if de.inum != 0 {
            return false;
        }
        off += sz;
    }
    true
}

pub fn sys_unlink() -> u64 {
    let mut path = [0u8; MAXPATH];
    let len = argstr(0, &mut path);
    if len < 0 {
        return u64::MAX;
    }

    begin_op();

    let mut name = [0u8; DIRSIZ];
    let dp = match nameiparent(&path[..len as usize], &mut name) {
        Some(dp) => dp,
        None => {
            end_op();
            return u64::MAX;
        }
    };

    dp.ilock();

    // Cannot unlink "." or "..".
    if name == crate::fs::dirname(b".") || name == crate::fs::dirname(b"..") {
        dp.iunlockput();
        end_op();
        return u64::MAX;
    }

    let mut off = 0u32;
    let ip = match dirlookup(dp, &name, Some(&mut off)) {
        Some(ip) => ip,
        None => {
            dp.iunlockput();
            end_op();
            return u64::MAX;
        }
    };
    ip.ilock();

    if ip.nlink < 1 {
        panic!("unlink: nlink < 1");
    }
    if ip.typ == T_DIR && !isdirempty(ip) {
        ip.iunlockput();
        dp.iunlockput();
        end_op();
        return u64::MAX;
    }

    let de = Dirent::zero();
    let sz = mem::size_of::<Dirent>() as u32;
    if dp.writei(false, ptr::addr_of!(de) as usize, off, sz) != sz as i32 {
        panic!("unlink: writei");
    }
    if ip.typ == T_DIR {
        dp.nlink -= 1; // the child's ".." no longer counts
        dp.iupdate();
    }
    dp.iunlockput();

    ip.nlink -= 1;
    ip.iupdate();
    ip.iunlockput();

    end_op();

    0
}

fn create(path: &[u8], typ: i16, major: i16, minor: i16) -> Option<&'static mut INode> {
    let mut name = [0u8; DIRSIZ];
    let dp = nameiparent(path, &mut name)?;

    dp.ilock();

    if let Some(ip) = dirlookup(dp, &name, None) {
        dp.iunlockput();
        ip.ilock();
        if typ == T_FILE && (ip.typ == T_FILE || ip.typ == T_DEVICE) {
            return Some(ip);
        }
        ip.iunlockput();
        return None;
    }

    let ip = ialloc(dp.dev, typ);

    ip.ilock();
    ip.major = major;
    ip.minor = minor;
    ip.nlink = 1;
    ip.iupdate();

    let fail = |dp: &mut INode, ip: &mut INode| {
        // something went wrong. de-allocate ip.
        ip.nlink = 0;
        ip.iupdate();
        ip.iunlockput();
        dp.iunlockput();
    };

    let inum = ip.inum as u16;
    if typ == T_DIR {
        // Create . and .. entries.
        // No ip.nlink += 1 for ".": avoid cyclic ref count.
        if dirlink(ip, b".", inum) < 0 || dirlink(ip, b"..", dp.inum as u16) < 0 {
            fail(dp, ip);
            return None;
        }
    }

    if dirlink(dp, &name, inum) < 0 {
        fail(dp, ip);
        return None;
    }

    if typ == T_DIR {
        // now that success is guaranteed:
        dp.nlink += 1; // for ".."
        dp.iupdate();
    }

    dp.iunlockput();

    Some(ip)
}

pub fn sys_open() -> u64 {
    let mut path = [0u8; MAXPATH];
    let omode = argint(1);
    let len = argstr(0, &mut path);
    if len < 0 {
        return u64::MAX;
    }
    let path = &path[..len as usize];

    begin_op();

    let ip: &mut INode;
    if omode & O_CREATE != 0 {
        ip = match create(path, T_FILE, 0, 0) {
            Some(ip) => ip,
            None => {
                end_op();
                return u64::MAX;
            }
        };
    } else {
        ip = match namei(path) {
            Some(ip) => ip,
            None => {
                end_op();
                return u64::MAX;
            }
        };
        ip.ilock();
        if ip.typ == T_DIR && omode != O_RDONLY {
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    }

    if ip.typ == T_DEVICE && (ip.major < 0 || ip.major as usize >= NDEV) {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }

    let f = match filealloc() {
        Some(f) => f,
        None => {
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    };
    let fd = match fdalloc(f) {
        Some(fd) => fd,
        None => {
            fileclose(f);
            ip.iunlockput();
            end_op();
            return u64::MAX;
        }
    };

    if ip.typ == T_DEVICE {
        f.ftype = FDType::Device;
        f.major = ip.major;
    } else {
        f.ftype = FDType::INode;
        f.off = 0;
    }
    f.ip = ip as *mut INode;
    f.readable = omode & O_WRONLY == 0;
    f.writable = (omode & O_WRONLY) != 0 || (omode & O_RDWR) != 0;

    if (omode & O_TRUNC) != 0 && ip.typ == T_FILE {
        ip.itrunc();
    }

    ip.iunlock();
    end_op();

    fd as u64
}

pub fn sys_mkdir() -> u64 {
    let mut path = [0u8; MAXPATH];

    begin_op();
    let len = argstr(0, &mut path);
    if len < 0 {
        end_op();
        return u64::MAX;
    }
    match create(&path[..len as usize], T_DIR, 0, 0) {
        Some(ip) => {
            ip.iunlockput();
            end_op();
            0
        }
        None => {
            end_op();
            u64::MAX
        }
    }
}

pub fn sys_mknod() -> u64 {
    let mut path = [0u8; MAXPATH];

    begin_op();
    let major = argint(1) as i16;
    let minor = argint(2) as i16;
    let len = argstr(0, &mut path);
    if len < 0 {
        end_op();
        return u64::MAX;
    }
    match create(&path[..len as usize], T_DEVICE, major, minor) {
        Some(ip) => {
            ip.iunlockput();
            end_op();
            0
        }
        None => {
            end_op();
            u64::MAX
        }
    }
}

pub fn sys_chdir() -> u64 {
    let mut path = [0u8; MAXPATH];
    let p = myproc();

    begin_op();
    let len = argstr(0, &mut path);
    if len < 0 {
        end_op();
        return u64::MAX;
    }
    let ip = match namei(&path[..len as usize]) {
        Some(ip) => ip,
        None => {
            end_op();
            return u64::MAX;
        }
    };
    ip.ilock();
    if ip.typ != T_DIR {
        ip.iunlockput();
        end_op();
        return u64::MAX;
    }
    ip.iunlock();
    if !p.cwd.is_null() {
        unsafe { (*p.cwd).iput() };
    }
    end_op();
    p.cwd = ip as *mut INode;
    0
}

pub fn sys_exec() -> u64 {
    let mut path = [0u8; MAXPATH];
    let uargv = argaddr(1);

    let len = argstr(0, &mut path);
    if len < 0 {
        return u64::MAX;
    }

    let mut argv: [*mut u8; MAXARG] = [ptr::null_mut(); MAXARG];

    let bad = |argv: &[*mut u8; MAXARG]| {
        for &arg in argv.iter() {
            if arg.is_null() {
                break;
            }
            unsafe { KMEM.kfree(arg) };
        }
        u64::MAX
    };

    let mut i = 0;
    loop {
        if i >= MAXARG {
            return bad(&argv);
        }

        let mut uarg = 0usize;
        if fetchaddr(uargv + mem::size_of::<usize>() * i, &mut uarg) < 0 {
            return bad(&argv);
        }
        if uarg == 0 {
            argv[i] = ptr::null_mut();
            break;
        }

        argv[i] = unsafe { KMEM.kalloc() };
        if argv[i].is_null() {
            return bad(&argv);
        }
        if fetchstr(uarg, unsafe { core::slice::from_raw_parts_mut(argv[i], PGSIZE) }) < 0 {
            return bad(&argv);
        }

        i += 1;
    }

    let ret = exec(&path[..len as usize], &argv);

    for &arg in argv.iter() {
        if arg.is_null() {
            break;
        }
        unsafe { KMEM.kfree(arg) };
    }

    ret as u64
}

pub fn sys_pipe() -> u64 {
    let fdarray = argaddr(0); // user pointer to array of two ints
    let p = myproc();

    let mut rf: *mut File = ptr::null_mut();
    let mut wf: *mut File = ptr::null_mut();
    if crate::pipe::pipealloc(&mut rf, &mut wf) < 0 {
        return u64::MAX;
    }

    let fd0 = match fdalloc(rf) {
        Some(fd) => fd,
        None => {
            fileclose(rf);
            fileclose(wf);
            return u64::MAX;
        }
    };
    let fd1 = match fdalloc(wf) {
        Some(fd) => fd,
        None => {
            p.ofile[fd0] = ptr::null_mut();
            fileclose(rf);
            fileclose(wf);
            return u64::MAX;
        }
    };

    let fds = [fd0 as i32, fd1 as i32];
    if copyout(
        p.pagetable,
        fdarray,
        fds.as_ptr() as *const u8,
        2 * mem::size_of::<i32>(),
    ) < 0
    {
        p.ofile[fd0] = ptr::null_mut();
        p.ofile[fd1] = ptr::null_mut();
        fileclose(rf);
        fileclose(wf);
        return u64::MAX;
    }

    0
}
