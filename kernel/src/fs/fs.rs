// Inodes.
//
// An inode describes a single unnamed file.
// The inode disk structure holds metadata: the file's type,
// its size, the number of links referring to it, and the
// list of blocks holding the file's content.
//
// The inodes are laid out sequentially on disk at block
// sb.inodestart. Each inode has a number, indicating its
// position on the disk.
//
// The kernel keeps a table of in-use inodes in memory
// to provide a place for synchronizing access
// to inodes used by multiple processes. The in-memory
// inodes include book-keeping information that is
// not stored on disk: ip->ref_cnt and ip->valid.
//
// An inode and its in-memory representation go through a
// sequence of states before they can be used by the
// rest of the file system code.
//
// * Allocation: an inode is allocated if its type (on disk)
//   is non-zero. ialloc() allocates, and iput() frees if
//   the reference and link counts have fallen to zero.
//
// * Referencing in table: an entry in the inode table
//   is free if ip->ref_cnt is zero. Otherwise ip->ref_cnt tracks
//   the number of in-memory pointers to the entry (open
//   files and current directories). iget() finds or
//   creates a table entry and increments its ref_cnt; iput()
//   decrements it.
//
// * Valid: the information (type, size, &c) in an inode
//   table entry is only correct when ip->valid is true.
//   ilock() reads the inode from
//   the disk and sets ip->valid, while iput() clears
//   ip->valid if ip->ref_cnt has fallen to zero.
//
// * Locked: file system code may only examine and modify
//   the information in an inode and its content if it
//   has first locked the inode.
//
// Thus a typical sequence is:
//   ip = iget(dev, inum)
//   ip.ilock()
//   ... examine and modify ip->xxx ...
//   ip.iunlock()
//   ip.iput()
//
// ilock() is separate from iget() so that system calls can
// get a long-term reference to an inode (as for an open file)
// and only lock it for short periods (e.g., in read()).
// The separation also helps avoid deadlock and races during
// pathname lookup. iget() increments ip->ref_cnt so that the inode
// stays in the table and pointers to it remain valid.
//
// Many internal file system functions expect the caller to
// have locked the inodes involved; this lets callers create
// multi-step atomic operations.
//
// The ITABLE.lock spin-lock protects the allocation of table
// entries. Since ip->ref_cnt indicates whether an entry is free,
// and ip->dev and ip->inum indicate which i-node an entry
// holds, one must hold ITABLE.lock while using any of those fields.
//
// An ip->lock sleep-lock protects all ip-> fields other than ref_cnt,
// dev, and inum.  One must hold ip->lock in order to
// read or write that inode's ip->valid, ip->size, ip->typ, &c.

use core::mem;
use core::ptr;

use crate::bio::{bread, brelse};
use crate::file::INode;
use crate::fs::{
    bblock, dirname, iblock, skipelem, DINode, Dirent, SuperBlock, BPB, BSIZE, DIRSIZ, FSMAGIC,
    IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO,
};
use crate::log::{begin_op, end_op, initlog, log_write};
use crate::param::{NINODE, ROOTDEV};
use crate::printf;
use crate::proc::{either_copyin, either_copyout, myproc};
use crate::spinlock::Spinlock;
use crate::stat::{Stat, T_DIR};
use crate::string::memset;

static mut SB: SuperBlock = SuperBlock::zero();

// Read the super block.
fn readsb(dev: u32) {
    let bp = bread(dev, 1);
    unsafe {
        SB = ptr::read_unaligned(bp.data.as_ptr() as *const SuperBlock);
    }
    brelse(bp);
}

// Init fs
pub fn fsinit(dev: u32) {
    readsb(dev);
    if unsafe { SB.magic } != FSMAGIC {
        panic!("invalid file system");
    }
    initlog(dev, unsafe { &SB });
    recover_orphans(dev);
}

// Reclaim inodes that were unlinked while still open when the
// system last went down: allocated on disk but with no links.
// Pulling each one through iget/ilock/iput drives the normal
// truncate-and-free path.
fn recover_orphans(dev: u32) {
    let ninodes = unsafe { SB.ninodes };
    for inum in 1..ninodes {
        let bp = bread(dev, iblock(inum, unsafe { &SB }));
        let off = (inum % IPB) as usize * mem::size_of::<DINode>();
        let dip = unsafe { ptr::read_unaligned(bp.data.as_ptr().add(off) as *const DINode) };
        brelse(bp);

        if dip.typ != 0 && dip.nlink == 0 {
            printf!("fs: reclaiming orphaned inode {}\n", inum);
            begin_op();
            let ip = iget(dev, inum);
            ip.ilock();
            ip.iunlock();
            ip.iput();
            end_op();
        }
    }
}

// Zero a block.
fn bzero(dev: u32, bno: u32) {
    let bp = bread(dev, bno);
    memset(bp.data.as_mut_ptr(), 0, BSIZE);
    log_write(bp);
    brelse(bp);
}

// Blocks.

// Allocate a zeroed disk block.
// returns 0 if out of disk space.
fn balloc(dev: u32) -> u32 {
    let size = unsafe { SB.size };
    let mut b = 0;
    while b < size {
        let bp = bread(dev, bblock(b, unsafe { &SB }));
        let mut bi = 0;
        while bi < BPB && b + bi < size {
            let m = 1 << (bi % 8);
            if bp.data[bi as usize / 8] & m == 0 {
                // Is block free?
                bp.data[bi as usize / 8] |= m; // Mark block in use.
                log_write(bp);
                brelse(bp);
                bzero(dev, b + bi);
                return b + bi;
            }
            bi += 1;
        }
        brelse(bp);
        b += BPB;
    }
    printf!("balloc: out of blocks\n");
    0
}

// Free a disk block.
fn bfree(dev: u32, b: u32) {
    let bp = bread(dev, bblock(b, unsafe { &SB }));
    let bi = b % BPB;
    let m = 1 << (bi % 8);
    if bp.data[bi as usize / 8] & m == 0 {
        panic!("freeing free block");
    }
    bp.data[bi as usize / 8] &= !m;
    log_write(bp);
    brelse(bp);
}

// Inodes.

struct ITable {
    lock: Spinlock,
    inode: [INode; NINODE],
}

static mut ITABLE: ITable = ITable {
    lock: Spinlock::new("itable"),
    inode: [const { INode::new() }; NINODE],
};

// Allocate an inode on device dev.
// Mark it as allocated by giving it type typ.
// Returns an unlocked but allocated and referenced inode.
pub fn ialloc(dev: u32, typ: i16) -> &'static mut INode {
    for inum in 1..unsafe { SB.ninodes } {
        let bp = bread(dev, iblock(inum, unsafe { &SB }));
        let off = (inum % IPB) as usize * mem::size_of::<DINode>();
        let dp = unsafe { bp.data.as_mut_ptr().add(off) as *mut DINode };
        let dip = unsafe { ptr::read_unaligned(dp) };
        if dip.typ == 0 {
            // a free inode
            let mut new = DINode::zero();
            new.typ = typ;
            unsafe { ptr::write_unaligned(dp, new) }; // mark it allocated on the disk
            log_write(bp);
            brelse(bp);
            return iget(dev, inum);
        }
        brelse(bp);
    }
    panic!("ialloc: no inodes");
}

// Find the inode with number inum on device dev
// and return the in-memory copy. Does not lock
// the inode and does not read it from disk.
fn iget(dev: u32, inum: u32) -> &'static mut INode {
    unsafe {
        ITABLE.lock.acquire();

        // Is the inode already in the table?
        let mut empty: *mut INode = ptr::null_mut();
        for ip in ITABLE.inode.iter_mut() {
            if ip.ref_cnt > 0 && ip.dev == dev && ip.inum == inum {
                ip.ref_cnt += 1;
                ITABLE.lock.release();
                return ip;
            }
            if empty.is_null() && ip.ref_cnt == 0 {
                // Remember empty slot.
                empty = ip;
            }
        }

        // Recycle an inode entry.
        if empty.is_null() {
            panic!("iget: no inodes");
        }

        let ip = &mut *empty;
        ip.dev = dev;
        ip.inum = inum;
        ip.ref_cnt = 1;
        ip.valid = false;

        ITABLE.lock.release();

        ip
    }
}

impl INode {
    // Increment reference count for ip.
    // Returns ip to enable the ip = ip1.idup() idiom.
    pub fn idup(&mut self) -> &'static mut INode {
        unsafe {
            ITABLE.lock.acquire();
            self.ref_cnt += 1;
            ITABLE.lock.release();
            &mut *(self as *mut INode)
        }
    }

    // Lock the given inode.
    // Reads the inode from disk if necessary.
    pub fn ilock(&mut self) {
        if self.ref_cnt < 1 {
            panic!("ilock");
        }

        self.lock.acquire_sleep();

        if !self.valid {
            let bp = bread(self.dev, iblock(self.inum, unsafe { &SB }));
            let off = (self.inum % IPB) as usize * mem::size_of::<DINode>();
            let dip = unsafe { ptr::read_unaligned(bp.data.as_ptr().add(off) as *const DINode) };
            self.typ = dip.typ;
            self.major = dip.major;
            self.minor = dip.minor;
            self.nlink = dip.nlink;
            self.size = dip.size;
            self.addrs.copy_from_slice(&dip.addrs);
            brelse(bp);
            self.valid = true;
            if self.typ == 0 {
                panic!("ilock: no type");
            }
        }
    }

    // Unlock the given inode.
    pub fn iunlock(&mut self) {
        if !self.lock.holding_sleep() || self.ref_cnt < 1 {
            panic!("iunlock");
        }

        self.lock.release_sleep();
    }

    // Drop a reference to an in-memory inode.
    // If that was the last reference, the inode table entry can
    // be recycled.
    // If that was the last reference and the inode has no links
    // to it, free the inode (and its content) on disk.
    // All calls to iput() must be inside a transaction in
    // case it has to free the inode.
    pub fn iput(&mut self) {
        unsafe {
            ITABLE.lock.acquire();

            if self.ref_cnt == 1 && self.valid && self.nlink == 0 {
                // inode has no links and no other references: truncate and free.

                // self.ref_cnt == 1 means no other process can have the inode
                // locked, so this acquire_sleep() won't block (or deadlock).
                self.lock.acquire_sleep();

                ITABLE.lock.release();

                self.itrunc();
                self.typ = 0;
                self.iupdate();
                self.valid = false;

                self.lock.release_sleep();

                ITABLE.lock.acquire();
            }

            self.ref_cnt -= 1;
            ITABLE.lock.release();
        }
    }

    // Common idiom: unlock, then put.
    pub fn iunlockput(&mut self) {
        self.iunlock();
        self.iput();
    }

    // Copy a modified in-memory inode to disk.
    // Must be called after every change to an ip->xxx field
    // that lives on disk.
    // Caller must hold ip->lock.
    pub fn iupdate(&mut self) {
        let bp = bread(self.dev, iblock(self.inum, unsafe { &SB }));
        let off = (self.inum % IPB) as usize * mem::size_of::<DINode>();
        let dip = DINode {
            typ: self.typ,
            major: self.major,
            minor: self.minor,
            nlink: self.nlink,
            size: self.size,
            addrs: self.addrs,
        };
        unsafe { ptr::write_unaligned(bp.data.as_mut_ptr().add(off) as *mut DINode, dip) };
        log_write(bp);
        brelse(bp);
    }

    // Truncate inode (discard contents).
    // Caller must hold ip->lock.
    pub fn itrunc(&mut self) {
        for i in 0..NDIRECT {
            if self.addrs[i] != 0 {
                bfree(self.dev, self.addrs[i]);
                self.addrs[i] = 0;
            }
        }

        if self.addrs[NDIRECT] != 0 {
            let bp = bread(self.dev, self.addrs[NDIRECT]);
            for i in 0..NINDIRECT {
                let a = unsafe {
                    ptr::read_unaligned((bp.data.as_ptr() as *const u32).add(i))
                };
                if a != 0 {
                    bfree(self.dev, a);
                }
            }
            brelse(bp);
            bfree(self.dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.iupdate();
    }

    // Copy stat information from inode.
    // Caller must hold ip->lock.
    pub fn stati(&self, st: &mut Stat) {
        st.dev = self.dev as i32;
        st.ino = self.inum;
        st.typ = self.typ;
        st.nlink = self.nlink;
        st.size = self.size as u64;
    }

    // Inode content
    //
    // The content (data) associated with each inode is stored
    // in blocks on the disk. The first NDIRECT block numbers
    // are listed in ip->addrs[].  The next NINDIRECT blocks are
    // listed in block ip->addrs[NDIRECT].

    // Return the disk block address of the nth block in inode ip.
    // If there is no such block, bmap allocates one.
    // returns 0 if out of disk space.
    fn bmap(&mut self, bn: u32) -> u32 {
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = balloc(self.dev);
                if addr == 0 {
                    return 0;
                }
                self.addrs[bn] = addr;
            }
            return addr;
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // Load indirect block, allocating if necessary.
            let mut addr = self.addrs[NDIRECT];
            if addr == 0 {
                addr = balloc(self.dev);
                if addr == 0 {
                    return 0;
                }
                self.addrs[NDIRECT] = addr;
            }
            let bp = bread(self.dev, addr);
            let slot = unsafe { (bp.data.as_mut_ptr() as *mut u32).add(bn) };
            addr = unsafe { ptr::read_unaligned(slot) };
            if addr == 0 {
                addr = balloc(self.dev);
                if addr != 0 {
                    unsafe { ptr::write_unaligned(slot, addr) };
                    log_write(bp);
                }
            }
            brelse(bp);
            return addr;
        }

        panic!("bmap: out of range");
    }

    // Read data from inode.
    // Caller must hold ip->lock.
    // If user_dst, then dst is a user virtual address;
    // otherwise, dst is a kernel address.
    // Returns the number of bytes successfully read.
    pub fn readi(&mut self, user_dst: bool, dst: usize, off: u32, n: u32) -> i32 {
        let mut n = n;
        if off > self.size || off.checked_add(n).is_none() {
            return 0;
        }
        if off + n > self.size {
            n = self.size - off;
        }

        let mut tot: u32 = 0;
        let mut off = off;
        let mut dst = dst;
        while tot < n {
            let addr = self.bmap(off / BSIZE as u32);
            if addr == 0 {
                break;
            }
            let bp = bread(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            if either_copyout(
                user_dst,
                dst,
                unsafe { bp.data.as_ptr().add(off as usize % BSIZE) },
                m as usize,
            ) == -1
            {
                brelse(bp);
                return -1;
            }
            brelse(bp);

            tot += m;
            off += m;
            dst += m as usize;
        }
        tot as i32
    }

    // Write data to inode.
    // Caller must hold ip->lock.
    // If user_src, then src is a user virtual address;
    // otherwise, src is a kernel address.
    // Returns the number of bytes successfully written.
    // If the return value is less than the requested n,
    // there was an error of some kind.
    pub fn writei(&mut self, user_src: bool, src: usize, off: u32, n: u32) -> i32 {
        if off > self.size || off.checked_add(n).is_none() {
            return -1;
        }
        if off + n > (MAXFILE * BSIZE) as u32 {
            return -1;
        }

        let mut tot: u32 = 0;
        let mut off = off;
        let mut src = src;
        while tot < n {
            let addr = self.bmap(off / BSIZE as u32);
            if addr == 0 {
                break;
            }
            let bp = bread(self.dev, addr);
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            if either_copyin(
                unsafe { bp.data.as_mut_ptr().add(off as usize % BSIZE) },
                user_src,
                src,
                m as usize,
            ) == -1
            {
                brelse(bp);
                break;
            }
            log_write(bp);
            brelse(bp);

            tot += m;
            off += m;
            src += m as usize;
        }

        if off > self.size {
            self.size = off;
        }

        // write the i-node back to disk even if the size didn't change
        // because the loop above might have called bmap() and added a new
        // block to ip->addrs[].
        self.iupdate();

        tot as i32
    }
}

// Directories

// Look for a directory entry in a directory.
// If found, set *poff to byte offset of entry.
pub fn dirlookup(
    dp: &mut INode,
    name: &[u8],
    mut poff: Option<&mut u32>,
) -> Option<&'static mut INode> {
    if dp.typ != T_DIR {
        panic!("dirlookup not DIR");
    }

    let sz = mem::size_of::<Dirent>() as u32;
    let mut de = Dirent::zero();
    let mut off = 0;
    while off < dp.size {
        if dp.readi(false, ptr::addr_of_mut!(de) as usize, off, sz) != sz as i32 {
            panic!("dirlookup read");
        }
        if de.inum != 0 && de.name_matches(name) {
            // entry matches path element
            if let Some(p) = poff.as_deref_mut() {
                *p = off;
            }
            return Some(iget(dp.dev, de.inum as u32));
        }
        off += sz;
    }

    None
}

// Write a new directory entry (name, inum) into the directory dp.
// Returns 0 on success, -1 on failure (e.g. out of disk blocks).
pub fn dirlink(dp: &mut INode, name: &[u8], inum: u16) -> i32 {
    // Check that name is not present.
    if let Some(ip) = dirlookup(dp, name, None) {
        ip.iput();
        return -1;
    }

    // Look for an empty dirent.
    let sz = mem::size_of::<Dirent>() as u32;
    let mut de = Dirent::zero();
    let mut off = 0;
    while off < dp.size {
        if dp.readi(false, ptr::addr_of_mut!(de) as usize, off, sz) != sz as i32 {
            panic!("dirlink read");
        }
        if de.inum == 0 {
            break;
        }
        off += sz;
    }

    de.inum = inum;
    de.name = dirname(name);
    if dp.writei(false, ptr::addr_of!(de) as usize, off, sz) != sz as i32 {
        return -1;
    }

    0
}

// Paths

// Look up and return the inode for a path name.
// If parent is true, return the inode for the parent and copy the final
// path element into name, which must have room for DIRSIZ bytes.
// Must be called inside a transaction since it calls iput().
fn namex(path: &[u8], parent: bool, name: &mut [u8; DIRSIZ]) -> Option<&'static mut INode> {
    let mut ip = if path.first() == Some(&b'/') {
        iget(ROOTDEV, ROOTINO)
    } else {
        let cwd = myproc().cwd;
        unsafe { (*cwd).idup() }
    };

    let mut path = path;
    loop {
        let (elem, rest) = match skipelem(path) {
            Some(x) => x,
            None => break,
        };
        *name = dirname(elem);

        ip.ilock();
        if ip.typ != T_DIR {
            ip.iunlockput();
            return None;
        }
        if parent && rest.is_empty() {
            // Stop one level early.
            ip.iunlock();
            return Some(ip);
        }
        match dirlookup(ip, elem, None) {
            Some(next) => {
                ip.iunlockput();
                ip = next;
            }
            None => {
                ip.iunlockput();
                return None;
            }
        }
        path = rest;
    }

    if parent {
        ip.iput();
        return None;
    }

    Some(ip)
}

pub fn namei(path: &[u8]) -> Option<&'static mut INode> {
    let mut name = [0u8; DIRSIZ];
    namex(path, false, &mut name)
}

pub fn nameiparent(path: &[u8], name: &mut [u8; DIRSIZ]) -> Option<&'static mut INode> {
    namex(path, true, name)
}
