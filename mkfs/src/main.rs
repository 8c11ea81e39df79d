// Build an initial file system image for the kernel.
//
// The on-disk format comes straight from the kernel crate (which
// exposes only its portable definitions when built for the host), so
// mkfs and the kernel can never disagree about the layout.
//
// Disk layout:
// [ boot block | sb block | log | inode blocks | free bit map | data blocks ]
//
// This tool assumes a little-endian host, matching the riscv64 target.

use std::cmp;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::Path;
use std::slice;

use clap::Parser;
use kernel::fs::{
    DINode, Dirent, SuperBlock, BSIZE, DIRSIZ, FSMAGIC, IPB, MAXFILE, NDIRECT, ROOTINO,
};
use kernel::param::{FSSIZE, LOGSIZE};
use kernel::stat::{T_DIR, T_FILE};

const NINODES: u32 = 200;

const NBITMAP: u32 = FSSIZE / (BSIZE as u32 * 8) + 1;
const NINODEBLOCKS: u32 = NINODES / IPB + 1;
const NLOG: u32 = LOGSIZE as u32;

// 1 fs block = 1 disk sector
const NMETA: u32 = 2 + NLOG + NINODEBLOCKS + NBITMAP; // boot, sb, log, inode, bitmap
const NBLOCKS: u32 = FSSIZE - NMETA; // Number of data blocks

const SB: SuperBlock = SuperBlock {
    magic: FSMAGIC,
    size: FSSIZE,
    nblocks: NBLOCKS,
    ninodes: NINODES,
    nlog: NLOG,
    logstart: 2,
    inodestart: 2 + NLOG,
    bmapstart: 2 + NLOG + NINODEBLOCKS,
};

fn struct_bytes<T>(v: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }
}

struct FsImage {
    file: File,
    freeinode: u32,
    freeblock: u32, // the first data block we have not yet handed out
}

impl FsImage {
    fn create(path: &Path) -> std::io::Result<FsImage> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut img = FsImage {
            file,
            freeinode: 1,
            freeblock: NMETA,
        };

        for sec in 0..FSSIZE {
            img.wsect(sec, &[0; BSIZE])?;
        }

        let mut buf = [0u8; BSIZE];
        buf[..size_of::<SuperBlock>()].copy_from_slice(struct_bytes(&SB));
        img.wsect(1, &buf)?;

        Ok(img)
    }

    fn wsect(&mut self, sec: u32, buf: &[u8; BSIZE]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(sec as u64 * BSIZE as u64))?;
        self.file.write_all(buf)
    }

    fn rsect(&mut self, sec: u32) -> std::io::Result<[u8; BSIZE]> {
        let mut buf = [0u8; BSIZE];
        self.file.seek(SeekFrom::Start(sec as u64 * BSIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn winode(&mut self, inum: u32, din: DINode) -> std::io::Result<()> {
        let sec = inum / IPB + SB.inodestart;
        let mut buf = self.rsect(sec)?;
        let off = (inum % IPB) as usize * size_of::<DINode>();
        buf[off..off + size_of::<DINode>()].copy_from_slice(struct_bytes(&din));
        self.wsect(sec, &buf)
    }

    fn rinode(&mut self, inum: u32) -> std::io::Result<DINode> {
        let sec = inum / IPB + SB.inodestart;
        let buf = self.rsect(sec)?;
        let off = (inum % IPB) as usize * size_of::<DINode>();
        let din = unsafe { std::ptr::read_unaligned(buf[off..].as_ptr() as *const DINode) };
        Ok(din)
    }

    fn ialloc(&mut self, typ: i16) -> std::io::Result<u32> {
        let inum = self.freeinode;
        self.freeinode += 1;

        let mut din = DINode::zero();
        din.typ = typ;
        din.nlink = 1;
        din.size = 0;
        self.winode(inum, din)?;
        Ok(inum)
    }

    // mark everything below freeblock as in use in the block bitmap.
    // the image is small enough for one bitmap block.
    fn balloc(&mut self) -> std::io::Result<()> {
        let used = self.freeblock as usize;
        println!("balloc: first {} blocks have been allocated", used);
        assert!(used < BSIZE * 8);

        let mut buf = [0u8; BSIZE];
        for i in 0..used {
            buf[i / 8] |= 1 << (i % 8);
        }
        println!("balloc: write bitmap block at sector {}", SB.bmapstart);
        self.wsect(SB.bmapstart, &buf)
    }

    fn iappend(&mut self, inum: u32, data: &[u8]) -> std::io::Result<()> {
        let mut din = self.rinode(inum)?;
        let mut off = din.size as usize;
        let mut p = 0usize;
        let mut n = data.len();

        while n > 0 {
            let fbn = off / BSIZE;
            assert!(fbn < MAXFILE);
            let x;
            if fbn < NDIRECT {
                if din.addrs[fbn] == 0 {
                    din.addrs[fbn] = self.freeblock;
                    self.freeblock += 1;
                }
                x = din.addrs[fbn];
            } else {
                if din.addrs[NDIRECT] == 0 {
                    din.addrs[NDIRECT] = self.freeblock;
                    self.freeblock += 1;
                }
                let mut ind = self.rsect(din.addrs[NDIRECT])?;
                let slot = (fbn - NDIRECT) * size_of::<u32>();
                let mut blockno = u32::from_le_bytes(ind[slot..slot + 4].try_into().unwrap());
                if blockno == 0 {
                    blockno = self.freeblock;
                    self.freeblock += 1;
                    ind[slot..slot + 4].copy_from_slice(&blockno.to_le_bytes());
                    self.wsect(din.addrs[NDIRECT], &ind)?;
                }
                x = blockno;
            }

            let n1 = cmp::min(n, (fbn + 1) * BSIZE - off);
            let mut buf = self.rsect(x)?;
            buf[off - fbn * BSIZE..off - fbn * BSIZE + n1].copy_from_slice(&data[p..p + n1]);
            self.wsect(x, &buf)?;

            n -= n1;
            off += n1;
            p += n1;
        }

        din.size = off as u32;
        self.winode(inum, din)
    }

    fn add_dirent(&mut self, dir_inum: u32, name: &[u8], inum: u32) -> std::io::Result<()> {
        let mut de = Dirent::zero();
        de.inum = inum as u16;
        de.name = kernel::fs::dirname(name);
        self.iappend(dir_inum, struct_bytes(&de))
    }
}

fn build_image(path: &Path, files: &[(Vec<u8>, Vec<u8>)]) -> std::io::Result<()> {
    let mut img = FsImage::create(path)?;

    let rootino = img.ialloc(T_DIR)?;
    assert_eq!(rootino, ROOTINO);

    img.add_dirent(rootino, b".", rootino)?;
    img.add_dirent(rootino, b"..", rootino)?;

    for (name, contents) in files {
        assert!(!name.contains(&b'/'));
        assert!(name.len() <= DIRSIZ);

        let inum = img.ialloc(T_FILE)?;
        img.add_dirent(rootino, name, inum)?;
        img.iappend(inum, contents)?;
    }

    // round the root directory size up to a whole block.
    let mut din = img.rinode(rootino)?;
    din.size = (din.size / BSIZE as u32 + 1) * BSIZE as u32;
    img.winode(rootino, din)?;

    img.balloc()
}

#[derive(Parser, Debug)]
struct Args {
    /// Name of the output img file
    #[arg(short, long)]
    output: String,

    /// Files to place in the image's root directory
    files: Vec<String>,
}

fn main() -> std::io::Result<()> {
    assert_eq!(size_of::<u32>(), 4);
    assert_eq!(BSIZE % size_of::<DINode>(), 0);
    assert_eq!(BSIZE % size_of::<Dirent>(), 0);

    let args = Args::parse();

    println!(
        "nmeta {} (boot, super, log blocks {} inode blocks {}, bitmap blocks {}) blocks {} total {}",
        NMETA, NLOG, NINODEBLOCKS, NBITMAP, NBLOCKS, FSSIZE
    );

    let mut files = Vec::new();
    for name in &args.files {
        let mut contents = Vec::new();
        File::open(name)?.read_to_end(&mut contents)?;

        // use the base name, and strip a leading underscore left
        // over from the user-program build.
        let base = name.rsplit('/').next().unwrap();
        let base = base.strip_prefix('_').unwrap_or(base);
        files.push((base.as_bytes().to_vec(), contents));
    }

    build_image(Path::new(&args.output), &files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use tempfile::tempdir;

    fn read_sb(img: &mut FsImage) -> SuperBlock {
        let buf = img.rsect(1).unwrap();
        unsafe { ptr::read_unaligned(buf.as_ptr() as *const SuperBlock) }
    }

    fn open_image(path: &Path) -> FsImage {
        FsImage {
            file: File::options().read(true).write(true).open(path).unwrap(),
            freeinode: 0,
            freeblock: 0,
        }
    }

    fn read_root_dirents(img: &mut FsImage) -> Vec<Dirent> {
        let din = img.rinode(ROOTINO).unwrap();
        assert_eq!(din.typ, T_DIR);
        let mut out = Vec::new();
        let mut off = 0usize;
        while off < din.size as usize {
            let fbn = off / BSIZE;
            let blockno = din.addrs[fbn];
            if blockno == 0 {
                break;
            }
            let buf = img.rsect(blockno).unwrap();
            let boff = off % BSIZE;
            let de: Dirent =
                unsafe { ptr::read_unaligned(buf[boff..].as_ptr() as *const Dirent) };
            if de.inum != 0 {
                out.push(de);
            }
            off += size_of::<Dirent>();
        }
        out
    }

    // walk an inode's block list and collect its contents.
    fn read_file(img: &mut FsImage, inum: u32) -> Vec<u8> {
        let din = img.rinode(inum).unwrap();
        let mut out = Vec::new();
        let mut remaining = din.size as usize;
        let mut fbn = 0usize;
        while remaining > 0 {
            let blockno = if fbn < NDIRECT {
                din.addrs[fbn]
            } else {
                let ind = img.rsect(din.addrs[NDIRECT]).unwrap();
                let slot = (fbn - NDIRECT) * 4;
                u32::from_le_bytes(ind[slot..slot + 4].try_into().unwrap())
            };
            let buf = img.rsect(blockno).unwrap();
            let n = cmp::min(remaining, BSIZE);
            out.extend_from_slice(&buf[..n]);
            remaining -= n;
            fbn += 1;
        }
        out
    }

    #[test]
    fn empty_image_has_valid_superblock_and_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.img");
        build_image(&path, &[]).unwrap();

        let mut img = open_image(&path);
        let sb = read_sb(&mut img);
        assert_eq!(sb.magic, FSMAGIC);
        assert_eq!(sb.size, FSSIZE);
        assert_eq!(sb.nlog, NLOG);
        assert_eq!(sb.logstart, 2);
        assert_eq!(sb.inodestart, 2 + NLOG);
        assert_eq!(sb.bmapstart, 2 + NLOG + NINODEBLOCKS);

        // the image is exactly FSSIZE blocks.
        assert_eq!(
            img.file.metadata().unwrap().len(),
            FSSIZE as u64 * BSIZE as u64
        );

        // root directory holds exactly "." and "..", both pointing at root.
        let dirents = read_root_dirents(&mut img);
        assert_eq!(dirents.len(), 2);
        assert!(dirents[0].name_matches(b"."));
        assert!(dirents[1].name_matches(b".."));
        assert_eq!(dirents[0].inum as u32, ROOTINO);
        assert_eq!(dirents[1].inum as u32, ROOTINO);

        // root size was rounded to a whole block.
        let din = img.rinode(ROOTINO).unwrap();
        assert_eq!(din.size as usize % BSIZE, 0);
        assert_eq!(din.nlink, 1);
    }

    #[test]
    fn bitmap_marks_meta_and_used_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.img");
        build_image(&path, &[(b"hello".to_vec(), b"hello, world\n".to_vec())]).unwrap();

        let mut img = open_image(&path);
        let sb = read_sb(&mut img);
        let bitmap = img.rsect(sb.bmapstart).unwrap();

        let bit = |b: u32| bitmap[b as usize / 8] & (1 << (b % 8)) != 0;

        // all metadata blocks are taken, including the bitmap itself.
        for b in 0..NMETA {
            assert!(bit(b), "meta block {} should be allocated", b);
        }
        // the root directory block and the file's data block are taken.
        assert!(bit(NMETA) && bit(NMETA + 1));
        // the next block is still free.
        assert!(!bit(NMETA + 2));
    }

    #[test]
    fn small_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.img");
        let body = b"hello".to_vec();
        build_image(&path, &[(b"f".to_vec(), body.clone())]).unwrap();

        let mut img = open_image(&path);
        let dirents = read_root_dirents(&mut img);
        let de = dirents.iter().find(|d| d.name_matches(b"f")).unwrap();

        let din = img.rinode(de.inum as u32).unwrap();
        assert_eq!(din.typ, T_FILE);
        assert_eq!(din.size as usize, body.len());
        assert_eq!(read_file(&mut img, de.inum as u32), body);
    }

    #[test]
    fn large_file_spills_into_indirect_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.img");

        // more than NDIRECT blocks of data forces the indirect block.
        let body: Vec<u8> = (0..(NDIRECT + 3) * BSIZE).map(|i| (i % 251) as u8).collect();
        build_image(&path, &[(b"big".to_vec(), body.clone())]).unwrap();

        let mut img = open_image(&path);
        let dirents = read_root_dirents(&mut img);
        let de = dirents.iter().find(|d| d.name_matches(b"big")).unwrap();

        let din = img.rinode(de.inum as u32).unwrap();
        assert_eq!(din.size as usize, body.len());
        assert!(din.addrs[NDIRECT] != 0, "indirect block should be in use");
        assert!(din.addrs.iter().take(NDIRECT).all(|&a| a != 0));
        assert_eq!(read_file(&mut img, de.inum as u32), body);
    }

    #[test]
    #[should_panic]
    fn appending_past_maxfile_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.img");
        let mut img = FsImage::create(&path).unwrap();
        let rootino = img.ialloc(T_DIR).unwrap();

        let inum = img.ialloc(T_FILE).unwrap();
        img.add_dirent(rootino, b"huge", inum).unwrap();

        // one block past the largest representable file.
        let block = vec![0u8; BSIZE];
        for _ in 0..MAXFILE + 1 {
            img.iappend(inum, &block).unwrap();
        }
    }
}
