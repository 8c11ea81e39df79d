//
// driver for qemu's virtio disk device.
// uses qemu's mmio interface to virtio.
//
// qemu ... -drive file=fs.img,if=none,format=raw,id=x0 -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0
//

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::buf::Buf;
use crate::fs::BSIZE;
use crate::kalloc::KMEM;
use crate::memlayout::VIRTIO0;
use crate::proc::{sleep, wakeup};
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::virtio::*;

// the address of virtio mmio register r.
fn read_reg(r: usize) -> u32 {
    unsafe { ((VIRTIO0 + r) as *const u32).read_volatile() }
}

fn write_reg(r: usize, val: u32) {
    unsafe { ((VIRTIO0 + r) as *mut u32).write_volatile(val) }
}

#[derive(Clone, Copy)]
struct Info {
    b: *mut Buf,
    status: u8,
}

struct Disk {
    // a set (not a ring) of DMA descriptors, with which the
    // driver tells the device where to read and write individual
    // disk operations. there are NUM descriptors.
    // most commands consist of a "chain" (a linked list) of a couple of
    // these descriptors.
    desc: *mut VirtqDesc,

    // a ring in which the driver writes descriptor numbers
    // that the driver would like the device to process.  it only
    // includes the head descriptor of each chain. the ring has
    // NUM elements.
    avail: *mut VirtqAvail,

    // a ring in which the device writes descriptor numbers that
    // the device has finished processing (just the head of each chain).
    // there are NUM used ring entries.
    used: *mut VirtqUsed,

    // our own book-keeping.
    free: [bool; NUM], // is a descriptor free?
    used_idx: u16,     // we've looked this far in used[2..NUM].

    // track info about in-flight operations,
    // for use when completion interrupt arrives.
    // indexed by first descriptor index of chain.
    info: [Info; NUM],

    // disk command headers.
    // one-for-one with descriptors, for convenience.
    ops: [VirtioBlkReq; NUM],

    vdisk_lock: Spinlock,
}

static mut DISK: Disk = Disk {
    desc: ptr::null_mut(),
    avail: ptr::null_mut(),
    used: ptr::null_mut(),
    free: [false; NUM],
    used_idx: 0,
    info: [Info {
        b: ptr::null_mut(),
        status: 0,
    }; NUM],
    ops: [VirtioBlkReq {
        req_type: 0,
        reserved: 0,
        sector: 0,
    }; NUM],
    vdisk_lock: Spinlock::new("virtio_disk"),
};

pub fn virtio_disk_init() {
    if read_reg(VIRTIO_MMIO_MAGIC_VALUE) != 0x74726976
        || read_reg(VIRTIO_MMIO_VERSION) != 2
        || read_reg(VIRTIO_MMIO_DEVICE_ID) != 2
        || read_reg(VIRTIO_MMIO_VENDOR_ID) != 0x554d4551
    {
        panic!("could not find virtio disk");
    }

    let mut status = 0;

    // reset device
    write_reg(VIRTIO_MMIO_STATUS, status);

    // set ACKNOWLEDGE status bit
    status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // set DRIVER status bit
    status |= VIRTIO_CONFIG_S_DRIVER;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // negotiate features
    let mut features = read_reg(VIRTIO_MMIO_DEVICE_FEATURES);
    features &= !(1 << VIRTIO_BLK_F_RO);
    features &= !(1 << VIRTIO_BLK_F_SCSI);
    features &= !(1 << VIRTIO_BLK_F_CONFIG_WCE);
    features &= !(1 << VIRTIO_BLK_F_MQ);
    features &= !(1 << VIRTIO_F_ANY_LAYOUT);
    features &= !(1 << VIRTIO_RING_F_EVENT_IDX);
    features &= !(1 << VIRTIO_RING_F_INDIRECT_DESC);
    write_reg(VIRTIO_MMIO_DRIVER_FEATURES, features);

    // tell device that feature negotiation is complete.
    status |= VIRTIO_CONFIG_S_FEATURES_OK;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // re-read status to ensure FEATURES_OK is set.
    status = read_reg(VIRTIO_MMIO_STATUS);
    if status & VIRTIO_CONFIG_S_FEATURES_OK == 0 {
        panic!("virtio disk FEATURES_OK unset");
    }

    // initialize queue 0.
    write_reg(VIRTIO_MMIO_QUEUE_SEL, 0);

    // ensure queue 0 is not in use.
    if read_reg(VIRTIO_MMIO_QUEUE_READY) != 0 {
        panic!("virtio disk should not be ready");
    }

    // check maximum queue size.
    let max = read_reg(VIRTIO_MMIO_QUEUE_NUM_MAX);
    if max == 0 {
        panic!("virtio disk has no queue 0");
    }
    if (max as usize) < NUM {
        panic!("virtio disk max queue too short");
    }

    // allocate and zero queue memory.
    let disk = unsafe { &mut DISK };
    disk.desc = unsafe { KMEM.kalloc() } as *mut VirtqDesc;
    disk.avail = unsafe { KMEM.kalloc() } as *mut VirtqAvail;
    disk.used = unsafe { KMEM.kalloc() } as *mut VirtqUsed;
    if disk.desc.is_null() || disk.avail.is_null() || disk.used.is_null() {
        panic!("virtio disk kalloc");
    }
    memset(disk.desc as *mut u8, 0, PGSIZE);
    memset(disk.avail as *mut u8, 0, PGSIZE);
    memset(disk.used as *mut u8, 0, PGSIZE);

    // set queue size.
    write_reg(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

    // write physical addresses.
    write_reg(VIRTIO_MMIO_QUEUE_DESC_LOW, disk.desc as usize as u32);
    write_reg(VIRTIO_MMIO_QUEUE_DESC_HIGH, (disk.desc as usize >> 32) as u32);
    write_reg(VIRTIO_MMIO_DRIVER_DESC_LOW, disk.avail as usize as u32);
    write_reg(VIRTIO_MMIO_DRIVER_DESC_HIGH, (disk.avail as usize >> 32) as u32);
    write_reg(VIRTIO_MMIO_DEVICE_DESC_LOW, disk.used as usize as u32);
    write_reg(VIRTIO_MMIO_DEVICE_DESC_HIGH, (disk.used as usize >> 32) as u32);

    // queue is ready.
    write_reg(VIRTIO_MMIO_QUEUE_READY, 0x1);

    // all NUM descriptors start out unused.
    for i in 0..NUM {
        disk.free[i] = true;
    }

    // tell device we're completely ready.
    status |= VIRTIO_CONFIG_S_DRIVER_OK;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // plic.rs and trap.rs arrange for interrupts from VIRTIO0_IRQ.
}

impl Disk {
    // find a free descriptor, mark it non-free, return its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        for i in 0..NUM {
            if self.free[i] {
                self.free[i] = false;
                return Some(i);
            }
        }
        None
    }

    // mark a descriptor as free.
    fn free_desc(&mut self, i: usize) {
        if i >= NUM {
            panic!("free_desc 1");
        }
        if self.free[i] {
            panic!("free_desc 2");
        }
        unsafe {
            let d = self.desc.add(i);
            (*d).addr = 0;
            (*d).len = 0;
            (*d).flags = 0;
            (*d).next = 0;
        }
        self.free[i] = true;
        wakeup(ptr::addr_of!(self.free[0]) as usize);
    }

    // free a chain of descriptors.
    fn free_chain(&mut self, mut i: usize) {
        loop {
            let (flags, next) = unsafe {
                let d = self.desc.add(i);
                ((*d).flags, (*d).next)
            };
            self.free_desc(i);
            if flags & VRING_DESC_F_NEXT != 0 {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    // allocate three descriptors (they need not be contiguous).
    // disk transfers always use three descriptors.
    fn alloc3_desc(&mut self, idx: &mut [usize; 3]) -> bool {
        for i in 0..3 {
            match self.alloc_desc() {
                Some(d) => idx[i] = d,
                None => {
                    for j in 0..i {
                        self.free_desc(idx[j]);
                    }
                    return false;
                }
            }
        }
        true
    }
}

pub fn virtio_disk_rw(b: &mut Buf, write: bool) {
    let sector = b.blockno as u64 * (BSIZE / 512) as u64;
    let disk = unsafe { &mut DISK };

    disk.vdisk_lock.acquire();

    // the spec's Section 5.2 says that legacy block operations use
    // three descriptors: one for type/reserved/sector, one for the
    // data, one for a 1-byte status result.

    // allocate the three descriptors.
    let mut idx = [0usize; 3];
    loop {
        if disk.alloc3_desc(&mut idx) {
            break;
        }
        sleep(ptr::addr_of!(disk.free[0]) as usize, &disk.vdisk_lock);
    }

    // format the three descriptors.

    let buf0 = &mut disk.ops[idx[0]];
    buf0.req_type = if write {
        VIRTIO_BLK_T_OUT // write the disk
    } else {
        VIRTIO_BLK_T_IN // read the disk
    };
    buf0.reserved = 0;
    buf0.sector = sector;

    unsafe {
        let d0 = disk.desc.add(idx[0]);
        (*d0).addr = buf0 as *mut VirtioBlkReq as u64;
        (*d0).len = core::mem::size_of::<VirtioBlkReq>() as u32;
        (*d0).flags = VRING_DESC_F_NEXT;
        (*d0).next = idx[1] as u16;

        let d1 = disk.desc.add(idx[1]);
        (*d1).addr = b.data.as_mut_ptr() as u64;
        (*d1).len = BSIZE as u32;
        (*d1).flags = if write {
            0 // device reads b.data
        } else {
            VRING_DESC_F_WRITE // device writes b.data
        };
        (*d1).flags |= VRING_DESC_F_NEXT;
        (*d1).next = idx[2] as u16;

        disk.info[idx[0]].status = 0xff; // device writes 0 on success
        let d2 = disk.desc.add(idx[2]);
        (*d2).addr = ptr::addr_of_mut!(disk.info[idx[0]].status) as u64;
        (*d2).len = 1;
        (*d2).flags = VRING_DESC_F_WRITE; // device writes the status
        (*d2).next = 0;
    }

    // record struct buf for virtio_disk_intr().
    b.disk = true;
    disk.info[idx[0]].b = b as *mut Buf;

    unsafe {
        // tell the device the first index in our chain of descriptors.
        let avail = disk.avail;
        let avail_idx = (*avail).idx;
        (*avail).ring[avail_idx as usize % NUM] = idx[0] as u16;

        fence(Ordering::SeqCst);

        // tell the device another avail ring entry is available.
        (*avail).idx = avail_idx.wrapping_add(1);

        fence(Ordering::SeqCst);
    }

    write_reg(VIRTIO_MMIO_QUEUE_NOTIFY, 0); // value is queue number

    // Wait for virtio_disk_intr() to say request has finished.
    while b.disk {
        sleep(b as *const Buf as usize, &disk.vdisk_lock);
    }

    disk.info[idx[0]].b = ptr::null_mut();
    disk.free_chain(idx[0]);

    disk.vdisk_lock.release();
}

pub fn virtio_disk_intr() {
    let disk = unsafe { &mut DISK };

    disk.vdisk_lock.acquire();

    // the device won't raise another interrupt until we tell it
    // we've seen this interrupt, which the following line does.
    // this may race with the device writing new entries to
    // the "used" ring, in which case we may process the new
    // completion entries in this interrupt, and have nothing to do
    // in the next interrupt, which is harmless.
    write_reg(
        VIRTIO_MMIO_INTERRUPT_ACK,
        read_reg(VIRTIO_MMIO_INTERRUPT_STATUS) & 0x3,
    );

    fence(Ordering::SeqCst);

    // the device increments disk.used->idx when it
    // adds an entry to the used ring.

    loop {
        let used_idx = unsafe { ptr::addr_of!((*disk.used).idx).read_volatile() };
        if disk.used_idx == used_idx {
            break;
        }
        fence(Ordering::SeqCst);

        let id = unsafe { (*disk.used).ring[disk.used_idx as usize % NUM].id } as usize;

        if disk.info[id].status != 0 {
            panic!("virtio_disk_intr status");
        }

        let b = disk.info[id].b;
        unsafe {
            (*b).disk = false; // disk is done with buf
        }
        wakeup(b as usize);

        disk.used_idx = disk.used_idx.wrapping_add(1);
    }

    disk.vdisk_lock.release();
}
