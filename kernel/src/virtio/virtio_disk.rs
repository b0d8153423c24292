//
// driver for qemu's virtio disk device.
// uses qemu's mmio interface to virtio.
//
// qemu ... -drive file=fs.img,if=none,format=raw,id=x0 -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0
//
// other kernel subsystems drive the disk through ports: a command on
// PORT_DISKCMD names the block, the port its data comes from or goes to,
// and the port the answer goes to. see disk_msg.rs for the wire format.
//

use core::mem::size_of;
use core::ptr::{self, addr_of, addr_of_mut};

use log::{debug, info, warn};
use thiserror::Error;
use tock_registers::fields::FieldValue;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use super::disk_msg::{DiskMode, DiskMsg, DiskResp};
use super::virtqueue::Virtqueue;
use super::*;
use crate::kalloc::KMem;
use crate::param::{BSIZE, DISK_MSG_LEN, NUM, PORT_DISKCMD, SECTOR_SIZE};
use crate::port::{PortId, Ports};
use crate::riscv::{__sync_synchronize, PGSIZE};
use crate::spinlock::Spinlock;

/// Why the disk could not be brought up. Every one of these leaves the
/// kernel without a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("could not find virtio disk: magic {0:#x}")]
    BadMagic(u32),
    #[error("could not find virtio disk: version {0}")]
    BadVersion(u32),
    #[error("could not find virtio disk: device id {0}")]
    BadDeviceId(u32),
    #[error("could not find virtio disk: vendor {0:#x}")]
    BadVendor(u32),
    #[error("virtio disk FEATURES_OK unset")]
    FeaturesRejected,
    #[error("virtio disk should not be ready")]
    QueueInUse,
    #[error("virtio disk has no queue 0")]
    NoQueue,
    #[error("virtio disk max queue too short: {0}")]
    QueueTooShort(u32),
    #[error("virtio disk kalloc")]
    OutOfMemory,
}

// the device overwrites this with 0 on success.
const STATUS_PENDING: u8 = 0xff;

// track info about in-flight operations,
// for use when completion interrupt arrives.
#[derive(Copy, Clone)]
struct Info {
    mode: DiskMode,
    blockid: u32,
    data_port: PortId,
    msg_port: PortId,
    status: u8,
}

impl Info {
    const fn empty() -> Self {
        Info {
            mode: DiskMode::Read,
            blockid: 0,
            data_port: 0,
            msg_port: 0,
            status: 0,
        }
    }
}

// staging area between a data port and the device.
#[derive(Copy, Clone)]
#[repr(C, align(4096))]
struct DiskBuf {
    data: [u8; BSIZE],
}

const _: () = assert!(core::mem::align_of::<DiskBuf>() == PGSIZE);

struct Disk {
    queue: Virtqueue,

    // indexed by first descriptor index of chain.
    info: [Info; NUM],

    // disk command headers.
    // one-for-one with descriptors, for convenience.
    ops: [VirtioBlkReq; NUM],

    // port data may not line up with anything the device can DMA
    // to, so blocks are staged here, again indexed by the head of
    // the chain.
    buffer: [DiskBuf; NUM],
}

/// A virtio block device, shared between the code that submits
/// commands and the interrupt handler that completes them.
///
/// The device is told where this structure's buffers are, so it must
/// not move once `init` has succeeded. Until then `start` and `intr`
/// find nothing to do.
pub struct VirtioDisk {
    base: usize,
    disk: Spinlock<Disk>,
}

impl VirtioDisk {
    /// A driver for the virtio-mmio register block at `base`. Nothing
    /// is said to the device until `init`.
    ///
    /// # Safety
    ///
    /// `base` must be the address of a virtio-mmio register block that
    /// nothing else drives.
    pub const unsafe fn new(base: usize) -> Self {
        VirtioDisk {
            base,
            disk: Spinlock::new(
                "virtio_disk",
                Disk {
                    queue: Virtqueue::empty(),
                    info: [Info::empty(); NUM],
                    ops: [VirtioBlkReq {
                        type_: 0,
                        reserved: 0,
                        sector: 0,
                    }; NUM],
                    buffer: [DiskBuf { data: [0; BSIZE] }; NUM],
                },
            ),
        }
    }

    fn regs(&self) -> &VirtioMmioRegisters {
        unsafe { &*(self.base as *const VirtioMmioRegisters) }
    }

    /// Negotiate with the device and set up queue 0, taking its three
    /// pages from `kmem`.
    pub fn init(&self, kmem: &KMem) -> Result<(), InitError> {
        let regs = self.regs();
        let mut disk = self.disk.lock();
        if !disk.queue.is_empty() {
            panic!("virtio_disk_init twice");
        }

        let magic = regs.magic_value.get();
        if magic != VIRTIO_MAGIC {
            return Err(InitError::BadMagic(magic));
        }
        let version = regs.version.get();
        if version != VIRTIO_VERSION {
            return Err(InitError::BadVersion(version));
        }
        let device_id = regs.device_id.get();
        if device_id != VIRTIO_DEVICE_BLK {
            return Err(InitError::BadDeviceId(device_id));
        }
        let vendor = regs.vendor_id.get();
        if vendor != VIRTIO_VENDOR_QEMU {
            return Err(InitError::BadVendor(vendor));
        }

        // reset device
        regs.status.set(0);

        disk.queue = negotiate(regs, kmem).map_err(|err| {
            // let the device know we gave up on it.
            regs.status.modify(DeviceStatus::FAILED::SET);
            err
        })?;

        // tell device we're completely ready.
        regs.status.modify(DeviceStatus::DRIVER_OK::SET);
        Ok(())
    }

    /// Take one command off PORT_DISKCMD and hand it to the device.
    ///
    /// Does nothing if no whole command is waiting or all descriptors
    /// are in use; the command stays queued for a later call.
    pub fn start<P: Ports>(&self, ports: &mut P) {
        self.disk.lock().start(self.regs(), ports);
    }

    /// The disk interrupt handler: answer every finished command, then
    /// try to start another one.
    pub fn intr<P: Ports>(&self, ports: &mut P) {
        let regs = self.regs();
        let mut disk = self.disk.lock();

        // the device won't raise another interrupt until we tell it
        // we've seen this one. a completion that lands after the ack
        // is picked up by the loop below or by the next interrupt.
        let isr = regs.interrupt_status.extract();
        regs.interrupt_ack.write(
            InterruptStatus::USED_BUFFER.val(isr.read(InterruptStatus::USED_BUFFER))
                + InterruptStatus::CONFIG_CHANGE.val(isr.read(InterruptStatus::CONFIG_CHANGE)),
        );

        __sync_synchronize();

        while let Some(id) = disk.queue.used_head() {
            disk.complete(id, ports);
            disk.queue.pop_used();
        }

        // a command may have been waiting for descriptors.
        disk.start(regs, ports);
    }

    /// Descriptors not owned by any in-flight command.
    pub fn free_descriptors(&self) -> usize {
        self.disk.lock().queue.num_free()
    }

    /// Commands handed to the device and not yet answered.
    pub fn in_flight(&self) -> usize {
        let disk = self.disk.lock();
        if disk.queue.is_empty() {
            return 0;
        }
        (NUM - disk.queue.num_free()) / 3
    }
}

fn write_status(regs: &VirtioMmioRegisters, status: FieldValue<u32, DeviceStatus::Register>) {
    regs.status.write(status);
    // the test device may decline some bits.
    #[cfg(test)]
    super::tests::device_takes_status(regs);
}

// status handshake, feature negotiation and queue 0 setup.
// the device has just been reset.
fn negotiate(regs: &VirtioMmioRegisters, kmem: &KMem) -> Result<Virtqueue, InitError> {
    // set ACKNOWLEDGE status bit
    let mut status = DeviceStatus::ACKNOWLEDGE::SET;
    write_status(regs, status);

    // set DRIVER status bit
    status += DeviceStatus::DRIVER::SET;
    write_status(regs, status);

    // negotiate features
    let mut features = regs.device_features.extract();
    features.modify(
        BlkFeatures::RO::CLEAR
            + BlkFeatures::SCSI::CLEAR
            + BlkFeatures::CONFIG_WCE::CLEAR
            + BlkFeatures::MQ::CLEAR
            + BlkFeatures::ANY_LAYOUT::CLEAR
            + BlkFeatures::RING_EVENT_IDX::CLEAR
            + BlkFeatures::RING_INDIRECT_DESC::CLEAR,
    );
    regs.driver_features.set(features.get());

    // tell device that feature negotiation is complete.
    status += DeviceStatus::FEATURES_OK::SET;
    write_status(regs, status);

    // re-read status to ensure FEATURES_OK is set.
    if !regs.status.is_set(DeviceStatus::FEATURES_OK) {
        return Err(InitError::FeaturesRejected);
    }

    // initialize queue 0.
    regs.queue_sel.set(0);

    // ensure queue 0 is not in use.
    if regs.queue_ready.get() != 0 {
        return Err(InitError::QueueInUse);
    }

    // check maximum queue size.
    let max = regs.queue_num_max.get();
    if max == 0 {
        return Err(InitError::NoQueue);
    }
    if (max as usize) < NUM {
        return Err(InitError::QueueTooShort(max));
    }

    // allocate and zero queue memory.
    let pages = [kmem.kalloc(), kmem.kalloc(), kmem.kalloc()];
    let [Some(desc), Some(avail), Some(used)] = pages else {
        for page in pages.into_iter().flatten() {
            unsafe { kmem.kfree(page.as_ptr()) };
        }
        return Err(InitError::OutOfMemory);
    };
    for page in [desc, avail, used] {
        unsafe { ptr::write_bytes(page.as_ptr(), 0, PGSIZE) };
    }
    let queue = unsafe {
        Virtqueue::new(
            desc.as_ptr().cast(),
            avail.as_ptr().cast(),
            used.as_ptr().cast(),
        )
    };

    // set queue size.
    regs.queue_num.set(NUM as u32);

    // write physical addresses.
    let (desc, avail, used) = queue.addrs();
    regs.queue_desc_low.set(desc as u32);
    regs.queue_desc_high.set((desc >> 32) as u32);
    regs.driver_desc_low.set(avail as u32);
    regs.driver_desc_high.set((avail >> 32) as u32);
    regs.device_desc_low.set(used as u32);
    regs.device_desc_high.set((used >> 32) as u32);

    // queue is ready.
    regs.queue_ready.set(0x1);

    info!(
        "virtio disk: features {:#x}, queue 0 with {} of {} descriptors",
        features.get(),
        NUM,
        max
    );
    Ok(queue)
}

impl Disk {
    fn start<P: Ports>(&mut self, regs: &VirtioMmioRegisters, ports: &mut P) {
        // is there a disk message waiting for us?
        if ports.count(PORT_DISKCMD) < DISK_MSG_LEN {
            return;
        }

        // all three descriptors, or try again later.
        let Some(idx) = self.queue.alloc3_desc() else {
            return;
        };

        let mut raw = [0u8; DISK_MSG_LEN];
        let n = ports.read(PORT_DISKCMD, &mut raw);
        let msg = match DiskMsg::parse(&raw[..n]) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("virtio disk: {}", err);
                if let Some(resp) = DiskMsg::salvage(&raw[..n]) {
                    send(ports, resp);
                }
                self.queue.free_descs(&idx);
                return;
            }
        };

        let mode = match DiskMode::try_from(msg.mode) {
            Ok(mode) => mode,
            Err(bad) => {
                warn!("virtio disk: bad mode {:#04x} for block {}", bad, msg.blockid);
                return self.reject(ports, &msg, &idx);
            }
        };

        // writes bring exactly one block; reads bring nothing and get
        // the block back on the same port.
        let waiting = ports.count(msg.data_port);
        let want = match mode {
            DiskMode::Read => 0,
            DiskMode::Write => BSIZE,
        };
        if waiting != want {
            warn!(
                "virtio disk: {:?} of block {} with {} bytes on port {}",
                mode, msg.blockid, waiting, msg.data_port
            );
            return self.reject(ports, &msg, &idx);
        }

        let head = idx[0];
        if mode == DiskMode::Write {
            let got = ports.read(msg.data_port, &mut self.buffer[head].data);
            if got != BSIZE {
                warn!("virtio disk: port {} gave {} of {} bytes", msg.data_port, got, BSIZE);
                return self.reject(ports, &msg, &idx);
            }
        }

        let sector = u64::from(msg.blockid) * (BSIZE / SECTOR_SIZE) as u64;

        self.info[head] = Info {
            mode,
            blockid: msg.blockid,
            data_port: msg.data_port,
            msg_port: msg.msg_port,
            status: STATUS_PENDING,
        };
        self.ops[head] = VirtioBlkReq {
            type_: match mode {
                DiskMode::Read => VIRTIO_BLK_T_IN,
                DiskMode::Write => VIRTIO_BLK_T_OUT,
            },
            reserved: 0,
            sector,
        };

        self.queue.set_desc(
            idx[0],
            addr_of!(self.ops[head]) as usize as u64,
            size_of::<VirtioBlkReq>() as u32,
            VirtqDescFlags::NEXT,
            idx[1] as u16,
        );

        let data_flags = match mode {
            // device writes the buffer
            DiskMode::Read => VirtqDescFlags::NEXT | VirtqDescFlags::WRITE,
            // device reads the buffer
            DiskMode::Write => VirtqDescFlags::NEXT,
        };
        self.queue.set_desc(
            idx[1],
            addr_of!(self.buffer[head].data) as usize as u64,
            BSIZE as u32,
            data_flags,
            idx[2] as u16,
        );

        // device writes the status byte
        self.queue.set_desc(
            idx[2],
            addr_of_mut!(self.info[head].status) as usize as u64,
            1,
            VirtqDescFlags::WRITE,
            0,
        );

        self.queue.submit(head);

        regs.queue_notify.set(0); // value is queue number

        debug!(
            "virtio disk: {:?} block {} (sector {}) on descriptors {:?}",
            mode, msg.blockid, sector, idx
        );
    }

    // refuse a command before the device ever sees it.
    fn reject<P: Ports>(&mut self, ports: &mut P, msg: &DiskMsg, idx: &[usize; 3]) {
        send(ports, DiskResp::failed(msg.mode, msg.blockid, msg.msg_port));
        self.queue.free_descs(idx);
    }

    // the chain starting at descriptor id is back from the device.
    fn complete<P: Ports>(&mut self, id: usize, ports: &mut P) {
        // the id comes from the device. one that names no in-flight
        // chain means the used ring can't be trusted any more, so a
        // misbehaving device is fatal.
        if id >= NUM || self.queue.is_free(id) {
            panic!("virtio_disk_intr id {}", id);
        }

        let info = self.info[id];
        // written by the device, not by us.
        let status = unsafe { ptr::read_volatile(addr_of!(self.info[id].status)) };

        if status != 0 {
            warn!(
                "virtio disk: {:?} of block {} failed with status {}",
                info.mode, info.blockid, status
            );
            send(ports, DiskResp::failed(info.mode.as_byte(), info.blockid, info.msg_port));
        } else {
            if info.mode == DiskMode::Read {
                let put = ports.write(info.data_port, &self.buffer[id].data);
                if put != BSIZE {
                    warn!("virtio disk: port {} took {} of {} bytes", info.data_port, put, BSIZE);
                }
            }
            debug!("virtio disk: {:?} block {} done", info.mode, info.blockid);
            send(ports, DiskResp::ok(info.mode, info.blockid, info.msg_port));
        }

        self.queue.free_chain(id);
    }
}

fn send<P: Ports>(ports: &mut P, resp: DiskResp) {
    let raw = resp.encode();
    if ports.write(resp.port, &raw) != raw.len() {
        warn!("virtio disk: response to port {} cut short", resp.port);
    }
}
