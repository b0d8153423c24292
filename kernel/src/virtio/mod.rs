pub mod disk_msg;
pub mod virtio_disk;
mod virtqueue;


//
// virtio device definitions.
// for both the mmio interface, and virtio descriptors.
// only tested with qemu.
//
// the virtio 1.1 standard:
// https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf
//

use bitflags::bitflags;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::{register_bitfields, register_structs};

use crate::param::NUM;
use crate::riscv::PGSIZE;

pub const VIRTIO_MAGIC: u32 = 0x7472_6976; // "virt"
pub const VIRTIO_VERSION: u32 = 2;
pub const VIRTIO_DEVICE_BLK: u32 = 2; // device type; 1 is net, 2 is disk
pub const VIRTIO_VENDOR_QEMU: u32 = 0x554d_4551; // "QEMU"

// virtio mmio control registers, mapped starting at 0x10001000.
// from qemu virtio_mmio.h
register_structs! {
    pub VirtioMmioRegisters {
        (0x000 => magic_value: ReadOnly<u32>),
        (0x004 => version: ReadOnly<u32>),
        (0x008 => device_id: ReadOnly<u32>),
        (0x00c => vendor_id: ReadOnly<u32>),
        (0x010 => device_features: ReadOnly<u32, BlkFeatures::Register>),
        (0x014 => _reserved0),
        (0x020 => driver_features: WriteOnly<u32, BlkFeatures::Register>),
        (0x024 => _reserved1),
        (0x030 => queue_sel: WriteOnly<u32>),
        (0x034 => queue_num_max: ReadOnly<u32>),
        (0x038 => queue_num: WriteOnly<u32>),
        (0x03c => _reserved2),
        (0x044 => queue_ready: ReadWrite<u32>),
        (0x048 => _reserved3),
        (0x050 => queue_notify: WriteOnly<u32>),
        (0x054 => _reserved4),
        (0x060 => interrupt_status: ReadOnly<u32, InterruptStatus::Register>),
        (0x064 => interrupt_ack: WriteOnly<u32, InterruptStatus::Register>),
        (0x068 => _reserved5),
        (0x070 => status: ReadWrite<u32, DeviceStatus::Register>),
        (0x074 => _reserved6),
        // physical address for descriptor table
        (0x080 => queue_desc_low: WriteOnly<u32>),
        (0x084 => queue_desc_high: WriteOnly<u32>),
        (0x088 => _reserved7),
        // physical address for available ring
        (0x090 => driver_desc_low: WriteOnly<u32>),
        (0x094 => driver_desc_high: WriteOnly<u32>),
        (0x098 => _reserved8),
        // physical address for used ring
        (0x0a0 => device_desc_low: WriteOnly<u32>),
        (0x0a4 => device_desc_high: WriteOnly<u32>),
        (0x0a8 => @END),
    }
}

register_bitfields![u32,
    // status register bits, from qemu virtio_config.h
    DeviceStatus [
        ACKNOWLEDGE OFFSET(0) NUMBITS(1) [],
        DRIVER OFFSET(1) NUMBITS(1) [],
        DRIVER_OK OFFSET(2) NUMBITS(1) [],
        FEATURES_OK OFFSET(3) NUMBITS(1) [],
        FAILED OFFSET(7) NUMBITS(1) []
    ],
    // device feature bits
    BlkFeatures [
        RO OFFSET(5) NUMBITS(1) [],          // Disk is read-only
        SCSI OFFSET(7) NUMBITS(1) [],        // Supports scsi command passthru
        CONFIG_WCE OFFSET(11) NUMBITS(1) [], // Writeback mode available in config
        MQ OFFSET(12) NUMBITS(1) [],         // support more than one vq
        ANY_LAYOUT OFFSET(27) NUMBITS(1) [],
        RING_INDIRECT_DESC OFFSET(28) NUMBITS(1) [],
        RING_EVENT_IDX OFFSET(29) NUMBITS(1) []
    ],
    InterruptStatus [
        USED_BUFFER OFFSET(0) NUMBITS(1) [],
        CONFIG_CHANGE OFFSET(1) NUMBITS(1) []
    ]
];

// a single descriptor, as laid out by virtio.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
#[repr(C)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct VirtqDescFlags: u16 {
        const NEXT = 1; // chained with another descriptor
        const WRITE = 2; // device writes (vs read)
    }
}

// the (entire) avail ring.
#[allow(dead_code)]
#[repr(C)]
struct VirtqAvail {
    flags: u16,       // always zero
    idx: u16,         // driver will write ring[idx] next
    ring: [u16; NUM], // descriptor numbers of chain heads
    unused: u16,
}

// one entry in the "used" ring, with which the
// device tells the driver about completed requests.
#[derive(Copy, Clone)]
#[allow(dead_code)]
#[repr(C)]
struct VirtqUsedElem {
    id: u32, // index of start of completed descriptor chain
    len: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct VirtqUsed {
    flags: u16, // always zero
    idx: u16,   // device increments when it adds a ring[] entry
    ring: [VirtqUsedElem; NUM],
}

// these are specific to virtio block devices, e.g. disks,
// described in Section 5.2 of the virtio standard.

const VIRTIO_BLK_T_IN: u32 = 0; // read the disk
const VIRTIO_BLK_T_OUT: u32 = 1; // write the disk

// the format of the first descriptor in a disk request.
// to be followed by two more descriptors containing
// the block, and a one-byte status.
#[derive(Copy, Clone, Default)]
#[allow(dead_code)]
#[repr(C)]
struct VirtioBlkReq {
    type_: u32, // VIRTIO_BLK_T_IN or ..._OUT
    reserved: u32,
    sector: u64,
}

// each of the three structures gets a page of its own.
const _: () = assert!(core::mem::size_of::<[VirtqDesc; NUM]>() <= PGSIZE);
const _: () = assert!(core::mem::size_of::<VirtqAvail>() <= PGSIZE);
const _: () = assert!(core::mem::size_of::<VirtqUsed>() <= PGSIZE);
