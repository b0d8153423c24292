//! A virtio-blk driver for an xv6-style RISC-V kernel, fed by byte ports.
//!
//! Commands arrive on [`param::PORT_DISKCMD`], data moves through the
//! ports they name, and every command is answered with a short response.
//! See [`virtio::disk_msg`] for the wire format and
//! [`virtio::virtio_disk::VirtioDisk`] for the driver.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod kalloc;
pub mod memlayout;
pub mod param;
pub mod port;
pub mod printf;
pub mod riscv;
pub mod spinlock;
pub mod uart;
pub mod virtio;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use kernel::*;

// the kernel's one disk, one allocator and one console.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod kernel {
    use core::ptr::addr_of;

    use log::LevelFilter;

    use crate::kalloc::KMem;
    use crate::memlayout::{PHYSTOP, UART0, VIRTIO0};
    use crate::port::Ports;
    use crate::printf::Printer;
    use crate::uart::Uart;
    use crate::virtio::virtio_disk::VirtioDisk;

    extern "C" {
        // first address after kernel.
        // defined by kernel.ld.
        static end: u8;
    }

    pub static KMEM: KMem = KMem::new();

    static PRINTER: Printer<Uart> = Printer::new(Uart::new(UART0), LevelFilter::Info);

    static DISK: VirtioDisk = unsafe { VirtioDisk::new(VIRTIO0) };

    pub fn kinit() {
        unsafe { KMEM.freerange(addr_of!(end) as *mut u8, PHYSTOP as *mut u8) };
    }

    pub fn printfinit() {
        PRINTER.with_console(|uart| uart.init());
        // a second call finds the logger already installed.
        let _ = PRINTER.init();
    }

    pub fn virtio_disk_init() {
        if let Err(err) = DISK.init(&KMEM) {
            panic!("{}", err);
        }
    }

    pub fn virtio_disk_start<P: Ports>(ports: &mut P) {
        DISK.start(ports);
    }

    pub fn virtio_disk_intr<P: Ports>(ports: &mut P) {
        DISK.intr(ports);
    }
}
