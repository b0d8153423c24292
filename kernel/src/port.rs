//! Ports are the kernel's byte channels between subsystems. The disk
//! driver takes commands from one, answers on another, and moves block
//! data through a third; the kernel owns all of them.

pub type PortId = u32;

pub trait Ports {
    /// Bytes waiting on `port`.
    fn count(&self, port: PortId) -> usize;

    /// Consume up to `buf.len()` bytes from `port`. Returns how many were read.
    fn read(&mut self, port: PortId, buf: &mut [u8]) -> usize;

    /// Append `data` to `port`. Returns how many bytes were accepted.
    fn write(&mut self, port: PortId, data: &[u8]) -> usize;
}
