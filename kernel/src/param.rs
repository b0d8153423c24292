pub const NUM: usize = 8; // virtio descriptors; must be a power of two
pub const BSIZE: usize = 1024; // disk block size
pub const SECTOR_SIZE: usize = 512; // virtio-blk sector size
pub const PORT_DISKCMD: u32 = 0; // port the disk driver takes commands from
pub const DISK_MSG_LEN: usize = 16; // mode + blockid + data port + msg port
pub const DISK_RESP_LEN: usize = 9; // mode + status + blockid

const _: () = assert!(NUM.is_power_of_two());
const _: () = assert!(BSIZE % SECTOR_SIZE == 0);
