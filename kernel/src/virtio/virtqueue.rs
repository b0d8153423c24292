use core::ptr::{self, addr_of, addr_of_mut};

use super::{VirtqAvail, VirtqDesc, VirtqDescFlags, VirtqUsed};
use crate::param::NUM;
use crate::riscv::__sync_synchronize;

/// The driver's side of virtqueue 0: the three pages it shares with the
/// device, plus the driver's own book-keeping about them.
pub(super) struct Virtqueue {
    // a set (not a ring) of DMA descriptors, with which the
    // driver tells the device where to read and write individual
    // disk operations. there are NUM descriptors.
    // disk commands are a "chain" (a linked list) of three of them.
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

    free: [bool; NUM], // is a descriptor free?
    used_idx: u16,     // we've looked this far in used.ring.
}

// Only ever touched with the disk lock held.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// A queue with no memory behind it, and so no free descriptors
    /// and nothing ever used.
    pub(super) const fn empty() -> Self {
        Self {
            desc: ptr::null_mut(),
            avail: ptr::null_mut(),
            used: ptr::null_mut(),
            free: [false; NUM],
            used_idx: 0,
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.desc.is_null()
    }

    /// # Safety
    ///
    /// Each pointer must be a zeroed page that only this queue and the
    /// device touch from now on.
    pub(super) unsafe fn new(
        desc: *mut VirtqDesc,
        avail: *mut VirtqAvail,
        used: *mut VirtqUsed,
    ) -> Self {
        Self {
            desc,
            avail,
            used,
            // all NUM descriptors start out unused.
            free: [true; NUM],
            used_idx: 0,
        }
    }

    /// Physical addresses of the descriptor table, avail ring and used ring.
    pub(super) fn addrs(&self) -> (u64, u64, u64) {
        (
            self.desc as usize as u64,
            self.avail as usize as u64,
            self.used as usize as u64,
        )
    }

    // find a free descriptor, mark it non-free, return its index.
    pub(super) fn alloc_desc(&mut self) -> Option<usize> {
        let i = self.free.iter().position(|&free| free)?;
        self.free[i] = false;
        Some(i)
    }

    // mark a descriptor as free.
    pub(super) fn free_desc(&mut self, i: usize) {
        if i >= NUM {
            panic!("free_desc 1");
        }
        if self.free[i] {
            panic!("free_desc 2");
        }
        unsafe { ptr::write_volatile(self.desc.add(i), VirtqDesc::default()) };
        self.free[i] = true;
    }

    // free a chain of descriptors.
    pub(super) fn free_chain(&mut self, mut i: usize) {
        loop {
            let desc = self.desc(i);
            self.free_desc(i);
            if VirtqDescFlags::from_bits_retain(desc.flags).contains(VirtqDescFlags::NEXT) {
                i = desc.next as usize;
            } else {
                break;
            }
        }
    }

    // free descriptors that were never linked into a chain.
    pub(super) fn free_descs(&mut self, idx: &[usize]) {
        for &i in idx {
            self.free_desc(i);
        }
    }

    // allocate three descriptors (they need not be contiguous).
    // disk transfers always use three descriptors.
    pub(super) fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let mut idx = [0; 3];
        for n in 0..idx.len() {
            match self.alloc_desc() {
                Some(i) => idx[n] = i,
                None => {
                    self.free_descs(&idx[..n]);
                    return None;
                }
            }
        }
        Some(idx)
    }

    pub(super) fn num_free(&self) -> usize {
        self.free.iter().filter(|&&free| free).count()
    }

    pub(super) fn is_free(&self, i: usize) -> bool {
        self.free[i]
    }

    pub(super) fn desc(&self, i: usize) -> VirtqDesc {
        assert!(i < NUM, "desc {}", i);
        unsafe { ptr::read_volatile(self.desc.add(i)) }
    }

    pub(super) fn set_desc(
        &mut self,
        i: usize,
        addr: u64,
        len: u32,
        flags: VirtqDescFlags,
        next: u16,
    ) {
        assert!(!self.free[i], "set_desc on free descriptor {}", i);
        let desc = VirtqDesc {
            addr,
            len,
            flags: flags.bits(),
            next,
        };
        unsafe { ptr::write_volatile(self.desc.add(i), desc) };
    }

    /// Hand the chain starting at `head` to the device.
    pub(super) fn submit(&mut self, head: usize) {
        unsafe {
            let idx = ptr::read_volatile(addr_of!((*self.avail).idx));

            // tell the device the first index in our chain of descriptors.
            ptr::write_volatile(addr_of_mut!((*self.avail).ring[idx as usize % NUM]), head as u16);

            __sync_synchronize();

            // tell the device another avail ring entry is available.
            // not % NUM ...
            ptr::write_volatile(addr_of_mut!((*self.avail).idx), idx.wrapping_add(1));

            __sync_synchronize();
        }
    }

    /// Head of the oldest completed chain not yet seen by the driver.
    pub(super) fn used_head(&self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        unsafe {
            // the device increments used.idx when it adds an entry to the used ring.
            if ptr::read_volatile(addr_of!((*self.used).idx)) == self.used_idx {
                return None;
            }
            let slot = self.used_idx as usize % NUM;
            let id = ptr::read_volatile(addr_of!((*self.used).ring[slot].id));
            __sync_synchronize();
            Some(id as usize)
        }
    }

    /// Step past the entry `used_head` returned.
    pub(super) fn pop_used(&mut self) {
        self.used_idx = self.used_idx.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::Page;
    use crate::riscv::PGSIZE;
    use proptest::prelude::*;
    use std::vec::Vec;

    struct Rings {
        pages: Vec<Page>,
    }

    impl Rings {
        fn new() -> Self {
            Self {
                pages: (0..3).map(|_| Page([0; PGSIZE])).collect(),
            }
        }

        fn queue(&mut self) -> Virtqueue {
            let base = self.pages.as_mut_ptr();
            unsafe { Virtqueue::new(base.cast(), base.add(1).cast(), base.add(2).cast()) }
        }
    }

    fn chain(q: &mut Virtqueue, idx: [usize; 3]) {
        let next = VirtqDescFlags::NEXT;
        q.set_desc(idx[0], 0x1000, 16, next, idx[1] as u16);
        q.set_desc(idx[1], 0x2000, 1024, next | VirtqDescFlags::WRITE, idx[2] as u16);
        q.set_desc(idx[2], 0x3000, 1, VirtqDescFlags::WRITE, 0);
    }

    #[test]
    fn allocates_lowest_free_slot() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        assert_eq!(q.alloc3_desc(), Some([0, 1, 2]));
        assert_eq!(q.alloc_desc(), Some(3));
        q.free_desc(1);
        assert_eq!(q.alloc_desc(), Some(1));
        assert_eq!(q.num_free(), NUM - 4);
    }

    #[test]
    fn failed_chain_allocation_releases_partial_chain() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        assert!(q.alloc3_desc().is_some());
        assert!(q.alloc3_desc().is_some());
        assert_eq!(q.num_free(), 2);
        assert_eq!(q.alloc3_desc(), None);
        assert_eq!(q.num_free(), 2);
        assert!(q.is_free(6) && q.is_free(7));
    }

    #[test]
    fn free_chain_releases_and_zeroes_whole_chain() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        q.alloc_desc();
        let idx = q.alloc3_desc().unwrap();
        assert_eq!(idx, [1, 2, 3]);
        chain(&mut q, idx);
        assert_eq!(q.desc(1).next, 2);

        q.free_chain(1);
        assert_eq!(q.num_free(), NUM - 1);
        assert!(!q.is_free(0));
        for i in idx {
            assert_eq!(q.desc(i), VirtqDesc::default());
        }
    }

    #[test]
    #[should_panic(expected = "free_desc 2")]
    fn double_free_is_fatal() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        let i = q.alloc_desc().unwrap();
        q.free_desc(i);
        q.free_desc(i);
    }

    #[test]
    #[should_panic(expected = "free_desc 1")]
    fn out_of_range_free_is_fatal() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        q.free_desc(NUM);
    }

    #[test]
    fn empty_queue_has_nothing_to_give() {
        let mut q = Virtqueue::empty();
        assert!(q.is_empty());
        assert_eq!(q.alloc3_desc(), None);
        assert_eq!(q.used_head(), None);
        assert_eq!(q.num_free(), 0);
    }

    #[test]
    fn avail_index_wraps_without_modulo() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        unsafe { (*q.avail).idx = u16::MAX };
        q.submit(5);
        unsafe {
            assert_eq!((*q.avail).ring[u16::MAX as usize % NUM], 5);
            assert_eq!((*q.avail).idx, 0);
        }
        q.submit(2);
        unsafe {
            assert_eq!((*q.avail).ring[0], 2);
            assert_eq!((*q.avail).idx, 1);
        }
    }

    #[test]
    fn used_cursor_follows_device_across_wrap() {
        let mut rings = Rings::new();
        let mut q = rings.queue();
        q.used_idx = u16::MAX;
        unsafe { (*q.used).idx = u16::MAX };
        assert_eq!(q.used_head(), None);

        unsafe {
            (*q.used).ring[u16::MAX as usize % NUM].id = 3;
            (*q.used).ring[0].id = 6;
            (*q.used).idx = 1;
        }
        assert_eq!(q.used_head(), Some(3));
        q.pop_used();
        assert_eq!(q.used_idx, 0);
        assert_eq!(q.used_head(), Some(6));
        q.pop_used();
        assert_eq!(q.used_head(), None);
    }

    proptest! {
        #[test]
        fn descriptors_are_conserved(ops in prop::collection::vec(any::<(bool, usize)>(), 1..64)) {
            let mut rings = Rings::new();
            let mut q = rings.queue();
            let mut live: Vec<[usize; 3]> = Vec::new();

            for (alloc, pick) in ops {
                if alloc {
                    match q.alloc3_desc() {
                        Some(idx) => {
                            for i in idx {
                                prop_assert!(live.iter().flatten().all(|&j| j != i));
                            }
                            chain(&mut q, idx);
                            live.push(idx);
                        }
                        None => prop_assert!(q.num_free() < 3),
                    }
                } else if !live.is_empty() {
                    let idx = live.swap_remove(pick % live.len());
                    q.free_chain(idx[0]);
                    for i in idx {
                        prop_assert!(q.is_free(i));
                    }
                }
                prop_assert_eq!(q.num_free() + 3 * live.len(), NUM);
            }
        }
    }
}
