// Physical memory allocator, for queue pages and
// other kernel-owned DMA memory.
// Allocates whole 4096-byte pages.

use core::ptr::{self, NonNull};

use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::PGROUNDUP;

struct Run {
    next: *mut Run,
}

struct Freelist {
    head: *mut Run,
    start: usize, // lowest page ever donated
    end: usize,   // one past the highest
    nfree: usize,
}

// The pages on the list belong to nobody but the allocator.
unsafe impl Send for Freelist {}

pub struct KMem {
    lock: Spinlock<Freelist>,
}

impl KMem {
    pub const fn new() -> Self {
        Self {
            lock: Spinlock::new(
                "kmem",
                Freelist {
                    head: ptr::null_mut(),
                    start: usize::MAX,
                    end: 0,
                    nfree: 0,
                },
            ),
        }
    }

    /// Donate every whole page in `[pa_start, pa_end)`.
    ///
    /// # Safety
    ///
    /// The range must be RAM that nothing else uses, now or later.
    pub unsafe fn freerange(&self, pa_start: *mut u8, pa_end: *mut u8) {
        let first = PGROUNDUP!(pa_start);
        let last = first + (pa_end as usize).saturating_sub(first) / PGSIZE * PGSIZE;
        {
            let mut fl = self.lock.lock();
            fl.start = fl.start.min(first);
            fl.end = fl.end.max(last);
        }
        let mut p = first;
        while p < last {
            self.kfree(p as *mut u8);
            p += PGSIZE;
        }
    }

    /// Free the page of physical memory pointed at by pa,
    /// which normally should have been returned by a
    /// call to kalloc().  (The exception is when
    /// initializing the allocator; see freerange above.)
    ///
    /// # Safety
    ///
    /// `pa` must not be used by anyone after this call.
    pub unsafe fn kfree(&self, pa: *mut u8) {
        let mut fl = self.lock.lock();
        let addr = pa as usize;
        if addr % PGSIZE != 0 || addr < fl.start || addr >= fl.end {
            panic!("kfree");
        }

        // Fill with junk to catch dangling refs.
        ptr::write_bytes(pa, 1, PGSIZE);

        let r = pa as *mut Run;
        (*r).next = fl.head;
        fl.head = r;
        fl.nfree += 1;
    }

    /// Allocate one 4096-byte page of physical memory.
    /// Returns None if the memory cannot be allocated.
    pub fn kalloc(&self) -> Option<NonNull<u8>> {
        let mut fl = self.lock.lock();
        let r = NonNull::new(fl.head)?;
        unsafe {
            fl.head = (*r.as_ptr()).next;
        }
        fl.nfree -= 1;
        drop(fl);

        let page = r.cast::<u8>();
        unsafe { ptr::write_bytes(page.as_ptr(), 5, PGSIZE) }; // fill with junk
        Some(page)
    }

    /// Pages currently on the free list.
    pub fn free_pages(&self) -> usize {
        self.lock.lock().nfree
    }
}

impl Default for KMem {
    fn default() -> Self {
        Self::new()
    }
}
