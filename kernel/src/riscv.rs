// Supervisor Status Register, sstatus
pub const SSTATUS_SPP: u64 = 1 << 8; // Previous mode, 1=Supervisor, 0=User
pub const SSTATUS_SIE: u64 = 1 << 1; // Supervisor Interrupt Enable

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

#[macro_export]
macro_rules! PGROUNDUP {
    ( $sz:expr ) => {
        (($sz) as usize + $crate::riscv::PGSIZE - 1) & !($crate::riscv::PGSIZE - 1)
    };
}

#[macro_export]
macro_rules! PGROUNDDOWN {
    ( $a:expr ) => {
        (($a) as usize) & !($crate::riscv::PGSIZE - 1)
    };
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod csr {
    use core::arch::asm;

    pub fn r_sstatus() -> u64 {
        let x: u64;
        unsafe { asm!("csrr {}, sstatus", out(reg) x) }
        x
    }

    pub fn w_sstatus(x: u64) {
        unsafe { asm!("csrw sstatus, {}", in(reg) x) }
    }

    pub fn fence() {
        unsafe { asm!("fence iorw, iorw") }
    }
}

// Hosted builds have no sstatus to poke, so the register is emulated.
// Under test every thread gets its own copy, the way every hart would.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod csr {
    use core::sync::atomic::{fence as atomic_fence, Ordering};

    #[cfg(not(test))]
    static SSTATUS: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

    #[cfg(not(test))]
    pub fn r_sstatus() -> u64 {
        SSTATUS.load(Ordering::Relaxed)
    }

    #[cfg(not(test))]
    pub fn w_sstatus(x: u64) {
        SSTATUS.store(x, Ordering::Relaxed)
    }

    #[cfg(test)]
    std::thread_local! {
        static SSTATUS: core::cell::Cell<u64> = const { core::cell::Cell::new(0) };
    }

    #[cfg(test)]
    pub fn r_sstatus() -> u64 {
        SSTATUS.with(|s| s.get())
    }

    #[cfg(test)]
    pub fn w_sstatus(x: u64) {
        SSTATUS.with(|s| s.set(x))
    }

    pub fn fence() {
        atomic_fence(Ordering::SeqCst)
    }
}

pub use csr::{r_sstatus, w_sstatus};

// enable device interrupts
pub fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

// disable device interrupts
pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

// are device interrupts enabled?
pub fn intr_get() -> bool {
    let x = r_sstatus();
    (x & SSTATUS_SIE) != 0
}

/// Full memory barrier. Loads and stores, including those to device
/// memory, are not moved across it.
pub fn __sync_synchronize() {
    csr::fence()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intr_bit_round_trips() {
        intr_off();
        assert!(!intr_get());
        intr_on();
        assert!(intr_get());
        assert_eq!(r_sstatus() & SSTATUS_SPP, 0);
        intr_off();
        assert!(!intr_get());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(PGROUNDUP!(0), 0);
        assert_eq!(PGROUNDUP!(1), PGSIZE);
        assert_eq!(PGROUNDUP!(PGSIZE), PGSIZE);
        assert_eq!(PGROUNDDOWN!(PGSIZE + 7), PGSIZE);
        assert_eq!(1 << PGSHIFT, PGSIZE);
    }
}
