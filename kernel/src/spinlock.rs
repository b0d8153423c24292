use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::riscv::{intr_get, intr_off, intr_on};

/// Per-hart interrupt nesting state.
struct Cpu {
    noff: AtomicU32,    // Depth of push_off() nesting.
    intena: AtomicBool, // Were interrupts enabled before push_off()?
}

impl Cpu {
    const fn new() -> Self {
        Self {
            noff: AtomicU32::new(0),
            intena: AtomicBool::new(false),
        }
    }
}

#[cfg(not(test))]
fn mycpu<R>(f: impl FnOnce(&Cpu) -> R) -> R {
    // single hart.
    static CPU: Cpu = Cpu::new();
    f(&CPU)
}

#[cfg(test)]
fn mycpu<R>(f: impl FnOnce(&Cpu) -> R) -> R {
    std::thread_local! {
        static CPU: Cpu = const { Cpu::new() };
    }
    CPU.with(f)
}

/// push_off/pop_off are like intr_off()/intr_on() except that they are matched:
/// it takes two pop_off()s to undo two push_off()s.  Also, if interrupts
/// are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();

    intr_off();
    mycpu(|cpu| {
        if cpu.noff.load(Ordering::Relaxed) == 0 {
            cpu.intena.store(old, Ordering::Relaxed);
        }
        cpu.noff.fetch_add(1, Ordering::Relaxed);
    });
}

pub fn pop_off() {
    if intr_get() {
        panic!("pop_off - interruptible");
    }

    mycpu(|cpu| {
        let noff = cpu.noff.load(Ordering::Relaxed);
        if noff < 1 {
            panic!("pop_off");
        }
        cpu.noff.store(noff - 1, Ordering::Relaxed);
        if noff == 1 && cpu.intena.load(Ordering::Relaxed) {
            intr_on();
        }
    });
}

/// Keeps device interrupts masked on this hart while alive.
pub struct IntrOff {
    _not_send: PhantomData<*const ()>,
}

impl IntrOff {
    pub fn new() -> Self {
        push_off();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for IntrOff {
    fn drop(&mut self) {
        pop_off();
    }
}

/// Mutual exclusion between the kernel proper and interrupt handlers
/// on a single hart: interrupts are masked before the lock is taken
/// and unmasked only after it is released.
pub struct Spinlock<T> {
    name: &'static str, // Name of lock.
    inner: spin::Mutex<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Spinlock {
            name,
            inner: spin::Mutex::new(data),
        }
    }

    /// Acquire the lock.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let intr = IntrOff::new(); // disable interrupts to avoid deadlock.
        if self.holding() {
            // nobody else runs on this hart to release it.
            panic!("acquire {}", self.name);
        }
        SpinlockGuard {
            guard: self.inner.lock(),
            _intr: intr,
        }
    }

    /// Check whether the lock is held.
    pub fn holding(&self) -> bool {
        self.inner.is_locked()
    }
}

/// The mutex is released before interrupts are restored: fields drop
/// in declaration order.
pub struct SpinlockGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
    _intr: IntrOff,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_masks_interrupts_until_released() {
        intr_on();
        let lock = Spinlock::new("test", 0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(!intr_get());
            assert!(lock.holding());
        }
        assert!(intr_get());
        assert!(!lock.holding());
        assert_eq!(*lock.lock(), 1);
        intr_off();
    }

    #[test]
    fn nested_locks_restore_on_outermost_release() {
        intr_on();
        let a = Spinlock::new("a", ());
        let b = Spinlock::new("b", ());
        let ga = a.lock();
        let gb = b.lock();
        drop(gb);
        assert!(!intr_get());
        drop(ga);
        assert!(intr_get());
        intr_off();
    }

    #[test]
    fn interrupts_off_stay_off() {
        intr_off();
        let lock = Spinlock::new("irq", ());
        drop(lock.lock());
        assert!(!intr_get());
    }

    #[test]
    #[should_panic(expected = "acquire twice")]
    fn reacquire_is_fatal() {
        let lock = Spinlock::new("twice", ());
        let _g = lock.lock();
        let _h = lock.lock();
    }

    #[test]
    #[should_panic(expected = "pop_off")]
    fn unbalanced_pop_is_fatal() {
        intr_off();
        pop_off();
    }

    #[test]
    #[should_panic(expected = "pop_off - interruptible")]
    fn pop_with_interrupts_on_is_fatal() {
        push_off();
        intr_on();
        pop_off();
    }
}
