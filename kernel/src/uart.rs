//
// low-level driver routines for 16550a UART,
// used as the console the kernel logger prints to.
//

use core::fmt::{self, Write};
use core::ptr;

use crate::spinlock::{pop_off, push_off};

// the UART control registers.
// some have different meanings for
// read vs write.
// see http://byterunner.com/16550.html
const THR: usize = 0; // transmit holding register (for output bytes)
const IER: usize = 1; // interrupt enable register
const FCR: usize = 2; // FIFO control register
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3 << 0;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR: usize = 5; // line status register
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

/// Polled, output-only UART. Good enough for log lines and panics.
pub struct Uart {
    base: usize,
}

impl Uart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_reg(&self, reg: usize) -> u8 {
        unsafe { ptr::read_volatile((self.base + reg) as *const u8) }
    }

    fn write_reg(&self, reg: usize, val: u8) {
        unsafe { ptr::write_volatile((self.base + reg) as *mut u8, val) }
    }

    pub fn init(&self) {
        // disable interrupts.
        self.write_reg(IER, 0x00);

        // special mode to set baud rate.
        self.write_reg(LCR, LCR_BAUD_LATCH);

        // LSB for baud rate of 38.4K.
        self.write_reg(0, 0x03);

        // MSB for baud rate of 38.4K.
        self.write_reg(1, 0x00);

        // leave set-baud mode,
        // and set word length to 8 bits, no parity.
        self.write_reg(LCR, LCR_EIGHT_BITS);

        // reset and enable FIFOs.
        self.write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
    }

    /// spins waiting for the uart's output register to be empty.
    pub fn putc_sync(&self, c: u8) {
        push_off();

        // wait for Transmit Holding Empty to be set in LSR.
        while (self.read_reg(LSR) & LSR_TX_IDLE) == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(THR, c);

        pop_off();
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            self.putc_sync(c);
        }
        Ok(())
    }
}
