//
// low-level driver routines for 16550a UART.
//

use crate::console::consoleintr;
use crate::memlayout::UART0;
use crate::proc::{sleep, wakeup};
use crate::spinlock::{pop_off, push_off, Spinlock};

// the UART control registers.
// some have different meanings for
// read vs write.
// see http://byterunner.com/16550.html
const RHR: usize = 0; // receive holding register (for input bytes)
const THR: usize = 0; // transmit holding register (for output bytes)
const IER: usize = 1; // interrupt enable register
const IER_RX_ENABLE: u8 = 1 << 0;
const IER_TX_ENABLE: u8 = 1 << 1;
const FCR: usize = 2; // FIFO control register
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const ISR: usize = 2; // interrupt status register
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3 << 0;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR: usize = 5; // line status register
const LSR_RX_READY: u8 = 1 << 0; // input is waiting to be read from RHR
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

// the UART control registers are memory-mapped
// at address UART0.
fn read_reg(reg: usize) -> u8 {
    unsafe { ((UART0 + reg) as *const u8).read_volatile() }
}

fn write_reg(reg: usize, val: u8) {
    unsafe { ((UART0 + reg) as *mut u8).write_volatile(val) }
}

const UART_TX_BUF_SIZE: usize = 32;

pub struct Uart {
    tx_lock: Spinlock,
    tx_buf: [u8; UART_TX_BUF_SIZE],
    tx_w: u64, // write next to tx_buf[tx_w % UART_TX_BUF_SIZE]
    tx_r: u64, // read next from tx_buf[tx_r % UART_TX_BUF_SIZE]
}

pub static mut UART_INSTANCE: Uart = Uart {
    tx_lock: Spinlock::new("uart"),
    tx_buf: [0; UART_TX_BUF_SIZE],
    tx_w: 0,
    tx_r: 0,
};

pub fn uartinit() {
    // disable interrupts.
    write_reg(IER, 0x00);

    // special mode to set baud rate.
    write_reg(LCR, LCR_BAUD_LATCH);

    // LSB for baud rate of 38.4K.
    write_reg(0, 0x03);

    // MSB for baud rate of 38.4K.
    write_reg(1, 0x00);

    // leave set-baud mode,
    // and set word length to 8 bits, no parity.
    write_reg(LCR, LCR_EIGHT_BITS);

    // reset and enable FIFOs.
    write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

    // enable transmit and receive interrupts.
    write_reg(IER, IER_TX_ENABLE | IER_RX_ENABLE);
}

impl Uart {
    /// add a character to the output buffer and tell the
    /// UART to start sending if it isn't already.
    /// blocks if the output buffer is full.
    /// because it may block, it can't be called
    /// from interrupts; it's only suitable for use
    /// by write().
    pub fn putc(&mut self, c: u8) {
        self.tx_lock.acquire();

        loop {
            if self.tx_w < self.tx_r + UART_TX_BUF_SIZE as u64 {
                break;
            }
            // buffer is full.
            // wait for uartstart() to open up space in the buffer.
            let chan = core::ptr::addr_of!(self.tx_r) as usize;
            sleep(chan, &self.tx_lock);
        }

        self.tx_buf[self.tx_w as usize % UART_TX_BUF_SIZE] = c;
        self.tx_w += 1;
        self.start();
        self.tx_lock.release();
    }

    /// alternate version of putc() that doesn't
    /// use interrupts, for use by kernel printf() and
    /// to echo characters. it spins waiting for the uart's
    /// output register to be empty.
    pub fn putc_sync(&self, c: u8) {
        push_off();

        // wait for Transmit Holding Empty to be set in LSR.
        while read_reg(LSR) & LSR_TX_IDLE == 0 {}
        write_reg(THR, c);

        pop_off();
    }

    /// if the UART is idle, and a character is waiting
    /// in the transmit buffer, send it.
    /// caller must hold tx_lock.
    /// called from both the top- and bottom-half.
    fn start(&mut self) {
        loop {
            if self.tx_w == self.tx_r {
                // transmit buffer is empty.
                read_reg(ISR); // clear a pending tx interrupt, if any
                return;
            }

            if read_reg(LSR) & LSR_TX_IDLE == 0 {
                // the UART transmit holding register is full,
                // so we cannot give it another byte.
                // it will interrupt when it's ready for a new byte.
                return;
            }

            let c = self.tx_buf[self.tx_r as usize % UART_TX_BUF_SIZE];
            self.tx_r += 1;

            // maybe putc() is waiting for space in the buffer.
            wakeup(core::ptr::addr_of!(self.tx_r) as usize);

            write_reg(THR, c);
        }
    }

    /// read one input character from the UART.
    /// return None if none is waiting.
    fn getc(&self) -> Option<u8> {
        if read_reg(LSR) & LSR_RX_READY != 0 {
            // input data is ready.
            Some(read_reg(RHR))
        } else {
            None
        }
    }
}

/// handle a uart interrupt, raised because input has
/// arrived, or the uart is ready for more output, or
/// both. called from devintr().
pub fn uartintr() {
    let uart = unsafe { &mut UART_INSTANCE };

    // read and process incoming characters.
    while let Some(c) = uart.getc() {
        consoleintr(c);
    }

    // send buffered characters.
    uart.tx_lock.acquire();
    uart.start();
    uart.tx_lock.release();
}
