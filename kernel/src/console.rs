//
// Console input and output, to the uart.
// Reads are line at a time.
// Implements special input characters:
//   newline -- end of line
//   control-h -- backspace
//   control-u -- kill line
//   control-d -- end of file
//   control-p -- print process list
//

use core::fmt::{Error, Write};

use crate::file::{Devsw, CONSOLE, DEVSW};
use crate::proc::{either_copyin, either_copyout, killed, myproc, procdump, sleep, wakeup};
use crate::spinlock::Spinlock;
use crate::uart::{uartinit, UART_INSTANCE};

// the control-x character.
const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

const BACKSPACE: u16 = 0x100;

const INPUT_BUF_SIZE: usize = 128;

pub struct Console {
    lock: Spinlock,

    // input
    buf: [u8; INPUT_BUF_SIZE],
    r: u64, // Read index
    w: u64, // Write index
    e: u64, // Edit index
}

pub static mut CONSOLE_INSTANCE: Console = Console {
    lock: Spinlock::new("cons"),
    buf: [0; INPUT_BUF_SIZE],
    r: 0,
    w: 0,
    e: 0,
};

pub fn consoleinit() {
    uartinit();

    // connect read and write system calls
    // to consoleread and consolewrite.
    unsafe {
        DEVSW[CONSOLE] = Devsw {
            read: Some(consoleread),
            write: Some(consolewrite),
        };
    }
}

// send one character to the uart.
// called by printf(), and to echo input characters,
// but not from write().
fn consputc(c: u16) {
    let uart = unsafe { &UART_INSTANCE };
    if c == BACKSPACE {
        // if the user typed backspace, overwrite with a space.
        uart.putc_sync(0x08); // ascii \b
        uart.putc_sync(b' ');
        uart.putc_sync(0x08);
    } else {
        uart.putc_sync(c as u8);
    }
}

//
// user write()s to the console go here.
//
fn consolewrite(user_src: bool, src: usize, n: usize) -> i32 {
    let mut i = 0;
    while i < n {
        let mut c = 0u8;
        if either_copyin(&mut c as *mut u8, user_src, src + i, 1) == -1 {
            break;
        }
        unsafe { UART_INSTANCE.putc(c) };
        i += 1;
    }

    i as i32
}

//
// user read()s from the console go here.
// copy (up to) a whole input line to dst.
// user_dst indicates whether dst is a user
// or kernel address.
//
fn consoleread(user_dst: bool, dst: usize, n: usize) -> i32 {
    let cons = unsafe { &mut CONSOLE_INSTANCE };
    let target = n;
    let mut dst = dst;
    let mut n = n;

    cons.lock.acquire();
    while n > 0 {
        // wait until interrupt handler has put some
        // input into cons.buf.
        while cons.r == cons.w {
            if killed(myproc()) {
                cons.lock.release();
                return -1;
            }
            let chan = core::ptr::addr_of!(cons.r) as usize;
            sleep(chan, &cons.lock);
        }

        let c = cons.buf[cons.r as usize % INPUT_BUF_SIZE];
        cons.r += 1;

        if c == ctrl(b'D') {
            // end-of-file
            if n < target {
                // Save ^D for next time, to make sure
                // caller gets a 0-byte result.
                cons.r -= 1;
            }
            break;
        }

        // copy the input byte to the user-space buffer.
        let cbuf = c;
        if either_copyout(user_dst, dst, &cbuf as *const u8, 1) == -1 {
            break;
        }

        dst += 1;
        n -= 1;

        if c == b'\n' {
            // a whole line has arrived, return to
            // the user-level read().
            break;
        }
    }
    cons.lock.release();

    (target - n) as i32
}

//
// the console input interrupt handler.
// uartintr() calls this for input character.
// do erase/kill processing, append to cons.buf,
// wake up consoleread() if a whole line has arrived.
//
pub fn consoleintr(c: u8) {
    let cons = unsafe { &mut CONSOLE_INSTANCE };
    cons.lock.acquire();

    if c == ctrl(b'P') {
        // Print process list.
        procdump();
    } else if c == ctrl(b'U') {
        // Kill line.
        while cons.e != cons.w && cons.buf[(cons.e - 1) as usize % INPUT_BUF_SIZE] != b'\n' {
            cons.e -= 1;
            consputc(BACKSPACE);
        }
    } else if c == ctrl(b'H') || c == 0x7f {
        // Backspace or Delete key.
        if cons.e != cons.w {
            cons.e -= 1;
            consputc(BACKSPACE);
        }
    } else if c != 0 && cons.e - cons.r < INPUT_BUF_SIZE as u64 {
        let c = if c == b'\r' { b'\n' } else { c };

        // echo back to the user.
        consputc(c as u16);

        // store for consumption by consoleread().
        cons.buf[cons.e as usize % INPUT_BUF_SIZE] = c;
        cons.e += 1;

        if c == b'\n' || c == ctrl(b'D') || cons.e - cons.r == INPUT_BUF_SIZE as u64 {
            // wake up consoleread() if a whole line (or end-of-file)
            // has arrived.
            cons.w = cons.e;
            wakeup(core::ptr::addr_of!(cons.r) as usize);
        }
    }

    cons.lock.release();
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        for c in s.bytes() {
            consputc(c as u16);
        }
        Ok(())
    }
}
