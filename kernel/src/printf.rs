//
// formatted console output, plus the backend for the log crate's
// macros. printf! writes unconditionally and is the panic path;
// boot progress and driver chatter go through log::info!/debug!.
//

use core::fmt::{Arguments, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

use crate::console::CONSOLE_INSTANCE;
use crate::spinlock::Spinlock;

pub static mut PRINTER: Printer = Printer {
    lock: Spinlock::new("pr"),
    locking: AtomicBool::new(true),
};

#[macro_export]
macro_rules! printf {
    ($($arg:tt)*) => {
        unsafe {
            $crate::printf::PRINTER.print(core::format_args!($($arg)*))
        }
    };
}

/// lock to avoid interleaving concurrent printf's.
pub struct Printer {
    lock: Spinlock,
    locking: AtomicBool,
}

impl Printer {
    pub fn print(&mut self, args: Arguments<'_>) {
        let locking = self.locking.load(Ordering::Relaxed);
        if locking {
            self.lock.acquire();
        }

        unsafe {
            let _ = CONSOLE_INSTANCE.write_fmt(args);
        }

        if locking {
            self.lock.release();
        }
    }

    // freeze console output from other CPUs once a panic starts.
    pub fn panicked(&self) {
        self.locking.store(false, Ordering::Relaxed);
    }
}

struct KernelLog;

static KLOG: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            printf!("[{}] {}\n", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn printfinit() {
    let _ = log::set_logger(&KLOG);
    log::set_max_level(if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}
