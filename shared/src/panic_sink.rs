//! The fatal-error collaborator.
//!
//! Every allocator in `memory` treats "print a diagnostic and halt" as an
//! injected dependency rather than calling into a panic macro directly. This
//! is what lets tests assert on the exact message for double-free, OOM, and
//! page-fault scenarios instead of actually crashing the test process.

use core::fmt::Arguments;

/// Formats a fatal diagnostic and never returns.
///
/// Implementations must not return: the caller has already decided the
/// subsystem cannot continue safely.
pub trait PanicSink {
    fn fatal(&self, args: Arguments<'_>) -> !;
}

/// Production sink: logs at `error` level, disables interrupts, and halts
/// the CPU in a tight loop.
#[derive(Clone, Copy)]
pub struct HaltingPanicSink;

impl PanicSink for HaltingPanicSink {
    fn fatal(&self, args: Arguments<'_>) -> ! {
        log::error!("{}", args);
        log::error!("Kernel halted.");
        unsafe {
            crate::arch::halt_forever();
        }
    }
}

#[macro_export]
macro_rules! fatal {
    ($sink:expr, $($arg:tt)*) => {
        $sink.fatal(format_args!($($arg)*))
    };
}
