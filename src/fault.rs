//! Invariant checking and the end of the line.
//!
//! A failed check reports its source location over the diagnostic channel
//! and stops the core permanently. The report path allocates nothing and
//! never re-enters the formatting machinery, so it works from any state the
//! kernel can reach.

use crate::diag::{self, ConsoleOut, DiagnosticChannel};
use crate::serial::SerialTx;

/// Stop the processor for good. The halt instruction is re-issued after
/// every spurious wake, so execution never proceeds past this point.
pub fn halt_forever() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        core::hint::spin_loop();
    }
}

/// Render `value` in decimal: digits fall out least-significant-first from
/// repeated division, then the slice is reversed for display.
pub fn format_u32_dec(value: u32, buf: &mut [u8; 10]) -> &str {
    if value == 0 {
        buf[0] = b'0';
        // ASCII digits only.
        return unsafe { core::str::from_utf8_unchecked(&buf[..1]) };
    }
    let mut v = value;
    let mut i = 0;
    while v != 0 {
        buf[i] = b'0' + (v % 10) as u8;
        i += 1;
        v /= 10;
    }
    buf[..i].reverse();
    unsafe { core::str::from_utf8_unchecked(&buf[..i]) }
}

/// Emit the violation report: `assert failed at <file>:<line>`.
pub fn write_violation<S: SerialTx, C: ConsoleOut>(
    channel: &mut DiagnosticChannel<S, C>,
    file: &str,
    line: u32,
) {
    let mut digits = [0u8; 10];
    channel.emit("\nassert failed at ");
    channel.emit(file);
    channel.emit(":");
    channel.emit(format_u32_dec(line, &mut digits));
    channel.emit("\n");
}

/// Check an invariant; on violation, report the location and halt. Use via
/// [`kassert!`](crate::kassert).
pub fn check(condition: bool, file: &str, line: u32) {
    if condition {
        return;
    }
    diag::with_channel(|channel| write_violation(channel, file, line));
    halt_forever();
}

/// Invariant check that halts the machine instead of returning on failure.
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        $crate::fault::check($cond, file!(), line!())
    };
}
