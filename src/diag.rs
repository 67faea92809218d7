//! Boot diagnostic channel.
//!
//! Dual-sink text output: the serial port is always live, the firmware text
//! console joins once the handoff context is populated and leaves for good
//! when boot services terminate. Emission is synchronous and unbuffered, so
//! the channel is usable from the first instruction of the entry point and
//! from crash paths.
//!
//! The `log` facade is layered on top: one global sink behind a spin mutex,
//! installed once at entry. That mutex is the only shared state in the
//! kernel; the handoff context itself is never stored here.

use core::fmt;
use core::ptr::NonNull;

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

use crate::efi;
use crate::serial::{self, Com1, SerialTx};

/// Longest run of UCS-2 units sent to the console per protocol call,
/// excluding the terminating NUL.
const CONSOLE_CHUNK: usize = 64;

/// A console accepting UCS-2 text. No carriage-return injection happens on
/// this sink; the firmware console manages its own cursor.
pub trait ConsoleOut {
    fn write_ucs2(&mut self, units: &[u16]);
}

/// The firmware simple-text-output protocol as a console sink.
pub struct EfiConsole {
    out: NonNull<efi::SimpleTextOutput>,
}

impl EfiConsole {
    pub fn new(out: NonNull<efi::SimpleTextOutput>) -> Self {
        Self { out }
    }
}

// Single core, interrupts never enabled during boot; the pointer is only
// touched under the channel mutex.
unsafe impl Send for EfiConsole {}

impl ConsoleOut for EfiConsole {
    fn write_ucs2(&mut self, units: &[u16]) {
        let mut buf = [0u16; CONSOLE_CHUNK + 1];
        let n = units.len().min(CONSOLE_CHUNK);
        buf[..n].copy_from_slice(&units[..n]);
        buf[n] = 0;
        // Console failure is unreportable; drop the status.
        let this = self.out.as_ptr();
        let _ = unsafe { ((*this).output_string)(this, buf.as_ptr()) };
    }
}

/// Dual-sink diagnostic channel. Generic over both sinks so the emission
/// rules are checkable without hardware.
pub struct DiagnosticChannel<S, C> {
    serial: S,
    console: Option<C>,
}

impl<S: SerialTx, C: ConsoleOut> DiagnosticChannel<S, C> {
    pub const fn new(serial: S) -> Self {
        Self { serial, console: None }
    }

    pub fn attach_console(&mut self, console: C) {
        self.console = Some(console);
    }

    /// Drop the console sink; subsequent emissions are serial-only.
    pub fn detach_console(&mut self) {
        self.console = None;
    }

    pub fn console_active(&self) -> bool {
        self.console.is_some()
    }

    /// Write `text` to every active sink. Serial gets the raw bytes with a
    /// carriage return injected after each newline (terminal convention);
    /// the console gets a UCS-2 transcoding with no injection.
    pub fn emit(&mut self, text: &str) {
        for byte in text.bytes() {
            serial::send_byte(&mut self.serial, byte);
            if byte == b'\n' {
                serial::send_byte(&mut self.serial, b'\r');
            }
        }
        self.emit_console(text);
    }

    fn emit_console(&mut self, text: &str) {
        let Some(console) = self.console.as_mut() else {
            return;
        };
        let mut buf = [0u16; CONSOLE_CHUNK];
        let mut n = 0;
        for ch in text.chars() {
            // Code points beyond the BMP have no UCS-2 form.
            buf[n] = if (ch as u32) <= 0xFFFF { ch as u32 as u16 } else { b'?' as u16 };
            n += 1;
            if n == buf.len() {
                console.write_ucs2(&buf);
                n = 0;
            }
        }
        if n > 0 {
            console.write_ucs2(&buf[..n]);
        }
    }
}

impl<S: SerialTx, C: ConsoleOut> fmt::Write for DiagnosticChannel<S, C> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.emit(s);
        Ok(())
    }
}

/// The channel wired to real hardware and firmware.
pub type KernelChannel = DiagnosticChannel<Com1, EfiConsole>;

struct DiagLog {
    channel: Mutex<KernelChannel>,
}

static DIAG: DiagLog = DiagLog {
    channel: Mutex::new(DiagnosticChannel::new(Com1)),
};

impl log::Log for DiagLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // try_lock so a crash inside an emission can still log.
        if let Some(mut channel) = self.channel.try_lock() {
            use fmt::Write;
            let _ = write!(channel, "[{:>5}] {}\n", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Bring up the serial port, attach the firmware console when one exists,
/// and register the channel as the `log` sink. Called once at entry.
pub fn install(console: Option<EfiConsole>) {
    serial::init();
    if let Some(console) = console {
        DIAG.channel.lock().attach_console(console);
    }
    let _ = log::set_logger(&DIAG);
    log::set_max_level(LevelFilter::Info);
}

/// Route all further diagnostics to the serial sink only. Must run before
/// any emission once boot services are gone: the console pointer is dead
/// from that moment.
pub fn detach_console() {
    DIAG.channel.lock().detach_console();
}

/// Emit raw text through the global channel. Falls back to a fresh
/// serial-only channel if the global one is held, so assertion and panic
/// paths can always speak.
pub fn emit(text: &str) {
    match DIAG.channel.try_lock() {
        Some(mut channel) => channel.emit(text),
        None => DiagnosticChannel::<Com1, EfiConsole>::new(Com1).emit(text),
    }
}

/// Run `f` against the global channel, with the same fallback as [`emit`].
pub fn with_channel(f: impl FnOnce(&mut KernelChannel)) {
    match DIAG.channel.try_lock() {
        Some(mut channel) => f(&mut channel),
        None => f(&mut DiagnosticChannel::new(Com1)),
    }
}
