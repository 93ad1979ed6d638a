//! Kernel logging subsystem
//!
//! Ring-buffer logging that works in a `no_std`, no-heap environment. The
//! buffer is 64 KiB and overwrites old data when full. On bare metal every
//! byte is also mirrored to the loader's debug ring (when registered) and
//! to a 16550A-compatible UART for early bring-up; host tests read the ring
//! directly.
//!
//! `log!` accepts standard `format!` syntax. `error!` prefixes the message
//! and appends a `file:line` breadcrumb, which is what the dispatcher
//! leaves behind on every non-success path.

use core::fmt::{self, Write};
use nanovisor_hal::debug_ring::DebugRing;
use spin::Mutex;

const LOG_BUF_SIZE: usize = 64 * 1024;

struct LogState {
    buf: [u8; LOG_BUF_SIZE],
    pos: usize,
    wrapped: bool,
    debug_ring: Option<*mut DebugRing>,
}

// The debug ring pointer is loader memory, valid for the life of the
// kernel and only touched under the log lock.
unsafe impl Send for LogState {}

static LOG: Mutex<LogState> = Mutex::new(LogState {
    buf: [0; LOG_BUF_SIZE],
    pos: 0,
    wrapped: false,
    debug_ring: None,
});

/// UART MMIO base address (legacy COM1).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const UART_BASE: u16 = 0x3F8;

#[inline(always)]
fn uart_write_byte(_byte: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") UART_BASE,
            in("al") _byte,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Registers the loader's debug ring so log bytes reach the loader too.
///
/// # Safety
///
/// `ring` must point at a live `DebugRing` for the rest of the kernel's
/// lifetime.
pub unsafe fn set_debug_ring(ring: *mut DebugRing) {
    LOG.lock().debug_ring = Some(ring);
}

fn write_bytes(s: &[u8]) {
    let mut state = LOG.lock();
    for &b in s {
        let pos = state.pos;
        state.buf[pos] = b;
        state.pos = (pos + 1) % LOG_BUF_SIZE;
        if state.pos == 0 {
            state.wrapped = true;
        }

        if let Some(ring) = state.debug_ring {
            unsafe { (*ring).push(b) };
        }

        uart_write_byte(b);
    }
}

/// Internal writer implementing `core::fmt::Write`.
pub struct LogWriter;

impl Write for LogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Copies the current ring contents in write order. Test and debugger
/// support; truncates to `out.len()`.
pub fn snapshot(out: &mut [u8]) -> usize {
    let state = LOG.lock();
    let n = if state.wrapped { LOG_BUF_SIZE } else { state.pos };
    let n = n.min(out.len());
    for (i, slot) in out.iter_mut().take(n).enumerate() {
        let src = if state.wrapped {
            (state.pos + LOG_BUF_SIZE - n + i) % LOG_BUF_SIZE
        } else {
            i
        };
        *slot = state.buf[src];
    }
    n
}

/// Low-level logging macro
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = ::core::write!($crate::log::LogWriter, $($arg)*);
        let _ = $crate::log::LogWriter.write_str("\r\n");
    }};
}

/// Error logging with a source-location breadcrumb
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        $crate::log!(
            "[error] {} [{}:{}]",
            ::core::format_args!($($arg)*),
            ::core::file!(),
            ::core::line!()
        );
    }};
}
