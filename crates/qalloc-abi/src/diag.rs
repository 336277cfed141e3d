//! Allocation-free stderr diagnostics and fatal termination.

use std::ffi::c_int;
use std::fmt::{self, Write};

use qalloc_core::{HeapCorruption, HeapLogRecord};

const STDERR: c_int = 2;

/// `fmt::Write` sink that goes straight to file descriptor 2.
pub(crate) struct StderrWriter;

impl Write for StderrWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();
        while !bytes.is_empty() {
            // SAFETY: the pointer and length describe a live byte slice.
            let written = unsafe { libc::write(STDERR, bytes.as_ptr().cast(), bytes.len()) };
            match usize::try_from(written) {
                Ok(0) => return Err(fmt::Error),
                Ok(n) => bytes = &bytes[n..],
                Err(_) if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) => {}
                Err(_) => return Err(fmt::Error),
            }
        }
        Ok(())
    }
}

pub(crate) fn emit_record(record: &HeapLogRecord) {
    let _ = writeln!(StderrWriter, "qalloc: {record}");
}

/// Prints the message and aborts.
#[cold]
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
    let _ = writeln!(StderrWriter, "qalloc: fatal: {args}");
    std::process::abort()
}

/// Prints the full corruption report and aborts.
#[cold]
pub(crate) fn fatal_corruption(err: &HeapCorruption) -> ! {
    let _ = StderrWriter.write_str("qalloc: fatal: ");
    let _ = err.report(&mut StderrWriter);
    std::process::abort()
}
