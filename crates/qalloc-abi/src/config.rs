//! Process-wide heap configuration, resolved once from the environment.

use std::ffi::CStr;
use std::sync::OnceLock;

use qalloc_core::HeapConfig;

static CONFIG: OnceLock<HeapConfig> = OnceLock::new();

/// Returns the cached configuration, reading the environment on first use.
pub(crate) fn heap_config() -> HeapConfig {
    *CONFIG.get_or_init(|| HeapConfig::from_lookup(getenv))
}

/// `getenv` without allocating: the key is NUL-terminated in a stack buffer.
fn getenv(key: &str) -> Option<&'static str> {
    let mut buf = [0u8; 64];
    let bytes = key.as_bytes();
    if bytes.len() >= buf.len() {
        return None;
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    let name = CStr::from_bytes_until_nul(&buf).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let value = unsafe { libc::getenv(name.as_ptr()) };
    if value.is_null() {
        return None;
    }
    // SAFETY: getenv returned a non-null pointer to a NUL-terminated string
    // owned by the environment block.
    unsafe { CStr::from_ptr(value) }.to_str().ok()
}
