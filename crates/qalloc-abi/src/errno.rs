use std::ffi::c_int;

#[inline]
pub(crate) fn set_errno(val: c_int) {
    // SAFETY: __errno_location returns a valid pointer to this thread's errno.
    unsafe { *libc::__errno_location() = val };
}
