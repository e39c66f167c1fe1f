use std::io;

/// Converts a C return value to a Rust `Result`.
///
/// `libc` memory-locking calls report failures through `errno` and return
/// `-1`, so the error is taken from the last OS error.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Lock `len` bytes starting at `addr` into RAM.
pub(crate) fn pin(addr: usize, len: usize) -> io::Result<()> {
    // SAFETY: FFI. `mlock` does not access the memory, it only touches page tables.
    let ret = unsafe { libc::mlock(addr as *const libc::c_void, len) };
    from_c_ret(ret)
}

/// Undo a previous [`pin`].
pub(crate) fn unpin(addr: usize, len: usize) -> io::Result<()> {
    // SAFETY: FFI.
    let ret = unsafe { libc::munlock(addr as *const libc::c_void, len) };
    from_c_ret(ret)
}
