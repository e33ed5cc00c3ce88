//! Instruction cache maintenance after writing stub code.

use crate::Pcode;

/// Make `len` bytes of freshly written code at `start` visible to
/// instruction fetch. x86-64 keeps its caches coherent, so this is a no-op
/// there.
pub fn flush_instruction_cache(start: Pcode, len: usize) {
    if len == 0 {
        return;
    }

    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    unsafe {
        __clear_cache(start as *mut libc::c_char, (start + len) as *mut libc::c_char);
    }

    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    unsafe {
        sys_icache_invalidate(start as *mut libc::c_void, len);
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = start;
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}
