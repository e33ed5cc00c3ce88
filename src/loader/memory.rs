//! Page-granular memory regions backing the loader heap and loaded images.
//!
//! Regions are mapped with mmap and stay mapped until dropped. Stub memory
//! is patched while live, so executable regions are mapped read-write-execute
//! rather than flipped to read-execute after writing.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Page protection of a region or a subrange of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadWriteExecute,
    ReadOnly,
    ReadExecute,
}

impl Protection {
    #[cfg(unix)]
    fn to_prot(self) -> libc::c_int {
        match self {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// A block of memory allocated via mmap.
pub struct CodeRegion {
    ptr: NonNull<u8>,
    size: usize,
}

impl CodeRegion {
    /// Map a zero-filled region of at least `size` bytes.
    pub fn new(size: usize, protection: Protection) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size, protection)?;

        Ok(Self {
            ptr,
            size: aligned_size,
        })
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize, protection: Protection) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                protection.to_prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize, _protection: Protection) -> Result<NonNull<u8>, MemoryError> {
        // Not executable on most systems; enough for layout and image work
        let layout = std::alloc::Layout::from_size_align(size, page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.size
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Change protection of the pages covering `offset..offset + len`.
    #[cfg(unix)]
    pub fn protect(
        &self,
        offset: usize,
        len: usize,
        protection: Protection,
    ) -> Result<(), MemoryError> {
        let page_size = page_size();
        if offset % page_size != 0 || offset.checked_add(len).is_none_or(|end| end > self.size) {
            return Err(MemoryError::InvalidSize);
        }
        if len == 0 {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(offset) as *mut libc::c_void,
                len,
                protection.to_prot(),
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn protect(
        &self,
        _offset: usize,
        _len: usize,
        _protection: Protection,
    ) -> Result<(), MemoryError> {
        Ok(())
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The region owns its mapping; concurrent access to the bytes is governed
// by the atomics of the stubs placed in it.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

/// Get the page size for the current system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}
