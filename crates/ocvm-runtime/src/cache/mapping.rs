//! Shared mappings of the cache file

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr;

use ocvm_engine::ExecutableCode;

use crate::error::CacheError;

fn map(file: &File, len: usize, prot: libc::c_int) -> Result<*mut u8, CacheError> {
    // Safety: a fresh shared mapping of an open file; the kernel validates
    // the length and protection
    let base = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, file.as_raw_fd(), 0) };
    if base == libc::MAP_FAILED {
        return Err(CacheError::Io(std::io::Error::last_os_error()));
    }
    Ok(base as *mut u8)
}

/// Read-write view of the whole cache file
pub(crate) struct FileMapping {
    base: *mut u8,
    len: usize,
}

// Safety: only the owning `CodeCache` reads or writes through the pointer
unsafe impl Send for FileMapping {}

impl FileMapping {
    pub fn new(file: &File, len: usize) -> Result<Self, CacheError> {
        let base = map(file, len, libc::PROT_READ | libc::PROT_WRITE)?;
        Ok(FileMapping { base, len })
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: the mapping stays valid until drop
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: the mapping stays valid until drop; `&mut self` makes
        // this the only live view through this mapping
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<(), CacheError> {
        // Safety: base/len describe a live mapping
        if unsafe { libc::msync(self.base as *mut libc::c_void, self.len, libc::MS_SYNC) } != 0 {
            return Err(CacheError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Read+execute view of the whole cache file
///
/// Descriptor offsets from the cache are relative to `base()`. Executors
/// hold this through an `Arc`, so the mapping outlives the cache itself.
#[derive(Debug)]
pub struct ExecutableMapping {
    base: *const u8,
    len: usize,
}

// Safety: the mapping is never written through and never moves; new blobs
// are only placed in arena space no descriptor refers to
unsafe impl Send for ExecutableMapping {}
unsafe impl Sync for ExecutableMapping {}

impl ExecutableMapping {
    pub(crate) fn new(file: &File, len: usize) -> Result<Self, CacheError> {
        let base = map(file, len, libc::PROT_READ | libc::PROT_EXEC)?;
        Ok(ExecutableMapping { base, len })
    }

    /// Bytes at `[offset, offset + len)`, if inside the mapping
    pub fn slice(&self, offset: u64, len: u64) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len as u64 {
            return None;
        }
        // Safety: range checked against the live mapping
        Some(unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len as usize) })
    }
}

impl ExecutableCode for ExecutableMapping {
    fn base(&self) -> *const u8 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ExecutableMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}
