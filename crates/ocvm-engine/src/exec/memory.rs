//! Linear memory
//!
//! The executor reserves the largest memory any module may reach once, as
//! an anonymous `MAP_NORESERVE` mapping, and reuses it for every call. Only
//! the bytes a call actually exposed are zeroed before the next one, so
//! pages added by `grow_memory` are always fresh zeros.

use std::marker::PhantomData;
use std::ptr;

use super::context::VmContext;
use super::error::{ExecutionError, TrapCode};

/// Reserved linear-memory region owned by one executor
#[derive(Debug)]
pub(crate) struct LinearMemory {
    base: *mut u8,
    reserved: usize,
    /// High-water mark of bytes exposed since the last reset
    dirty: usize,
}

impl LinearMemory {
    /// Reserve `bytes` of address space, rounded up to whole OS pages
    pub(crate) fn reserve(bytes: u64) -> Result<Self, ExecutionError> {
        let page = page_size();
        let reserved = usize::try_from(bytes)
            .map_err(|_| ExecutionError::Resource(format!("Cannot reserve {} bytes", bytes)))?
            .max(page)
            .div_ceil(page)
            * page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                reserved,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ExecutionError::Resource(format!(
                "Failed to reserve {} bytes of linear memory: {}",
                reserved,
                std::io::Error::last_os_error()
            )));
        }

        Ok(LinearMemory { base: base as *mut u8, reserved, dirty: 0 })
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    /// Zero everything a previous call could have touched
    pub(crate) fn reset(&mut self) {
        if self.dirty == 0 {
            return;
        }
        let len = self.dirty.div_ceil(page_size()) * page_size();
        let len = len.min(self.reserved);
        // Private anonymous pages read back as zero after MADV_DONTNEED
        #[cfg(target_os = "linux")]
        let zeroed = unsafe { libc::madvise(self.base as *mut libc::c_void, len, libc::MADV_DONTNEED) == 0 };
        #[cfg(not(target_os = "linux"))]
        let zeroed = false;
        if !zeroed {
            unsafe { ptr::write_bytes(self.base, 0, len) };
        }
        self.dirty = 0;
    }

    /// Record that the first `bytes` may have been written
    pub(crate) fn mark_used(&mut self, bytes: u64) {
        let bytes = usize::try_from(bytes).unwrap_or(usize::MAX).min(self.reserved);
        self.dirty = self.dirty.max(bytes);
    }

    /// Copy `data` to `offset`, within the first `limit` bytes
    pub(crate) fn initialize(&mut self, offset: u32, data: &[u8], limit: u64) -> Result<(), ExecutionError> {
        let end = offset as u64 + data.len() as u64;
        if end > limit || end > self.reserved as u64 {
            return Err(ExecutionError::InvalidDescriptor(format!(
                "Data segment at {} of {} bytes exceeds initial memory",
                offset,
                data.len()
            )));
        }
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset as usize), data.len()) };
        self.mark_used(end);
        Ok(())
    }
}

impl Drop for LinearMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.reserved);
        }
    }
}

pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Bounds-checked view of the current linear memory
///
/// Intrinsics touch contract memory only through this type; every access
/// past the current size fails with `TrapCode::MemoryOutOfBounds`.
pub struct MemoryRegion<'a> {
    base: *mut u8,
    len: u64,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> MemoryRegion<'a> {
    /// View over a plain byte buffer
    pub fn from_slice(bytes: &'a mut [u8]) -> Self {
        MemoryRegion { base: bytes.as_mut_ptr(), len: bytes.len() as u64, _marker: PhantomData }
    }

    /// View over the memory a context currently exposes
    pub(crate) fn of(ctx: &VmContext) -> Self {
        MemoryRegion { base: ctx.memory_base, len: ctx.memory_size, _marker: PhantomData }
    }

    /// Current size in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no memory is exposed
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, ptr: u32, len: u32) -> Result<usize, TrapCode> {
        if ptr as u64 + len as u64 > self.len {
            return Err(TrapCode::MemoryOutOfBounds);
        }
        Ok(ptr as usize)
    }

    /// Borrow `len` bytes at `ptr`
    pub fn read(&self, ptr: u32, len: u32) -> Result<&[u8], TrapCode> {
        let at = self.check(ptr, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(at), len as usize) })
    }

    /// Mutably borrow `len` bytes at `ptr`
    pub fn slice_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8], TrapCode> {
        let at = self.check(ptr, len)?;
        if len == 0 {
            return Ok(&mut []);
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(at), len as usize) })
    }

    /// Copy `data` to `ptr`
    pub fn write(&mut self, ptr: u32, data: &[u8]) -> Result<(), TrapCode> {
        let len = u32::try_from(data.len()).map_err(|_| TrapCode::MemoryOutOfBounds)?;
        self.slice_mut(ptr, len)?.copy_from_slice(data);
        Ok(())
    }

    /// Bytes from `ptr` up to, not including, the next NUL
    pub fn read_cstr(&self, ptr: u32) -> Result<&[u8], TrapCode> {
        let rest = self.len.checked_sub(ptr as u64).ok_or(TrapCode::MemoryOutOfBounds)?;
        let rest = self.read(ptr, rest as u32)?;
        let end = rest.iter().position(|&b| b == 0).ok_or(TrapCode::MemoryOutOfBounds)?;
        Ok(&rest[..end])
    }

    /// Move `len` bytes from `src` to `dest`; the ranges may overlap
    pub fn copy_within(&mut self, dest: u32, src: u32, len: u32) -> Result<(), TrapCode> {
        let dest = self.check(dest, len)?;
        let src = self.check(src, len)?;
        if len > 0 {
            unsafe { ptr::copy(self.base.add(src), self.base.add(dest), len as usize) };
        }
        Ok(())
    }
}
