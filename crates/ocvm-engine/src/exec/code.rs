//! Executable code regions

use std::ptr;

use super::error::ExecutionError;

/// Memory holding a code blob the executor may jump into
///
/// Offsets in a `CodeDescriptor` are relative to `base()`. The code cache
/// implements this for its shared read+execute mapping; `ExecutableBuffer`
/// serves a single blob straight from the compiler.
pub trait ExecutableCode {
    /// Start of the executable region
    fn base(&self) -> *const u8;

    /// Length of the region in bytes
    fn len(&self) -> usize;

    /// Whether the region is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A private read+execute copy of one code blob
#[derive(Debug)]
pub struct ExecutableBuffer {
    base: *const u8,
    size: usize,
}

// Safety: the region is immutable once mapped PROT_READ|PROT_EXEC
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Map `code` executable at a fresh address
    pub fn new(code: &[u8]) -> Result<Self, ExecutionError> {
        if code.is_empty() {
            return Ok(ExecutableBuffer { base: ptr::null(), size: 0 });
        }

        unsafe {
            let region = libc::mmap(
                ptr::null_mut(),
                code.len(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if region == libc::MAP_FAILED {
                return Err(ExecutionError::Resource(format!(
                    "Failed to map {} bytes of code: {}",
                    code.len(),
                    std::io::Error::last_os_error()
                )));
            }

            ptr::copy_nonoverlapping(code.as_ptr(), region as *mut u8, code.len());

            // W^X: drop write before adding execute
            if libc::mprotect(region, code.len(), libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = std::io::Error::last_os_error();
                libc::munmap(region, code.len());
                return Err(ExecutionError::Resource(format!("Failed to protect code: {}", err)));
            }

            Ok(ExecutableBuffer { base: region as *const u8, size: code.len() })
        }
    }
}

impl ExecutableCode for ExecutableBuffer {
    fn base(&self) -> *const u8 {
        self.base
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.base.is_null() && self.size > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}
