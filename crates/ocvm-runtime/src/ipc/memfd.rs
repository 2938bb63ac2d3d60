//! Anonymous in-memory files used to hand bulk bytes across processes

use std::ffi::CStr;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::{FromRawFd, OwnedFd};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use crate::error::IpcError;

/// Copy `bytes` into a fresh memfd
pub fn write_memfd(name: &CStr, bytes: &[u8]) -> Result<OwnedFd, IpcError> {
    let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC)?;
    // Safety: `memfd_create` just returned this descriptor and nothing else owns it
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(bytes)?;
    Ok(file.into())
}

/// Read a whole memfd, refusing files longer than `limit`
pub fn read_memfd(fd: OwnedFd, limit: u64) -> Result<Vec<u8>, IpcError> {
    let file = File::from(fd);
    let len = file.metadata()?.len();
    if len > limit {
        return Err(IpcError::TooLarge { len, max: limit });
    }
    let mut bytes = vec![0u8; len as usize];
    file.read_exact_at(&mut bytes, 0)?;
    Ok(bytes)
}
