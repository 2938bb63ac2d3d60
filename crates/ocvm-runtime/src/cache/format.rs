//! On-disk cache layout
//!
//! ```text
//! 0        512                       4096                          size
//! ┌────────┬─────────────┬───────────┬──────────────────────────────┐
//! │ unused │ CacheHeader │  padding  │ arena: code blobs + index    │
//! └────────┴─────────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! Arena offsets are file offsets, so a blob at offset `o` sits at
//! `mapping_base + o` in both the writable and the executable mapping.

/// Byte offset of the header within the file
pub const HEADER_OFFSET: u64 = 512;

/// First byte of the allocator arena
pub const ARENA_START: u64 = 4096;

/// Layout identifier: "OCVMCC" plus a layout revision
pub const CACHE_MAGIC: u64 = 0x4f43_564d_4343_0001;

/// Allocation granularity; also the alignment of every blob
pub const ALIGNMENT: u64 = 16;

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<CacheHeader>();

/// The file's only fixed-position record
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    /// `CACHE_MAGIC` for a usable file
    pub magic: u64,
    /// Non-zero while a process has the cache open
    pub dirty: u8,
    /// Arena offset of the serialized descriptor index
    pub index_offset: u64,
    /// Length of the serialized index; 0 for an empty cache
    pub index_len: u64,
}

impl CacheHeader {
    /// Header of a freshly created, empty file
    pub fn empty() -> Self {
        CacheHeader { magic: CACHE_MAGIC, dirty: 0, index_offset: 0, index_len: 0 }
    }

    /// Read the header from the start of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        // Safety: length checked; `CacheHeader` is plain data with alignment 1
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const CacheHeader) })
    }

    /// Write the header to the start of `bytes`
    pub fn write_to(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= HEADER_SIZE);
        // Safety: length checked above
        unsafe { std::ptr::write_unaligned(bytes.as_mut_ptr() as *mut CacheHeader, *self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_packed() {
        assert_eq!(HEADER_SIZE, 25);
        assert!(HEADER_OFFSET as usize + HEADER_SIZE <= ARENA_START as usize);
    }

    #[test]
    fn test_field_positions() {
        let mut bytes = [0u8; HEADER_SIZE];
        let header = CacheHeader { magic: CACHE_MAGIC, dirty: 1, index_offset: 4096, index_len: 7 };
        header.write_to(&mut bytes);
        assert_eq!(&bytes[..8], &CACHE_MAGIC.to_ne_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..17], &4096u64.to_ne_bytes());
        assert_eq!(CacheHeader::from_bytes(&bytes), Some(header));
        assert_eq!(CacheHeader::from_bytes(&bytes[..10]), None);
    }
}
