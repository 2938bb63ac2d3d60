//! First-fit arena allocator
//!
//! Free space is a map from block offset to block length, kept coalesced:
//! no two free blocks touch. All sizes round up to `ALIGNMENT`.

use std::collections::BTreeMap;

use super::format::ALIGNMENT;

fn align_up(size: u64) -> u64 {
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Allocation state of `[start, end)`
#[derive(Debug, Clone)]
pub struct ArenaAllocator {
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
    start: u64,
    end: u64,
}

impl ArenaAllocator {
    /// An allocator with the whole range free
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert_eq!(start % ALIGNMENT, 0);
        let end = start + (end.saturating_sub(start) / ALIGNMENT) * ALIGNMENT;
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        ArenaAllocator { free, free_bytes: end - start, start, end }
    }

    /// Total bytes managed
    pub fn capacity(&self) -> u64 {
        self.end - self.start
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Allocate `size` bytes, returning the block offset
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let size = align_up(size.max(1));
        let (&offset, &len) = self.free.iter().find(|(_, &len)| len >= size)?;
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.free_bytes -= size;
        Some(offset)
    }

    /// Return a block obtained from `allocate` or `reserve`
    pub fn release(&mut self, offset: u64, size: u64) {
        let mut offset = offset;
        let mut size = align_up(size.max(1));
        debug_assert!(offset >= self.start && offset + size <= self.end);
        self.free_bytes += size;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                size += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + size)) {
            size += next_len;
        }
        self.free.insert(offset, size);
    }

    /// Mark a specific range allocated, as when rebuilding from a saved index
    ///
    /// Fails if any part of the range is not free.
    pub fn reserve(&mut self, offset: u64, size: u64) -> bool {
        let size = align_up(size.max(1));
        if offset % ALIGNMENT != 0 {
            return false;
        }
        let Some((&block, &len)) = self.free.range(..=offset).next_back() else {
            return false;
        };
        if offset + size > block + len {
            return false;
        }

        self.free.remove(&block);
        if offset > block {
            self.free.insert(block, offset - block);
        }
        let tail = block + len - (offset + size);
        if tail > 0 {
            self.free.insert(offset + size, tail);
        }
        self.free_bytes -= size;
        true
    }
}
