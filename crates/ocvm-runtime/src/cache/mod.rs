//! Persistent code cache
//!
//! One pre-sized file holds every compiled blob, addressed by file offset.
//! The file is mapped twice: read-write for the cache and read+execute for
//! executors, so a descriptor's `code_begin` is directly usable as an offset
//! into `ExecutableMapping`.
//!
//! Crash safety rests on the header's dirty flag. Opening sets it (and
//! syncs) once every fallible setup step has succeeded and before anything
//! writes to the arena; only a clean `close`,
//! after the descriptor index is written back, clears it. A set flag at
//! open means the previous owner died mid-session and the file is rejected.

mod allocator;
mod format;
mod lru;
mod mapping;

pub use format::{ARENA_START, CACHE_MAGIC, HEADER_OFFSET};
pub use mapping::ExecutableMapping;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use ocvm_engine::{CodeDescriptor, CodeTuple, CompiledModule, CODEGEN_VERSION};

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheIntegrityError};
use allocator::ArenaAllocator;
use format::{CacheHeader, HEADER_SIZE};
use lru::LruIndex;
use mapping::FileMapping;

/// Result of a successful `insert`
#[derive(Debug, Clone)]
pub struct Inserted {
    /// Descriptor of the new entry
    pub descriptor: Arc<CodeDescriptor>,
    /// Entries evicted to make room, including any left unreported by a
    /// failed insert
    pub evicted: Vec<CodeTuple>,
}

/// The on-disk code cache
///
/// Single owner: the node constructs one at startup, shares it as
/// `Arc<Mutex<CodeCache>>`, and closes it at shutdown.
pub struct CodeCache {
    path: PathBuf,
    file: Option<File>,
    mapping: FileMapping,
    executable: Arc<ExecutableMapping>,
    allocator: ArenaAllocator,
    index: LruIndex<Arc<CodeDescriptor>>,
    /// Evicted while an executor still held them; freed once released
    deferred: Vec<Arc<CodeDescriptor>>,
    /// Policy evictions not yet reported through `Inserted`
    evicted: Vec<CodeTuple>,
    watermark: f64,
    batch: usize,
    closed: bool,
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .field("free_bytes", &self.allocator.free_bytes())
            .field("capacity", &self.allocator.capacity())
            .finish()
    }
}

impl CodeCache {
    /// Open or create the cache file described by `config`
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let path = config.path.clone();
        if config.size <= ARENA_START {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Cache size {} leaves no arena", config.size),
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => return Err(CacheError::Locked { path }),
            Err(e) => return Err(CacheError::Io(e.into())),
        }

        let existing = file.metadata()?.len();
        let header = if existing == 0 {
            CacheHeader::empty()
        } else {
            read_header(&file, existing)?
        };
        let magic = header.magic;
        if magic != CACHE_MAGIC {
            return Err(CacheIntegrityError::BadMagic { found: magic, expected: CACHE_MAGIC }.into());
        }
        if header.dirty != 0 {
            return Err(CacheIntegrityError::Dirty.into());
        }

        let len = existing.max(config.size);
        if len > existing {
            file.set_len(len)?;
        }
        let mut mapping = FileMapping::new(&file, len as usize)?;

        let mut allocator = ArenaAllocator::new(ARENA_START, len);
        let index = load_index(&mapping, &header, &mut allocator)?;
        let executable = Arc::new(ExecutableMapping::new(&file, len as usize)?);

        // Last step: a failure before here leaves the file clean
        let opened = CacheHeader { magic: CACHE_MAGIC, dirty: 1, index_offset: 0, index_len: 0 };
        opened.write_to(&mut mapping.bytes_mut()[HEADER_OFFSET as usize..]);
        mapping.flush()?;
        file.sync_all()?;

        log::info!(
            "Opened code cache {} ({} entries, {} of {} bytes free)",
            path.display(),
            index.len(),
            allocator.free_bytes(),
            allocator.capacity()
        );

        Ok(CodeCache {
            path,
            file: Some(file),
            mapping,
            executable,
            allocator,
            index,
            deferred: Vec::new(),
            evicted: Vec::new(),
            watermark: config.eviction_watermark,
            batch: config.eviction_batch.max(1),
            closed: false,
        })
    }

    /// Cache file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The executable view descriptors refer to
    pub fn executable(&self) -> Arc<ExecutableMapping> {
        Arc::clone(&self.executable)
    }

    /// Look up an entry and mark it most recently used
    ///
    /// While the returned handle is alive the entry is exempt from eviction.
    pub fn get(&mut self, tuple: &CodeTuple) -> Option<Arc<CodeDescriptor>> {
        if self.closed {
            return None;
        }
        self.index.touch(tuple).cloned()
    }

    /// Look up an entry without touching it
    pub fn peek(&self, tuple: &CodeTuple) -> Option<Arc<CodeDescriptor>> {
        self.index.peek(tuple).cloned()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Arena size in bytes
    pub fn capacity(&self) -> u64 {
        self.allocator.capacity()
    }

    /// Unallocated arena bytes
    pub fn free_bytes(&self) -> u64 {
        self.allocator.free_bytes()
    }

    /// Tuples from most to least recently used
    pub fn tuples(&self) -> Vec<CodeTuple> {
        self.index.iter().map(|(tuple, _)| *tuple).collect()
    }

    /// Copy a compiled blob into the arena and index it
    ///
    /// Evicts least-recently-used batches until the blob fits, then keeps
    /// evicting while free space is under the watermark. An existing entry
    /// for `tuple` is replaced.
    pub fn insert(&mut self, tuple: CodeTuple, compiled: &CompiledModule) -> Result<Inserted, CacheError> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        self.reclaim();

        let size = compiled.code.len() as u64;
        let capacity = self.allocator.capacity();
        if size > capacity {
            return Err(CacheError::TooFull { size, capacity });
        }
        if let Some(old) = self.index.remove(&tuple) {
            self.release(old);
        }

        let offset = loop {
            if let Some(offset) = self.allocator.allocate(size) {
                break offset;
            }
            let round = self.evict_round(None);
            if round.is_empty() {
                log::warn!(
                    "No room for {} bytes of {} with {} entries pinned",
                    size,
                    tuple,
                    self.index.len() + self.deferred.len()
                );
                return Err(CacheError::TooFull { size, capacity });
            }
            self.evicted.extend(round);
        };

        let start = offset as usize;
        self.mapping.bytes_mut()[start..start + compiled.code.len()].copy_from_slice(&compiled.code);
        let descriptor = Arc::new(compiled.descriptor_at(tuple.code_hash, tuple.vm_version, offset));
        self.index.push_front(tuple, Arc::clone(&descriptor));

        let threshold = (capacity as f64 * self.watermark) as u64;
        while self.allocator.free_bytes() < threshold {
            let round = self.evict_round(Some(&tuple));
            if round.is_empty() {
                break;
            }
            self.evicted.extend(round);
        }

        log::debug!("Cached {} ({} bytes at {:#x})", tuple, size, offset);
        Ok(Inserted { descriptor, evicted: std::mem::take(&mut self.evicted) })
    }

    /// Evictions made by a failed `insert` that no `Inserted` has reported
    pub fn take_evicted(&mut self) -> Vec<CodeTuple> {
        std::mem::take(&mut self.evicted)
    }

    /// Remove an entry
    ///
    /// If an executor still holds its descriptor, the blob's bytes stay
    /// allocated until the handle drops and `reclaim` runs.
    pub fn evict(&mut self, tuple: &CodeTuple) -> bool {
        match self.index.remove(tuple) {
            Some(descriptor) => {
                self.release(descriptor);
                true
            }
            None => false,
        }
    }

    /// Free blobs of evicted entries whose last handle has dropped,
    /// returning the bytes freed
    pub fn reclaim(&mut self) -> u64 {
        let allocator = &mut self.allocator;
        let mut freed = 0;
        self.deferred.retain(|descriptor| {
            if Arc::strong_count(descriptor) > 1 {
                return true;
            }
            allocator.release(descriptor.code_begin, descriptor.code_size);
            freed += descriptor.code_size;
            false
        });
        freed
    }

    /// Persist the index and mark the file clean
    ///
    /// Later calls are no-ops; lookups return nothing and inserts fail once
    /// closed. Executors holding the `ExecutableMapping` are unaffected.
    pub fn close(&mut self) -> Result<(), CacheError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reclaim();

        let (index_offset, index_len) = self.write_index()?;
        let header = CacheHeader { magic: CACHE_MAGIC, dirty: 0, index_offset, index_len };
        header.write_to(&mut self.mapping.bytes_mut()[HEADER_OFFSET as usize..]);
        self.mapping.flush()?;
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }

        log::info!("Closed code cache {} ({} entries)", self.path.display(), self.index.len());
        Ok(())
    }

    fn write_index(&mut self) -> Result<(u64, u64), CacheError> {
        loop {
            if self.index.is_empty() {
                return Ok((0, 0));
            }
            let blob = {
                let descriptors: Vec<&CodeDescriptor> = self.index.iter().map(|(_, d)| d.as_ref()).collect();
                bincode::serialize(&descriptors)?
            };
            if let Some(offset) = self.allocator.allocate(blob.len() as u64) {
                let start = offset as usize;
                self.mapping.bytes_mut()[start..start + blob.len()].copy_from_slice(&blob);
                return Ok((offset, blob.len() as u64));
            }

            let victim = self
                .index
                .iter_lru()
                .find(|(_, d)| Arc::strong_count(d) == 1)
                .map(|(tuple, _)| *tuple);
            match victim {
                Some(tuple) => {
                    log::debug!("Dropping {} to make room for the index", tuple);
                    self.evict(&tuple);
                }
                None => {
                    log::warn!("No room to persist the cache index; the cache will reopen empty");
                    return Ok((0, 0));
                }
            }
        }
    }

    /// Up to one batch of unpinned entries from the LRU end
    fn evict_round(&mut self, keep: Option<&CodeTuple>) -> Vec<CodeTuple> {
        let victims: Vec<CodeTuple> = self
            .index
            .iter_lru()
            .filter(|(tuple, descriptor)| Some(*tuple) != keep && Arc::strong_count(descriptor) == 1)
            .take(self.batch)
            .map(|(tuple, _)| *tuple)
            .collect();
        for tuple in &victims {
            if let Some(descriptor) = self.index.remove(tuple) {
                self.release(descriptor);
            }
        }
        if !victims.is_empty() {
            log::debug!(
                "Evicted {} entries, {} bytes free",
                victims.len(),
                self.allocator.free_bytes()
            );
        }
        victims
    }

    fn release(&mut self, descriptor: Arc<CodeDescriptor>) {
        if Arc::strong_count(&descriptor) == 1 {
            self.allocator.release(descriptor.code_begin, descriptor.code_size);
        } else {
            self.deferred.push(descriptor);
        }
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close code cache {}: {}", self.path.display(), e);
        }
    }
}

fn read_header(file: &File, len: u64) -> Result<CacheHeader, CacheError> {
    if len < HEADER_OFFSET + HEADER_SIZE as u64 {
        return Err(CacheIntegrityError::BadMagic { found: 0, expected: CACHE_MAGIC }.into());
    }
    let mut bytes = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut bytes, HEADER_OFFSET)?;
    CacheHeader::from_bytes(&bytes)
        .ok_or_else(|| CacheIntegrityError::BadMagic { found: 0, expected: CACHE_MAGIC }.into())
}

/// Rebuild the LRU index and allocator from the persisted descriptor list
fn load_index(
    mapping: &FileMapping,
    header: &CacheHeader,
    allocator: &mut ArenaAllocator,
) -> Result<LruIndex<Arc<CodeDescriptor>>, CacheError> {
    let mut index = LruIndex::new();
    let (offset, len) = (header.index_offset, header.index_len);
    if len == 0 {
        return Ok(index);
    }

    let bytes = mapping.bytes();
    let end = offset.checked_add(len).filter(|&end| offset >= ARENA_START && end <= bytes.len() as u64);
    let Some(end) = end else {
        return Err(CacheError::Serialization(Box::new(bincode::ErrorKind::Custom(format!(
            "Index at {}+{} lies outside the arena",
            offset, len
        )))));
    };
    let descriptors: Vec<CodeDescriptor> = bincode::deserialize(&bytes[offset as usize..end as usize])?;

    let mut stale = 0;
    // Stored most recent first; pushing in reverse restores the order
    for descriptor in descriptors.into_iter().rev() {
        if descriptor.meta.codegen_version != CODEGEN_VERSION {
            stale += 1;
            continue;
        }
        if !allocator.reserve(descriptor.code_begin, descriptor.code_size) {
            log::warn!("Dropping {}: blob overlaps another entry", descriptor.tuple());
            stale += 1;
            continue;
        }
        index.push_front(descriptor.tuple(), Arc::new(descriptor));
    }
    if stale > 0 {
        log::info!("Dropped {} cache entries compiled for another code generator", stale);
    }
    Ok(index)
}
