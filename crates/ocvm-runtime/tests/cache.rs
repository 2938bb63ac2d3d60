//! Code cache integration tests

mod common;

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;

use common::{blob, cache_config, key, scratch_dir, SMALL_ARENA};
use ocvm_engine::CODEGEN_VERSION;
use ocvm_runtime::cache::{CACHE_MAGIC, HEADER_OFFSET};
use ocvm_runtime::{CacheError, CacheIntegrityError, CodeCache};

const DIRTY_BYTE: u64 = HEADER_OFFSET + 8;
const INDEX_OFFSET_FIELD: u64 = HEADER_OFFSET + 9;

#[test]
fn test_insert_then_get_round_trip() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.capacity(), SMALL_ARENA);

    let module = blob(0xc3, 1000);
    let inserted = cache.insert(key(1), &module).unwrap();
    assert!(inserted.evicted.is_empty());

    let descriptor = cache.get(&key(1)).unwrap();
    assert_eq!(descriptor.tuple(), key(1));
    assert_eq!(descriptor.code_size, 1000);
    assert_eq!(descriptor.code_begin % 16, 0);
    assert_eq!(descriptor.meta, module.meta);

    let executable = cache.executable();
    let code = executable.slice(descriptor.code_begin, descriptor.code_size).unwrap();
    assert_eq!(code, &module.code[..]);
    assert_eq!(cache.free_bytes(), SMALL_ARENA - 1008);
    assert!(cache.get(&key(2)).is_none());
}

#[test]
fn test_open_sets_dirty_and_close_clears_it() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    let mut cache = CodeCache::open(&config).unwrap();

    let file = fs::File::open(&config.path).unwrap();
    let mut header = [0u8; 9];
    file.read_exact_at(&mut header, HEADER_OFFSET).unwrap();
    assert_eq!(&header[..8], &CACHE_MAGIC.to_ne_bytes());
    assert_eq!(header[8], 1);

    cache.close().unwrap();
    file.read_exact_at(&mut header, HEADER_OFFSET).unwrap();
    assert_eq!(header[8], 0);
    assert_eq!(fs::metadata(&config.path).unwrap().len(), config.size);
}

#[test]
fn test_contents_survive_clean_close() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    let (order, free, begin) = {
        let mut cache = CodeCache::open(&config).unwrap();
        for n in 1..=3 {
            cache.insert(key(n), &blob(n, 3000 + n as usize)).unwrap();
        }
        let begin = cache.get(&key(1)).unwrap().code_begin;
        let order = cache.tuples();
        let free = cache.free_bytes();
        cache.close().unwrap();
        (order, free, begin)
    };
    assert_eq!(order, vec![key(1), key(3), key(2)]);

    let mut cache = CodeCache::open(&config).unwrap();
    assert_eq!(cache.tuples(), order);
    assert_eq!(cache.free_bytes(), free);

    let descriptor = cache.get(&key(1)).unwrap();
    assert_eq!(descriptor.code_begin, begin);
    let executable = cache.executable();
    let code = executable.slice(descriptor.code_begin, descriptor.code_size).unwrap();
    assert_eq!(code, &blob(1, 3001).code[..]);
}

#[test]
fn test_dirty_cache_is_rejected() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    {
        let mut cache = CodeCache::open(&config).unwrap();
        cache.insert(key(1), &blob(1, 100)).unwrap();
    }

    // What a crash while open leaves behind
    let file = OpenOptions::new().write(true).open(&config.path).unwrap();
    file.write_all_at(&[1], DIRTY_BYTE).unwrap();
    drop(file);

    match CodeCache::open(&config) {
        Err(CacheError::Integrity(CacheIntegrityError::Dirty)) => {}
        other => panic!("expected a dirty cache, got {:?}", other),
    }
    // Rejection must not have repaired the flag
    assert!(matches!(
        CodeCache::open(&config),
        Err(CacheError::Integrity(CacheIntegrityError::Dirty))
    ));
}

#[test]
fn test_foreign_file_is_rejected() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    fs::write(&config.path, vec![0xaau8; 8192]).unwrap();

    match CodeCache::open(&config) {
        Err(CacheError::Integrity(CacheIntegrityError::BadMagic { found, expected })) => {
            assert_eq!(found, u64::from_ne_bytes([0xaa; 8]));
            assert_eq!(expected, CACHE_MAGIC);
        }
        other => panic!("expected bad magic, got {:?}", other),
    }
    // Left untouched
    assert_eq!(fs::metadata(&config.path).unwrap().len(), 8192);
}

#[test]
fn test_failed_open_leaves_file_clean() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    {
        let mut cache = CodeCache::open(&config).unwrap();
        cache.insert(key(1), &blob(1, 100)).unwrap();
    }

    // Point the index past the end of the file
    let file = OpenOptions::new().read(true).write(true).open(&config.path).unwrap();
    file.write_all_at(&u64::MAX.to_ne_bytes(), INDEX_OFFSET_FIELD).unwrap();

    for _ in 0..2 {
        assert!(matches!(CodeCache::open(&config), Err(CacheError::Serialization(_))));
        let mut dirty = [0u8; 1];
        file.read_exact_at(&mut dirty, DIRTY_BYTE).unwrap();
        assert_eq!(dirty[0], 0);
    }
}

#[test]
fn test_second_owner_is_locked_out() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    let cache = CodeCache::open(&config).unwrap();
    assert!(matches!(CodeCache::open(&config), Err(CacheError::Locked { .. })));
    drop(cache);
    assert!(CodeCache::open(&config).is_ok());
}

#[test]
fn test_least_recently_used_evicted_first() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    for n in 1..=7 {
        let inserted = cache.insert(key(n), &blob(n, 8192)).unwrap();
        assert!(inserted.evicted.is_empty());
    }
    assert_eq!(cache.free_bytes(), 8192);

    // Touching 1 exempts it from the next round
    assert!(cache.get(&key(1)).is_some());
    let inserted = cache.insert(key(8), &blob(8, 8192)).unwrap();
    assert_eq!(inserted.evicted, vec![key(2), key(3)]);
    assert_eq!(cache.free_bytes(), 2 * 8192);
    assert_eq!(cache.len(), 6);
    assert!(cache.peek(&key(1)).is_some());
    assert!(cache.peek(&key(2)).is_none());
}

#[test]
fn test_eviction_makes_room_for_large_blob() {
    let dir = scratch_dir();
    let mut config = cache_config(dir.path(), SMALL_ARENA);
    config.eviction_watermark = 0.0;
    let mut cache = CodeCache::open(&config).unwrap();
    for n in 1..=8 {
        cache.insert(key(n), &blob(n, 8192)).unwrap();
    }
    assert_eq!(cache.free_bytes(), 0);

    let inserted = cache.insert(key(9), &blob(9, 3 * 8192)).unwrap();
    assert_eq!(inserted.evicted, vec![key(1), key(2), key(3), key(4)]);
    let descriptor = cache.get(&key(9)).unwrap();
    let executable = cache.executable();
    assert!(executable
        .slice(descriptor.code_begin, descriptor.code_size)
        .unwrap()
        .iter()
        .all(|&b| b == 9));
}

#[test]
fn test_pinned_entries_are_not_evicted() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    for n in 1..=7 {
        cache.insert(key(n), &blob(n, 8192)).unwrap();
    }
    // `peek` pins without touching
    let running = cache.peek(&key(2)).unwrap();
    let inserted = cache.insert(key(8), &blob(8, 8192)).unwrap();
    assert_eq!(inserted.evicted, vec![key(1), key(3)]);
    assert!(cache.peek(&key(2)).is_some());
    drop(running);
}

#[test]
fn test_evicting_a_running_entry_defers_the_free() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    cache.insert(key(1), &blob(1, 4096)).unwrap();
    let free = cache.free_bytes();

    let running = cache.get(&key(1)).unwrap();
    assert!(cache.evict(&key(1)));
    assert!(!cache.evict(&key(1)));
    assert!(cache.get(&key(1)).is_none());
    assert_eq!(cache.reclaim(), 0);
    assert_eq!(cache.free_bytes(), free);

    let executable = cache.executable();
    assert!(executable.slice(running.code_begin, running.code_size).unwrap().iter().all(|&b| b == 1));
    drop(running);
    assert_eq!(cache.reclaim(), 4096);
    assert_eq!(cache.free_bytes(), SMALL_ARENA);
}

#[test]
fn test_blob_larger_than_cache() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    match cache.insert(key(1), &blob(1, SMALL_ARENA as usize + 1)) {
        Err(CacheError::TooFull { size, capacity }) => {
            assert_eq!(size, SMALL_ARENA + 1);
            assert_eq!(capacity, SMALL_ARENA);
        }
        other => panic!("expected TooFull, got {:?}", other),
    }
    assert!(cache.is_empty());
}

#[test]
fn test_too_full_when_everything_is_pinned() {
    let dir = scratch_dir();
    let mut config = cache_config(dir.path(), SMALL_ARENA);
    config.eviction_watermark = 0.0;
    let mut cache = CodeCache::open(&config).unwrap();
    let mut running = Vec::new();
    for n in 1..=8 {
        running.push(cache.insert(key(n), &blob(n, 8192)).unwrap().descriptor);
    }
    assert!(matches!(cache.insert(key(9), &blob(9, 16)), Err(CacheError::TooFull { .. })));
    assert_eq!(cache.len(), 8);

    running.truncate(7);
    let inserted = cache.insert(key(9), &blob(9, 16)).unwrap();
    assert_eq!(inserted.evicted, vec![key(8)]);
}

#[test]
fn test_reinsert_replaces_entry() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    cache.insert(key(1), &blob(1, 500)).unwrap();
    cache.insert(key(1), &blob(2, 700)).unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.free_bytes(), SMALL_ARENA - 704);
    assert_eq!(cache.get(&key(1)).unwrap().code_size, 700);
}

#[test]
fn test_entries_from_other_code_generators_are_dropped() {
    let dir = scratch_dir();
    let config = cache_config(dir.path(), SMALL_ARENA);
    {
        let mut cache = CodeCache::open(&config).unwrap();
        let mut stale = blob(1, 1024);
        stale.meta.codegen_version = CODEGEN_VERSION.wrapping_add(1);
        cache.insert(key(1), &stale).unwrap();
        cache.insert(key(2), &blob(2, 1024)).unwrap();
        cache.close().unwrap();
    }

    let cache = CodeCache::open(&config).unwrap();
    assert_eq!(cache.tuples(), vec![key(2)]);
    assert_eq!(cache.free_bytes(), SMALL_ARENA - 1024);
}

#[test]
fn test_file_grows_but_never_shrinks() {
    let dir = scratch_dir();
    let small = cache_config(dir.path(), SMALL_ARENA);
    let mut large = small.clone();
    large.size += SMALL_ARENA;

    drop(CodeCache::open(&small).unwrap());
    let cache = CodeCache::open(&large).unwrap();
    assert_eq!(cache.capacity(), 2 * SMALL_ARENA);
    drop(cache);

    let cache = CodeCache::open(&small).unwrap();
    assert_eq!(cache.capacity(), 2 * SMALL_ARENA);
    assert_eq!(fs::metadata(&small.path).unwrap().len(), large.size);
}

#[test]
fn test_closed_cache_refuses_work() {
    let dir = scratch_dir();
    let mut cache = CodeCache::open(&cache_config(dir.path(), SMALL_ARENA)).unwrap();
    cache.insert(key(1), &blob(1, 64)).unwrap();
    cache.close().unwrap();
    cache.close().unwrap();
    assert!(cache.get(&key(1)).is_none());
    assert!(matches!(cache.insert(key(2), &blob(2, 64)), Err(CacheError::Closed)));
}
