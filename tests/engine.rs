//! Engine round trips, boundary behaviour, and lifecycle semantics against
//! real mapped regions.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use netshell::{Attr, CacheError, ShmCache};

static TOKEN_SEQ: AtomicU32 = AtomicU32::new(0);

/// Unique region path per test, removed on drop.
struct TokenFile(PathBuf);

impl TokenFile {
    fn new(tag: &str) -> TokenFile {
        let seq = TOKEN_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "netshell-test-{tag}-{}-{seq}.mmap",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        TokenFile(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TokenFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn small_attr() -> Attr {
    Attr {
        mem_limit: 2 * 1024 * 1024,
        item_size_min: 64,
        item_size_max: 64 * 1024,
        nbuckets: 1024,
        ..Attr::default()
    }
}

/// Sized so the smallest class gets exactly one batch of 8 chunks and the
/// arena has no room to grow: 3 classes x 1024-byte batches in a 4096-byte
/// budget.
fn tight_attr(evict: u32) -> Attr {
    Attr {
        mem_limit: 4096,
        item_size_min: 64,
        item_size_max: 1024,
        nbuckets: 64,
        evict_to_free: evict,
        ..Attr::default()
    }
}

fn x(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}

#[test]
fn create_then_attach_share_data() {
    let token = TokenFile::new("share");
    let a = ShmCache::create(token.path(), &small_attr()).unwrap();
    a.set(b"shared", b"payload", 7).unwrap();

    let b = ShmCache::attach(token.path()).unwrap();
    let (val, flags) = b.get(b"shared").unwrap();
    assert_eq!(val, b"payload");
    assert_eq!(flags, 7);

    b.set(b"reverse", b"direction", 0).unwrap();
    let (val, _) = a.get(b"reverse").unwrap();
    assert_eq!(val, b"direction");

    a.verify().unwrap();
    b.destroy();
    a.destroy();
}

#[test]
fn attach_without_file_is_a_token_error() {
    let token = TokenFile::new("notoken");
    match ShmCache::attach(token.path()) {
        Err(CacheError::Token) => {}
        other => panic!("expected Token, got {other:?}"),
    }
}

#[test]
fn second_create_is_rejected() {
    let token = TokenFile::new("ecreate");
    let a = ShmCache::create(token.path(), &small_attr()).unwrap();
    match ShmCache::create(token.path(), &small_attr()) {
        Err(CacheError::Create) => {}
        other => panic!("expected Create, got {other:?}"),
    }
    a.destroy();
}

#[test]
fn version_mismatch_is_rejected() {
    let token = TokenFile::new("version");
    ShmCache::create(token.path(), &small_attr()).unwrap().destroy();

    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(token.path())
        .unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();
    drop(file);

    match ShmCache::attach(token.path()) {
        Err(CacheError::Version) => {}
        other => panic!("expected Version, got {other:?}"),
    }
}

#[test]
fn counters_start_at_zero_and_saturate() {
    let token = TokenFile::new("counter");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();

    assert_eq!(cache.incr(b"c", 5).unwrap(), 5);
    assert_eq!(cache.decr(b"c", 3).unwrap(), 2);
    assert_eq!(cache.decr(b"c", 7).unwrap(), 0);

    // The counter lives in its fixed-width slot: digits, NUL, space padding.
    let (val, _) = cache.get(b"c").unwrap();
    assert_eq!(val.len(), 21);
    assert_eq!(val[0], b'0');
    assert_eq!(val[1], 0);
    assert!(val[2..].iter().all(|&b| b == b' '));

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn incr_migrates_a_non_counter_value() {
    let token = TokenFile::new("migrate-counter");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();

    cache.set(b"k", b"12ab", 9).unwrap();
    // Digit scan stops at 'a'; flags survive the migration.
    assert_eq!(cache.incr(b"k", 8).unwrap(), 20);
    let (val, flags) = cache.get(b"k").unwrap();
    assert_eq!(val.len(), 21);
    assert_eq!(&val[..2], b"20");
    assert_eq!(flags, 9);

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn incr_without_default_counter_misses() {
    let token = TokenFile::new("nocounter");
    let attr = Attr {
        default_counter: 0,
        ..small_attr()
    };
    let cache = ShmCache::create(token.path(), &attr).unwrap();
    match cache.incr(b"absent", 1) {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    cache.destroy();
}

#[test]
fn add_replace_round_trip() {
    let token = TokenFile::new("add-replace");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();

    match cache.replace(b"k", &x(b'c', 96), 0) {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    cache.add(b"k", &x(b'b', 32), 0).unwrap();
    match cache.add(b"k", &x(b'b', 32), 0) {
        Err(CacheError::Exists) => {}
        other => panic!("expected Exists, got {other:?}"),
    }

    cache.replace(b"k", &x(b'c', 64), 0).unwrap();
    let (val, _) = cache.get(b"k").unwrap();
    assert_eq!(val, x(b'c', 64));

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn prepend_append_migrate_classes() {
    let token = TokenFile::new("concat");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();

    match cache.prepend(b"k", &x(b'a', 16), 0) {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    match cache.append(b"k", &x(b'd', 96), 0) {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    cache.set(b"k", &x(b'c', 64), 0).unwrap();
    cache.prepend(b"k", &x(b'a', 16), 0).unwrap();
    cache.append(b"k", &x(b'd', 96), 0).unwrap();

    let (val, _) = cache.get(b"k").unwrap();
    assert_eq!(val.len(), 176);
    assert_eq!(&val[..16], &x(b'a', 16)[..]);
    assert_eq!(&val[16..80], &x(b'c', 64)[..]);
    assert_eq!(&val[80..], &x(b'd', 96)[..]);

    // verify() recomputes each item's class from its sizes, so a missed
    // migration would be caught here.
    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn delete_then_miss() {
    let token = TokenFile::new("delete");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();

    cache.set(b"gone", b"soon", 0).unwrap();
    cache.del(b"gone").unwrap();
    match cache.get(b"gone") {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    match cache.del(b"gone") {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn getf_respects_the_caller_buffer() {
    let token = TokenFile::new("getf");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();
    cache.set(b"k", b"hello", 3).unwrap();

    let mut tiny = [0u8; 3];
    match cache.getf(b"k", &mut tiny) {
        Err(CacheError::Space) => {}
        other => panic!("expected Space, got {other:?}"),
    }

    let mut buf = [0u8; 16];
    let (n, flags) = cache.getf(b"k", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(flags, 3);

    cache.destroy();
}

#[test]
fn oversized_items_are_rejected() {
    let token = TokenFile::new("esize");
    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();

    // At or past item_size_max.
    match cache.set(b"k", &x(b'x', 64 * 1024), 0) {
        Err(CacheError::Size) => {}
        other => panic!("expected Size, got {other:?}"),
    }

    // Under the limit but above the largest generated class (32 KiB chunks).
    match cache.set(b"k", &x(b'x', 40_000), 0) {
        Err(CacheError::Size) => {}
        other => panic!("expected Size, got {other:?}"),
    }

    // An append that would outgrow the limit rejects and leaves the entry.
    cache.set(b"k", &x(b'a', 16), 0).unwrap();
    match cache.append(b"k", &x(b'b', 64 * 1024), 0) {
        Err(CacheError::Size) => {}
        other => panic!("expected Size, got {other:?}"),
    }
    assert_eq!(cache.get(b"k").unwrap().0, x(b'a', 16));

    cache.destroy();
}

#[test]
fn full_arena_without_eviction_reports_nomemory() {
    let token = TokenFile::new("nomemory");
    let cache = ShmCache::create(token.path(), &tight_attr(0)).unwrap();

    for i in 0..8 {
        cache.set(format!("k{i}").as_bytes(), b"payload!", 0).unwrap();
    }
    match cache.set(b"k8", b"payload!", 0) {
        Err(CacheError::NoMemory) => {}
        other => panic!("expected NoMemory, got {other:?}"),
    }

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn full_arena_with_eviction_drops_the_lru_tail() {
    let token = TokenFile::new("evict");
    let cache = ShmCache::create(token.path(), &tight_attr(1)).unwrap();

    for i in 0..8 {
        cache.set(format!("k{i}").as_bytes(), b"payload!", 0).unwrap();
    }
    cache.set(b"k8", b"payload!", 0).unwrap();

    // k0 was the least recently used entry of the class; everyone else
    // survives.
    match cache.get(b"k0") {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    for i in 1..9 {
        cache.get(format!("k{i}").as_bytes()).unwrap();
    }

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn reads_refresh_lru_position() {
    let token = TokenFile::new("lru-touch");
    let cache = ShmCache::create(token.path(), &tight_attr(1)).unwrap();

    for i in 0..8 {
        cache.set(format!("k{i}").as_bytes(), b"payload!", 0).unwrap();
    }
    // Touching k0 moves it to the head, so the next eviction takes k1.
    cache.get(b"k0").unwrap();
    cache.set(b"k8", b"payload!", 0).unwrap();

    cache.get(b"k0").unwrap();
    match cache.get(b"k1") {
        Err(CacheError::NotFound) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn dump_load_round_trip() {
    let token = TokenFile::new("dump");
    let snapshot = TokenFile::new("dump-snapshot");

    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();
    for i in 0..16 {
        cache
            .set(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes(), 0)
            .unwrap();
    }
    cache.dump(snapshot.path()).unwrap();
    cache.destroy();
    fs::remove_file(token.path()).unwrap();

    let fresh = ShmCache::create(token.path(), &small_attr()).unwrap();
    fresh.load(snapshot.path()).unwrap();
    for i in 0..16 {
        let (val, _) = fresh.get(format!("key-{i}").as_bytes()).unwrap();
        assert_eq!(val, format!("value-{i}").as_bytes());
    }

    fresh.verify().unwrap();
    fresh.destroy();
}

#[test]
fn load_rejects_a_record_larger_than_its_buffer() {
    let token = TokenFile::new("load-esize");
    let snapshot = TokenFile::new("load-esize-snapshot");

    // One record whose value exceeds the 1 MiB + 1 KiB parse buffer.
    let mut file = fs::File::create(snapshot.path()).unwrap();
    write!(file, "1 1572864 k ").unwrap();
    file.write_all(&x(b'x', 1_572_864)).unwrap();
    file.write_all(b"\n").unwrap();
    drop(file);

    let cache = ShmCache::create(token.path(), &small_attr()).unwrap();
    match cache.load(snapshot.path()) {
        Err(CacheError::Size) => {}
        other => panic!("expected Size, got {other:?}"),
    }
    cache.destroy();
}

#[test]
fn flock_mode_round_trip() {
    let token = TokenFile::new("flock");
    let attr = Attr {
        use_flock: 1,
        ..small_attr()
    };
    let cache = ShmCache::create(token.path(), &attr).unwrap();

    cache.set(b"k", b"flocked", 4).unwrap();
    let (val, flags) = cache.get(b"k").unwrap();
    assert_eq!(val, b"flocked");
    assert_eq!(flags, 4);
    cache.del(b"k").unwrap();

    cache.verify().unwrap();
    cache.destroy();
}

#[test]
fn concurrent_attachments_stay_consistent() {
    let token = TokenFile::new("threads");
    let cache = Arc::new(ShmCache::create(token.path(), &small_attr()).unwrap());
    cache.set(b"shared", b"constant", 0).unwrap();

    let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let cache = Arc::clone(&cache);
        let failures = Arc::clone(&failures);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                let key = format!("t{t}-k{}", i % 25);
                let val = format!("t{t}-v{i}");
                if let Err(e) = cache.set(key.as_bytes(), val.as_bytes(), t) {
                    failures.lock().push(format!("set {key}: {e}"));
                    continue;
                }
                match cache.get(key.as_bytes()) {
                    Ok((got, flags)) if flags == t => {
                        // Our keys are private to this thread, so the read
                        // must observe our latest write.
                        if got != val.as_bytes() {
                            failures.lock().push(format!("get {key}: stale value"));
                        }
                    }
                    Ok(_) => failures.lock().push(format!("get {key}: wrong flags")),
                    Err(e) => failures.lock().push(format!("get {key}: {e}")),
                }
                if cache.get(b"shared").is_err() {
                    failures.lock().push("shared key vanished".to_string());
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let failures = failures.lock();
    assert!(failures.is_empty(), "{failures:?}");
    cache.verify().unwrap();

    Arc::try_unwrap(cache).ok().unwrap().destroy();
}
