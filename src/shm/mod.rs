//! Shared-memory cache engine.
//!
//! A single file-backed region holds its own metadata, a slab allocator with
//! preformatted free lists, per-class LRU lists, a chained hash table and the
//! process-shared locks. Multiple processes (each possibly multi-threaded)
//! attach to the same file and mutate the structure concurrently; every
//! pointer stored inside the region is a byte offset from the region base so
//! the graph reads the same at any mapping address.

mod assoc;
pub mod layout;
mod lock;
mod lru;
mod region;
mod slab;

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use log::warn;

pub use layout::{Attr, VERSION};

use layout::ITEM_HEADER_SIZE;
use region::Region;

/// Value slot used by the arithmetic operations: room for the 20 decimal
/// digits of `u64::MAX + 1` plus a trailing NUL. The slot is pre-filled with
/// spaces and rewritten in place; readers stop at the first non-digit, so
/// the padding is benign. Snapshots depend on this exact encoding.
const COUNTER_SLOT: usize = 21;

const LOAD_BUFFER_SIZE: usize = 1024 * 1024 + 1024;

/// The closed set of engine outcomes that are not `Ok`.
#[derive(Debug)]
pub enum CacheError {
    /// Key not present.
    NotFound,
    /// Key already present (`add`).
    Exists,
    /// Item too large for any size class.
    Size,
    /// Caller-supplied buffer too small.
    Space,
    /// Arena exhausted and eviction disabled or fruitless.
    NoMemory,
    /// Token file does not exist (attach).
    Token,
    /// Token file already exists (create).
    Create,
    /// Region was formatted by an incompatible build.
    Version,
    /// Whatever the platform reported.
    System(io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "key not found"),
            CacheError::Exists => write!(f, "key already exists"),
            CacheError::Size => write!(f, "object too large"),
            CacheError::Space => write!(f, "caller buffer too small"),
            CacheError::NoMemory => write!(f, "out of memory"),
            CacheError::Token => write!(f, "token does not exist"),
            CacheError::Create => write!(f, "region already created"),
            CacheError::Version => write!(f, "region version conflict"),
            CacheError::System(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::System(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        CacheError::System(e)
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// One process's handle to a shared cache.
///
/// All operations take `&self`: mutation goes through the region locks, not
/// through Rust's borrow system. With `use_flock` the handle must not be
/// shared between threads (the kernel keeps one byte-range lock per process
/// and file, so a second thread's unlock releases the first thread's lock).
#[derive(Debug)]
pub struct ShmCache {
    region: Region,
}

impl ShmCache {
    /// Create a new cache region at `token`. Fails with
    /// [`CacheError::Create`] if the file already exists.
    pub fn create(token: &Path, attr: &Attr) -> Result<ShmCache> {
        let mut attr = *attr;
        attr.mem_used = 0;
        attr.slabs_count = 0;
        attr.max_depth = 0;
        attr.nitems = 0;
        if attr.item_size_factor <= 1.5 {
            attr.item_size_factor = 1.5;
        }

        let region = Region::create(token, &attr)?;
        Ok(ShmCache { region })
    }

    /// Attach to an existing cache region at `token`.
    pub fn attach(token: &Path) -> Result<ShmCache> {
        let region = Region::attach(token)?;
        Ok(ShmCache { region })
    }

    /// Detach: flush the region to its file synchronously, then unmap and
    /// close. The region file (and the locks inside it) persist for other
    /// attachments.
    pub fn destroy(self) {
        let size = {
            let lock = self.region.lock();
            lock.wrlock();
            let attr = self.region.attr();
            let size = layout::region_size(attr, attr.slabs_count);
            lock.unlock();
            size
        };

        if let Err(e) = self.region.sync(size) {
            warn!(target: "netshell::region", "msync on teardown failed: {e}");
        }
    }

    /// Snapshot of the attribute block.
    pub fn attr(&self) -> Attr {
        let lock = self.region.lock();
        lock.rdlock();
        let attr = *self.region.attr();
        lock.unlock();
        attr
    }

    /// Look up a key, returning a copy of the value and the stored flags.
    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, u32)> {
        let lock = self.region.lock();
        lock.rdlock();
        let rc = unsafe { self.get_inner(key) };
        lock.unlock();
        rc
    }

    /// Look up a key, copying the value into `out`. Returns the value length
    /// and flags; fails with [`CacheError::Space`] when `out` is too small.
    pub fn getf(&self, key: &[u8], out: &mut [u8]) -> Result<(usize, u32)> {
        let lock = self.region.lock();
        lock.rdlock();
        let rc = unsafe { self.getf_inner(key, out) };
        lock.unlock();
        rc
    }

    /// Unconditionally store `val` under `key`, replacing any existing entry.
    pub fn set(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.set_inner(key, val, flags) };
        lock.unlock();
        rc
    }

    /// Store only if the key is absent.
    pub fn add(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.add_inner(key, val, flags) };
        lock.unlock();
        rc
    }

    /// Store only if the key is present.
    pub fn replace(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.replace_inner(key, val, flags) };
        lock.unlock();
        rc
    }

    /// Splice `val` in front of an existing value.
    pub fn prepend(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.concat_inner(key, val, flags, true) };
        lock.unlock();
        rc
    }

    /// Splice `val` after an existing value.
    pub fn append(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.concat_inner(key, val, flags, false) };
        lock.unlock();
        rc
    }

    /// Add `delta` to the decimal counter stored under `key`.
    pub fn incr(&self, key: &[u8], delta: u64) -> Result<u64> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.arith_inner(key, delta, true) };
        lock.unlock();
        rc
    }

    /// Subtract `delta` from the counter, saturating at zero.
    pub fn decr(&self, key: &[u8], delta: u64) -> Result<u64> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.arith_inner(key, delta, false) };
        lock.unlock();
        rc
    }

    /// Remove a key.
    pub fn del(&self, key: &[u8]) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.del_inner(key) };
        lock.unlock();
        rc
    }

    /// Write every live item to `path`, one `"<nkey> <nval> <key> <val>\n"`
    /// record per line. Keys and values are written raw; a key containing a
    /// space or newline will not reload correctly, which is the price of
    /// keeping the snapshot format stable.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.dump_inner(path) };
        lock.unlock();
        rc
    }

    /// Re-`set` every record of a dump file.
    pub fn load(&self, path: &Path) -> Result<()> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.load_inner(path) };
        lock.unlock();
        rc
    }

    fn size_check(&self, nkey: usize, nval: usize) -> Result<()> {
        let attr = self.region.attr();
        if (ITEM_HEADER_SIZE + nkey + nval) as u64 >= attr.item_size_max {
            return Err(CacheError::Size);
        }
        // The class sizes top out below item_size_max, so an item can be
        // under the limit yet still fit no class.
        if unsafe { slab::class_of(&self.region, nkey, nval) }.is_none() {
            return Err(CacheError::Size);
        }
        Ok(())
    }

    unsafe fn get_inner(&self, key: &[u8]) -> Result<(Vec<u8>, u32)> {
        let r = &self.region;
        let off = assoc::find(r, key);
        if off == 0 {
            return Err(CacheError::NotFound);
        }

        let lock = r.lock();
        lock.lru_lock();
        lru::relink(r, off);
        lock.lru_unlock();

        let item = r.item(off);
        let val = r.bytes(item.val, item.nval as usize).to_vec();
        Ok((val, item.flags))
    }

    unsafe fn getf_inner(&self, key: &[u8], out: &mut [u8]) -> Result<(usize, u32)> {
        let r = &self.region;
        let off = assoc::find(r, key);
        if off == 0 {
            return Err(CacheError::NotFound);
        }

        let lock = r.lock();
        lock.lru_lock();
        lru::relink(r, off);
        lock.lru_unlock();

        let item = r.item(off);
        let nval = item.nval as usize;
        if out.len() < nval {
            return Err(CacheError::Space);
        }
        out[..nval].copy_from_slice(r.bytes(item.val, nval));
        Ok((nval, item.flags))
    }

    unsafe fn set_inner(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let r = &self.region;
        self.size_check(key.len(), val.len())?;

        // Delete first; a miss is fine.
        let _ = self.del_inner(key);

        let off = slab::alloc(r, key.len(), val.len());
        if off == 0 {
            return Err(CacheError::NoMemory);
        }

        assoc::insert(r, key, off);
        let lock = r.lock();
        lock.lru_lock();
        lru::link(r, off);
        lock.lru_unlock();

        let item = r.item_mut(off);
        item.flags = flags;
        let (key_off, val_off) = (item.key, item.val);
        r.bytes_mut(key_off, key.len()).copy_from_slice(key);
        r.bytes_mut(val_off, val.len()).copy_from_slice(val);
        Ok(())
    }

    unsafe fn add_inner(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        if assoc::find(&self.region, key) != 0 {
            return Err(CacheError::Exists);
        }
        self.set_inner(key, val, flags)
    }

    unsafe fn replace_inner(&self, key: &[u8], val: &[u8], flags: u32) -> Result<()> {
        let r = &self.region;
        let off = assoc::find(r, key);
        if off == 0 {
            return Err(CacheError::NotFound);
        }

        if slab::class_of(r, key.len(), val.len()) == Some(r.item(off).clsid) {
            let lock = r.lock();
            lock.lru_lock();
            lru::relink(r, off);
            lock.lru_unlock();

            let item = r.item_mut(off);
            item.flags = flags;
            let val_off = item.val;
            r.bytes_mut(val_off, val.len()).copy_from_slice(val);
            r.item_mut(off).nval = val.len() as u64;
            return Ok(());
        }

        // Class change: rebuild from scratch.
        self.del_inner(key)?;
        self.set_inner(key, val, flags)
    }

    unsafe fn concat_inner(
        &self,
        key: &[u8],
        val: &[u8],
        flags: u32,
        front: bool,
    ) -> Result<()> {
        let r = &self.region;
        let off = assoc::find(r, key);
        if off == 0 {
            return Err(CacheError::NotFound);
        }

        let (clsid, old_nval, val_off) = {
            let item = r.item(off);
            (item.clsid, item.nval as usize, item.val)
        };
        let combined = old_nval + val.len();

        if slab::class_of(r, key.len(), combined) == Some(clsid) {
            let lock = r.lock();
            lock.lru_lock();
            lru::relink(r, off);
            lock.lru_unlock();

            r.item_mut(off).flags = flags;
            let buf = r.bytes_mut(val_off, combined);
            if front {
                buf.copy_within(0..old_nval, val.len());
                buf[..val.len()].copy_from_slice(val);
            } else {
                buf[old_nval..].copy_from_slice(val);
            }
            r.item_mut(off).nval = combined as u64;
            return Ok(());
        }

        self.size_check(key.len(), combined)?;

        // Allocate the combined item before touching the old one, so an
        // exhausted arena leaves the entry intact.
        let new_off = slab::alloc(r, key.len(), combined);
        if new_off == 0 {
            return Err(CacheError::NoMemory);
        }

        assoc::delete(r, key);
        let lock = r.lock();
        lock.lru_lock();
        lru::unlink(r, off);
        lock.lru_unlock();

        assoc::insert(r, key, new_off);
        lock.lru_lock();
        lru::link(r, new_off);
        lock.lru_unlock();

        r.item_mut(new_off).flags = flags;
        let (new_key_off, new_val_off) = {
            let item = r.item(new_off);
            (item.key, item.val)
        };
        r.bytes_mut(new_key_off, key.len()).copy_from_slice(key);
        let dst = r.bytes_mut(new_val_off, combined);
        if front {
            dst[..val.len()].copy_from_slice(val);
            dst[val.len()..].copy_from_slice(r.bytes(val_off, old_nval));
        } else {
            dst[..old_nval].copy_from_slice(r.bytes(val_off, old_nval));
            dst[old_nval..].copy_from_slice(val);
        }

        slab::free(r, off);
        Ok(())
    }

    unsafe fn arith_inner(&self, key: &[u8], delta: u64, incr: bool) -> Result<u64> {
        let r = &self.region;
        let old_off = assoc::find(r, key);

        let mut old_val = 0u64;
        let mut old_flags = 0u32;
        let new_off;

        if old_off != 0 {
            let item = r.item(old_off);
            old_val = digit_prefix(r.bytes(item.val, item.nval as usize));
            old_flags = item.flags;

            if item.nval as usize == COUNTER_SLOT {
                new_off = old_off;
            } else {
                // The stored value is not in counter form: migrate it to a
                // fresh counter-sized item.
                let alloc_off = slab::alloc(r, key.len(), COUNTER_SLOT);
                if alloc_off != 0 && assoc::find(r, key) == old_off {
                    // The eviction fallback inside alloc may already have
                    // reclaimed the old item; only tear it down if not.
                    assoc::delete(r, key);
                    let lock = r.lock();
                    lock.lru_lock();
                    lru::unlink(r, old_off);
                    lock.lru_unlock();
                    slab::free(r, old_off);
                }
                new_off = alloc_off;
            }
        } else {
            if r.attr().default_counter == 0 {
                return Err(CacheError::NotFound);
            }
            new_off = slab::alloc(r, key.len(), COUNTER_SLOT);
        }

        if new_off == 0 {
            return Err(CacheError::NoMemory);
        }

        if new_off != old_off {
            assoc::insert(r, key, new_off);
            let lock = r.lock();
            lock.lru_lock();
            lru::link(r, new_off);
            lock.lru_unlock();

            let item = r.item_mut(new_off);
            item.flags = old_flags;
            let (key_off, val_off) = (item.key, item.val);
            r.bytes_mut(key_off, key.len()).copy_from_slice(key);
            r.bytes_mut(val_off, COUNTER_SLOT).fill(b' ');
        }

        let new_val = if incr {
            old_val.wrapping_add(delta)
        } else {
            old_val.saturating_sub(delta)
        };

        let val_off = r.item(new_off).val;
        let dst = r.bytes_mut(val_off, COUNTER_SLOT);
        let text = new_val.to_string();
        dst[..text.len()].copy_from_slice(text.as_bytes());
        dst[text.len()] = 0;

        Ok(new_val)
    }

    unsafe fn del_inner(&self, key: &[u8]) -> Result<()> {
        let r = &self.region;
        let off = assoc::find(r, key);
        if off == 0 {
            return Err(CacheError::NotFound);
        }

        assoc::delete(r, key);
        let lock = r.lock();
        lock.lru_lock();
        lru::unlink(r, off);
        lock.lru_unlock();
        slab::free(r, off);
        Ok(())
    }

    unsafe fn dump_inner(&self, path: &Path) -> Result<()> {
        let r = &self.region;
        let mut w = BufWriter::new(File::create(path)?);

        for clsid in 0..r.attr().slabs_count {
            let mut off = *r.heads().add(clsid as usize);
            while off != 0 {
                let item = r.item(off);
                write!(w, "{} {} ", item.nkey, item.nval)?;
                w.write_all(r.bytes(item.key, item.nkey as usize))?;
                w.write_all(b" ")?;
                w.write_all(r.bytes(item.val, item.nval as usize))?;
                w.write_all(b"\n")?;
                off = item.next;
            }
        }

        w.flush()?;
        Ok(())
    }

    unsafe fn load_inner(&self, path: &Path) -> Result<()> {
        let mut file = File::open(path)?;
        let mut buffer = vec![0u8; LOAD_BUFFER_SIZE];
        let mut offset = 0usize;

        loop {
            // Fill the buffer before parsing: a record is only oversized
            // once a full buffer cannot hold it.
            let mut nbuffer = offset;
            while nbuffer < LOAD_BUFFER_SIZE {
                let n = file.read(&mut buffer[nbuffer..])?;
                if n == 0 {
                    break;
                }
                nbuffer += n;
            }
            if nbuffer == offset {
                break;
            }
            offset = 0;

            loop {
                // <nkey> <nval> <key> <val>\n
                let rest = &buffer[offset..nbuffer];
                let sp1 = match rest.iter().position(|&b| b == b' ') {
                    Some(p) if p + 1 < rest.len() => p,
                    _ => break,
                };
                let nkey = ascii_prefix(&rest[..sp1]);

                let rest2 = &rest[sp1 + 1..];
                let sp2 = match rest2.iter().position(|&b| b == b' ') {
                    Some(p) if p + 1 < rest2.len() => p,
                    _ => break,
                };
                let nval = ascii_prefix(&rest2[..sp2]);

                let key_start = offset + sp1 + 1 + sp2 + 1;
                let end = key_start + nkey + 1 + nval + 1;
                if end > nbuffer {
                    break;
                }

                self.set_inner(
                    &buffer[key_start..key_start + nkey],
                    &buffer[key_start + nkey + 1..end - 1],
                    0,
                )?;
                offset = end;
            }

            if offset == 0 {
                // A full buffer produced no complete record.
                return Err(CacheError::Size);
            }
            if offset < nbuffer {
                buffer.copy_within(offset..nbuffer, 0);
                offset = nbuffer - offset;
            } else {
                offset = 0;
            }
        }

        Ok(())
    }

    /// Audit the shared structures for consistency. Intended for tests and
    /// debugging: takes the write lock and walks everything.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let lock = self.region.lock();
        lock.wrlock();
        let rc = unsafe { self.verify_inner() };
        lock.unlock();
        rc
    }

    unsafe fn verify_inner(&self) -> std::result::Result<(), String> {
        let r = &self.region;
        let attr = *r.attr();

        if attr.mem_used > attr.mem_limit {
            return Err(format!(
                "mem_used {} exceeds mem_limit {}",
                attr.mem_used, attr.mem_limit
            ));
        }

        // Per-class LRU lists: consistent forward and backward traversals.
        let mut lru_sets: Vec<HashSet<u64>> = Vec::with_capacity(attr.slabs_count as usize);
        for clsid in 0..attr.slabs_count {
            let mut set = HashSet::new();
            let head = *r.heads().add(clsid as usize);
            let tail = *r.tails().add(clsid as usize);

            let mut off = head;
            let mut prev = 0u64;
            while off != 0 {
                if !set.insert(off) {
                    return Err(format!("class {clsid}: cycle in LRU list"));
                }
                let item = r.item(off);
                if item.prev != prev {
                    return Err(format!("class {clsid}: bad prev link at {off:#x}"));
                }
                if item.clsid != clsid {
                    return Err(format!("class {clsid}: foreign item {off:#x} in list"));
                }
                prev = off;
                off = item.next;
            }
            if prev != tail {
                return Err(format!("class {clsid}: tail does not terminate the list"));
            }

            let mut back = 0usize;
            let mut off = tail;
            while off != 0 {
                if !set.contains(&off) {
                    return Err(format!(
                        "class {clsid}: backward walk found unknown item {off:#x}"
                    ));
                }
                back += 1;
                off = r.item(off).prev;
            }
            if back != set.len() {
                return Err(format!(
                    "class {clsid}: forward walk has {} items, backward {}",
                    set.len(),
                    back
                ));
            }

            lru_sets.push(set);
        }

        // Bucket chains: hashes land in their bucket, classes match sizes,
        // every item is on exactly one LRU list.
        let mut seen = HashSet::new();
        let mut total = 0u64;
        for slot in 0..attr.nbuckets {
            let mut off = *r.buckets().add(slot as usize);
            while off != 0 {
                if !seen.insert(off) {
                    return Err(format!("item {off:#x} reachable from two chains"));
                }
                let item = r.item(off);
                let key = r.bytes(item.key, item.nkey as usize);
                if crate::hash::hash(key) % attr.nbuckets != slot {
                    return Err(format!("item {off:#x} hashed into the wrong bucket"));
                }
                match slab::class_of(r, item.nkey as usize, item.nval as usize) {
                    Some(c) if c == item.clsid => {}
                    got => {
                        return Err(format!(
                            "item {off:#x}: clsid {} but sizes map to {:?}",
                            item.clsid, got
                        ))
                    }
                }
                if !lru_sets[item.clsid as usize].contains(&off) {
                    return Err(format!("item {off:#x} missing from its LRU list"));
                }
                total += 1;
                off = item.h_next;
            }
        }
        if total != attr.nitems {
            return Err(format!(
                "bucket chains hold {total} items but nitems is {}",
                attr.nitems
            ));
        }

        // Free lists must be disjoint from everything live.
        for clsid in 0..attr.slabs_count {
            let mut walked = HashSet::new();
            let mut off = r.slab(clsid).free;
            while off != 0 {
                if !walked.insert(off) {
                    return Err(format!("class {clsid}: cycle in free list"));
                }
                if seen.contains(&off) || lru_sets[clsid as usize].contains(&off) {
                    return Err(format!("free item {off:#x} still linked"));
                }
                off = r.item(off).next;
            }
        }

        Ok(())
    }
}

/// Parse a leading run of decimal digits, at most 20 of them, mirroring how
/// counter values are scanned out of their space-padded slots.
pub(crate) fn digit_prefix(bytes: &[u8]) -> u64 {
    let bytes = if bytes.len() > COUNTER_SLOT - 1 {
        &bytes[..COUNTER_SLOT - 1]
    } else {
        bytes
    };
    let mut value: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add((b - b'0') as u64);
    }
    value
}

fn ascii_prefix(bytes: &[u8]) -> usize {
    let mut value: usize = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = value.wrapping_mul(10).wrapping_add((b - b'0') as usize);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::{ascii_prefix, digit_prefix};

    #[test]
    fn digit_prefix_stops_at_first_non_digit() {
        assert_eq!(digit_prefix(b"42"), 42);
        assert_eq!(digit_prefix(b"42   "), 42);
        assert_eq!(digit_prefix(b"42\0   "), 42);
        assert_eq!(digit_prefix(b"x42"), 0);
        assert_eq!(digit_prefix(b""), 0);
    }

    #[test]
    fn digit_prefix_caps_at_twenty_digits() {
        // 21 nines: only the first 20 participate.
        let wide = b"999999999999999999999";
        let twenty = b"99999999999999999999";
        assert_eq!(digit_prefix(wide), digit_prefix(twenty));
    }

    #[test]
    fn ascii_prefix_parses_record_lengths() {
        assert_eq!(ascii_prefix(b"128"), 128);
        assert_eq!(ascii_prefix(b"0"), 0);
        assert_eq!(ascii_prefix(b"7abc"), 7);
    }
}
