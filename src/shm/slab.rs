//! Fixed-size-class slab allocator carved out of the raw arena.
//!
//! Each class owns a singly-linked free list threaded through `ItemHeader::
//! next`. A batch of `item_size_max / size` chunks is carved per class at
//! creation; further batches are carved on demand while the arena budget
//! holds, after which allocation falls back to evicting the requesting
//! class's LRU tail (when enabled).

use log::trace;

use super::layout::{align_size, ITEM_HEADER_SIZE};
use super::region::Region;
use super::{assoc, lru};

/// Carve the initial batch for every size class. Creation-time only.
///
/// # Safety
/// `r` must be a freshly formatted region; no other process is attached yet.
pub(crate) unsafe fn format_all(r: &Region) {
    let (slabs_count, item_size_min, item_size_max, factor) = {
        let attr = r.attr();
        (
            attr.slabs_count,
            attr.item_size_min,
            attr.item_size_max,
            attr.item_size_factor,
        )
    };

    let mut size = ITEM_HEADER_SIZE as u64 + item_size_min;
    for id in 0..slabs_count {
        size = align_size(size);

        let slab = r.slab(id);
        slab.size = size;
        slab.count = item_size_max / size;
        slab.free = 0;

        assert!(
            carve(r, id),
            "memory budget too small for the initial slab batches"
        );

        size = (size as f32 * factor) as u64;
    }
}

/// Carve one more batch for `clsid` from the arena. Returns false when the
/// batch would not fit under `mem_limit`.
///
/// # Safety
/// Caller must hold the write lock (or be the creating process).
unsafe fn carve(r: &Region, clsid: u32) -> bool {
    let (size, count) = {
        let slab = r.slab(clsid);
        (slab.size, slab.count)
    };
    let len = size * count;

    let attr = r.attr_mut();
    if attr.mem_used + len >= attr.mem_limit {
        return false;
    }

    let mut off = r.arena_offset() + attr.mem_used;
    attr.mem_used += len;

    let slab = r.slab(clsid);
    for _ in 0..count {
        let item = r.item_mut(off);
        item.next = slab.free;
        slab.free = off;
        off += size;
    }

    trace!(
        target: "netshell::slab",
        "class {clsid} carved {count} chunks of {size} bytes"
    );
    true
}

/// Smallest class whose chunk fits an item of `nkey + nval`, or `None` when
/// no class is large enough.
pub(crate) unsafe fn class_of(r: &Region, nkey: usize, nval: usize) -> Option<u32> {
    let need = (ITEM_HEADER_SIZE + nkey + nval) as u64;
    for id in 0..r.attr().slabs_count {
        if need <= r.slab(id).size {
            return Some(id);
        }
    }
    None
}

unsafe fn pop_free(r: &Region, clsid: u32) -> u64 {
    let slab = r.slab(clsid);
    let off = slab.free;
    if off != 0 {
        slab.free = r.item(off).next;
    }
    off
}

/// Allocate a chunk for `(nkey, nval)` and initialise its header. Returns 0
/// when the arena is exhausted (and eviction is off or found nothing).
///
/// # Safety
/// Caller must hold the write lock.
pub(crate) unsafe fn alloc(r: &Region, nkey: usize, nval: usize) -> u64 {
    let clsid = match class_of(r, nkey, nval) {
        Some(id) => id,
        None => return 0,
    };

    let mut off = pop_free(r, clsid);

    if off == 0 {
        if !carve(r, clsid) && r.attr().evict_to_free != 0 {
            let tail = lru::tail(r, clsid);
            if tail != 0 {
                let (key_off, key_len) = {
                    let it = r.item(tail);
                    (it.key, it.nkey as usize)
                };
                trace!(target: "netshell::slab", "class {clsid} evicting tail");
                assoc::delete(r, r.bytes(key_off, key_len));
                let lock = r.lock();
                lock.lru_lock();
                lru::unlink(r, tail);
                lock.lru_unlock();
                free(r, tail);
            }
        }

        // One retry: either the carve or the eviction refilled the list.
        off = pop_free(r, clsid);
    }

    if off == 0 {
        return 0;
    }

    let item = r.item_mut(off);
    item.clsid = clsid;
    item.next = 0;
    item.prev = 0;
    item.h_next = 0;
    item.nkey = nkey as u64;
    item.nval = nval as u64;
    item.key = off + ITEM_HEADER_SIZE as u64;
    item.val = item.key + nkey as u64;
    off
}

/// Return a chunk to its class's free list.
///
/// # Safety
/// Caller must hold the write lock; the item must already be unlinked from
/// its bucket chain and LRU list.
pub(crate) unsafe fn free(r: &Region, off: u64) {
    let clsid = r.item(off).clsid;
    let slab = r.slab(clsid);
    let item = r.item_mut(off);
    item.next = slab.free;
    slab.free = off;
}
