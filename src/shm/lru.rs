//! Per-class doubly-linked LRU lists, threaded through item headers.
//!
//! Head = most recently used, tail = eviction candidate. Callers hold the
//! LRU mutex around every mutation here; readers relink under the shared
//! read lock, so the mutex is what keeps concurrent relinks from racing.

use super::region::Region;

/// Link an item at the head of its class's list.
///
/// # Safety
/// Caller must hold the LRU mutex; the item must not currently be linked.
pub(crate) unsafe fn link(r: &Region, off: u64) {
    let clsid = r.item(off).clsid as usize;
    let head = r.heads().add(clsid);
    let tail = r.tails().add(clsid);

    {
        let item = r.item_mut(off);
        item.prev = 0;
        item.next = *head;
    }
    let next = r.item(off).next;
    if next != 0 {
        r.item_mut(next).prev = off;
    }
    *head = off;
    if *tail == 0 {
        *tail = off;
    }
}

/// Unlink an item from its class's list.
///
/// # Safety
/// Caller must hold the LRU mutex; the item must currently be linked.
pub(crate) unsafe fn unlink(r: &Region, off: u64) {
    let clsid = r.item(off).clsid as usize;
    let head = r.heads().add(clsid);
    let tail = r.tails().add(clsid);

    let (next, prev) = {
        let item = r.item(off);
        (item.next, item.prev)
    };

    if *head == off {
        *head = next;
    }
    if *tail == off {
        *tail = prev;
    }
    if next != 0 {
        r.item_mut(next).prev = prev;
    }
    if prev != 0 {
        r.item_mut(prev).next = next;
    }
}

/// Move an item to the head of its class's list.
///
/// # Safety
/// Caller must hold the LRU mutex.
pub(crate) unsafe fn relink(r: &Region, off: u64) {
    unlink(r, off);
    link(r, off);
}

/// Current eviction candidate for a class, or 0 when the list is empty.
///
/// # Safety
/// Caller must hold at least the read lock.
pub(crate) unsafe fn tail(r: &Region, clsid: u32) -> u64 {
    *r.tails().add(clsid as usize)
}
