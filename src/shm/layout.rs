//! `#[repr(C)]` structures that live in the shared region, and the offset
//! arithmetic that locates them.
//!
//! All structs use fixed-size fields and explicit ordering so the layout is
//! identical for every process mapping the file. Pointers stored inside the
//! region are byte offsets from the region base (`0` = null); offset `0`
//! holds the version tag, so no real object ever lives there.

/// Version tag written at offset 0. Attaching a region with a different tag
/// fails; bumped whenever the layout changes.
pub const VERSION: u32 = 0x0001_0000;

/// Null value for in-region relative pointers.
pub const NULL_REF: u64 = 0;

pub const ALIGN_BYTES: u64 = 8;

/// Round `size` up to the next multiple of [`ALIGN_BYTES`].
pub const fn align_size(size: u64) -> u64 {
    if size % ALIGN_BYTES != 0 {
        size + ALIGN_BYTES - size % ALIGN_BYTES
    } else {
        size
    }
}

/// The attribute block, written once at creation. `mem_used`, `nitems`,
/// `slabs_count` and `max_depth` are runtime fields maintained by the engine;
/// everything else is read-only after startup.
///
/// Fields are ordered u64-first to avoid implicit alignment padding.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    // 8-byte aligned group
    pub mem_limit: u64,     // 0..8
    pub item_size_min: u64, // 8..16
    pub item_size_max: u64, // 16..24
    pub mem_used: u64,      // 24..32  runtime
    pub nitems: u64,        // 32..40  runtime

    // 4-byte aligned group
    pub nbuckets: u32,         // 40..44
    pub mode: u32,             // 44..48
    pub item_size_factor: f32, // 48..52
    pub evict_to_free: u32,    // 52..56
    pub default_counter: u32,  // 56..60
    pub use_flock: u32,        // 60..64
    pub slabs_count: u32,      // 64..68  runtime
    pub max_depth: u32,        // 68..72  runtime
}

pub const ATTR_SIZE: usize = 72;
const _: () = assert!(std::mem::size_of::<Attr>() == ATTR_SIZE);

impl Default for Attr {
    fn default() -> Self {
        Attr {
            mem_limit: 64 * 1024 * 1024,
            item_size_min: 64,
            item_size_max: 1024 * 1024,
            mem_used: 0,
            nitems: 0,
            nbuckets: 65536,
            mode: 0o644,
            item_size_factor: 2.0,
            evict_to_free: 1,
            default_counter: 1,
            use_flock: 0,
            slabs_count: 0,
            max_depth: 0,
        }
    }
}

/// Fixed item header stored at the front of every chunk in the raw arena.
/// Key bytes, then value bytes, immediately follow it; `key` and `val` are
/// region offsets pointing at them.
///
/// `next` doubles as the free-list link while the item is unallocated.
#[repr(C)]
#[derive(Debug)]
pub struct ItemHeader {
    pub next: u64,   // 0..8   LRU forward, or free-list link
    pub prev: u64,   // 8..16  LRU backward
    pub h_next: u64, // 16..24 hash-chain successor
    pub key: u64,    // 24..32 region offset of the key bytes
    pub val: u64,    // 32..40 region offset of the value bytes
    pub nkey: u64,   // 40..48
    pub nval: u64,   // 48..56
    pub clsid: u32,  // 56..60
    pub flags: u32,  // 60..64
}

pub const ITEM_HEADER_SIZE: usize = 64;
const _: () = assert!(std::mem::size_of::<ItemHeader>() == ITEM_HEADER_SIZE);

/// Per-class slab bookkeeping: free-list head, chunk size, and how many
/// chunks one carved batch holds (`item_size_max / size`).
#[repr(C)]
#[derive(Debug)]
pub struct SlabInfo {
    pub free: u64,  // 0..8   region offset of the free-list head
    pub size: u64,  // 8..16  chunk size in bytes
    pub count: u64, // 16..24 chunks per batch
}

pub const SLAB_INFO_SIZE: usize = 24;
const _: () = assert!(std::mem::size_of::<SlabInfo>() == SLAB_INFO_SIZE);

// Storage reserved in the region for the process-shared locks. Over-allocated
// relative to the glibc types so the layout survives libc padding changes.
pub const RWLOCK_RESERVED: usize = 128;
pub const MUTEX_RESERVED: usize = 64;
const _: () = assert!(std::mem::size_of::<libc::pthread_rwlock_t>() <= RWLOCK_RESERVED);
const _: () = assert!(std::mem::size_of::<libc::pthread_mutex_t>() <= MUTEX_RESERVED);

// Region layout, in file order. Every section starts 8-byte aligned.
pub const VERSION_OFFSET: usize = 0; // u32 + 4 bytes padding
pub const ATTR_OFFSET: usize = 8;
pub const RWLOCK_OFFSET: usize = ATTR_OFFSET + ATTR_SIZE;
pub const MUTEX_OFFSET: usize = RWLOCK_OFFSET + RWLOCK_RESERVED;
pub const HEADS_OFFSET: usize = MUTEX_OFFSET + MUTEX_RESERVED;

/// Bytes mapped by the attach prologue: just enough to read the version tag
/// and the attribute block.
pub const PREFIX_SIZE: usize = ATTR_OFFSET + ATTR_SIZE;

pub fn tails_offset(slabs_count: u32) -> usize {
    HEADS_OFFSET + 8 * slabs_count as usize
}

pub fn buckets_offset(slabs_count: u32) -> usize {
    tails_offset(slabs_count) + 8 * slabs_count as usize
}

pub fn slabs_offset(slabs_count: u32, nbuckets: u32) -> usize {
    buckets_offset(slabs_count) + 8 * nbuckets as usize
}

pub fn arena_offset(slabs_count: u32, nbuckets: u32) -> usize {
    slabs_offset(slabs_count, nbuckets) + SLAB_INFO_SIZE * slabs_count as usize
}

/// Total size of the mapped file for a given attribute block.
pub fn region_size(attr: &Attr, slabs_count: u32) -> usize {
    arena_offset(slabs_count, attr.nbuckets) + attr.mem_limit as usize
}

/// Number of size classes generated for an attribute block.
///
/// Class sizes start at `ITEM_HEADER_SIZE + item_size_min`, are 8-byte
/// aligned, then multiplied by the growth factor; classes exist while the
/// size stays strictly below `item_size_max`.
pub fn slab_class_count(attr: &Attr) -> u32 {
    let mut size = ITEM_HEADER_SIZE as u64 + attr.item_size_min;

    let mut count = 0;
    while size < attr.item_size_max {
        size = align_size(size);
        size = (size as f32 * attr.item_size_factor) as u64;
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_eight() {
        assert_eq!(align_size(0), 0);
        assert_eq!(align_size(1), 8);
        assert_eq!(align_size(8), 8);
        assert_eq!(align_size(9), 16);
        assert_eq!(align_size(129), 136);
    }

    #[test]
    fn default_attr_class_count() {
        // 64-byte header + 64-byte minimum, doubling: 128, 256, ..., 524288,
        // then 1048576 which is no longer below item_size_max.
        let attr = Attr::default();
        assert_eq!(slab_class_count(&attr), 13);
    }

    #[test]
    fn small_attr_class_count() {
        let attr = Attr {
            mem_limit: 4096,
            item_size_min: 64,
            item_size_max: 1024,
            ..Attr::default()
        };
        // 128, 256, 512
        assert_eq!(slab_class_count(&attr), 3);
    }

    #[test]
    fn section_offsets_are_aligned() {
        assert_eq!(ATTR_OFFSET % 8, 0);
        assert_eq!(RWLOCK_OFFSET % 8, 0);
        assert_eq!(MUTEX_OFFSET % 8, 0);
        assert_eq!(HEADS_OFFSET % 8, 0);
        let attr = Attr::default();
        let sc = slab_class_count(&attr);
        assert_eq!(tails_offset(sc) % 8, 0);
        assert_eq!(buckets_offset(sc) % 8, 0);
        assert_eq!(slabs_offset(sc, attr.nbuckets) % 8, 0);
        assert_eq!(arena_offset(sc, attr.nbuckets) % 8, 0);
    }
}
