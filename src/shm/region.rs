//! Shared region lifecycle: exclusive creation, attach-existing, teardown.
//!
//! The whole cache lives in one memory-mapped file whose first bytes are the
//! version tag and attribute block. Creation is exclusive (`O_CREAT|O_EXCL`):
//! exactly one process formats the region, everyone else attaches. Attaching
//! maps just the prefix first to validate the version and learn the sizes,
//! then remaps the full region.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use super::layout::{
    self, Attr, ItemHeader, SlabInfo, ATTR_OFFSET, MUTEX_OFFSET, PREFIX_SIZE, RWLOCK_OFFSET,
    SLAB_INFO_SIZE, VERSION, VERSION_OFFSET,
};
use super::lock::{self, RegionLock};
use super::slab;
use super::{CacheError, Result};

/// One process's attachment to the shared region. The mapping address is
/// private to this process; everything reachable through it is shared.
#[derive(Debug)]
pub struct Region {
    mmap: MmapMut,
    file: File,
    path: PathBuf,
}

impl Region {
    /// Create and format a new region. Fails with [`CacheError::Create`] if
    /// the token file already exists.
    ///
    /// `attr` must arrive with its runtime fields zeroed and the growth
    /// factor already clamped; `slabs_count` is computed and recorded here.
    pub fn create(token: &Path, attr: &Attr) -> Result<Region> {
        // The requested mode must land on the file exactly, so clear the
        // umask across the open.
        let old_mask = unsafe { libc::umask(0) };
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(attr.mode)
            .open(token);
        unsafe { libc::umask(old_mask) };

        let file = opened.map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => CacheError::Create,
            _ => CacheError::System(e),
        })?;

        let slabs_count = layout::slab_class_count(attr);
        let size = layout::region_size(attr, slabs_count);
        file.set_len(size as u64)?;

        // Safety: we just created the file and hold it exclusively.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let region = Region {
            mmap,
            file,
            path: token.to_path_buf(),
        };

        unsafe {
            let base = region.base();
            *(base.add(VERSION_OFFSET) as *mut u32) = VERSION;

            let mut stored = *attr;
            stored.slabs_count = slabs_count;
            *(base.add(ATTR_OFFSET) as *mut Attr) = stored;

            lock::init(base.add(RWLOCK_OFFSET), base.add(MUTEX_OFFSET))?;

            // LRU heads/tails and hash buckets all start null.
            let tables = layout::slabs_offset(slabs_count, attr.nbuckets) - layout::HEADS_OFFSET;
            std::ptr::write_bytes(base.add(layout::HEADS_OFFSET), 0, tables);

            slab::format_all(&region);
        }

        debug!(
            target: "netshell::region",
            "created {} ({} bytes, {} classes, {} buckets)",
            region.path.display(),
            size,
            slabs_count,
            attr.nbuckets
        );

        Ok(region)
    }

    /// Attach to an existing region. Fails with [`CacheError::Token`] if the
    /// file does not exist and [`CacheError::Version`] on a tag mismatch.
    pub fn attach(token: &Path) -> Result<Region> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(token)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => CacheError::Token,
                _ => CacheError::System(e),
            })?;

        // First map just the version tag and attribute block.
        let (attr, size) = {
            let prefix = unsafe { MmapOptions::new().len(PREFIX_SIZE).map_mut(&file)? };
            let version = unsafe { *(prefix.as_ptr() as *const u32) };
            if version != VERSION {
                return Err(CacheError::Version);
            }
            let attr = unsafe { *(prefix.as_ptr().add(ATTR_OFFSET) as *const Attr) };
            let size = layout::region_size(&attr, attr.slabs_count);
            (attr, size)
        };

        // Remap the whole region now that the size is known.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };

        debug!(
            target: "netshell::region",
            "attached {} ({} bytes, {} classes)",
            token.display(),
            size,
            attr.slabs_count
        );

        Ok(Region {
            mmap,
            file,
            path: token.to_path_buf(),
        })
    }

    /// Base address of the mapping. Mutation through this pointer is
    /// serialised by the region locks, not by `&mut`.
    pub(crate) fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn attr(&self) -> &Attr {
        unsafe { &*(self.base().add(ATTR_OFFSET) as *const Attr) }
    }

    /// Mutable view of the attribute block's runtime fields.
    ///
    /// # Safety
    /// Caller must hold a region lock covering the mutation.
    pub(crate) unsafe fn attr_mut(&self) -> &mut Attr {
        &mut *(self.base().add(ATTR_OFFSET) as *mut Attr)
    }

    /// Handle to the region's locks.
    pub fn lock(&self) -> RegionLock {
        unsafe {
            RegionLock::attach(
                self.base().add(RWLOCK_OFFSET),
                self.base().add(MUTEX_OFFSET),
                self.fd(),
                self.attr().use_flock != 0,
            )
        }
    }

    // Array bases. Indexed by size-class id or bucket number; bounds are the
    // caller's responsibility, as is holding the appropriate lock.

    pub(crate) unsafe fn heads(&self) -> *mut u64 {
        self.base().add(layout::HEADS_OFFSET) as *mut u64
    }

    pub(crate) unsafe fn tails(&self) -> *mut u64 {
        self.base().add(layout::tails_offset(self.attr().slabs_count)) as *mut u64
    }

    pub(crate) unsafe fn buckets(&self) -> *mut u64 {
        self.base().add(layout::buckets_offset(self.attr().slabs_count)) as *mut u64
    }

    pub(crate) unsafe fn slab(&self, clsid: u32) -> &mut SlabInfo {
        let attr = self.attr();
        let off = layout::slabs_offset(attr.slabs_count, attr.nbuckets)
            + SLAB_INFO_SIZE * clsid as usize;
        &mut *(self.base().add(off) as *mut SlabInfo)
    }

    /// Region offset of the first arena byte.
    pub(crate) fn arena_offset(&self) -> u64 {
        let attr = self.attr();
        layout::arena_offset(attr.slabs_count, attr.nbuckets) as u64
    }

    // Relative-pointer translation. Offsets are never cached across a lock
    // release; every dereference goes back through the current base.

    pub(crate) unsafe fn item(&self, off: u64) -> &ItemHeader {
        debug_assert!(off != 0 && off % 8 == 0);
        &*(self.base().add(off as usize) as *const ItemHeader)
    }

    pub(crate) unsafe fn item_mut(&self, off: u64) -> &mut ItemHeader {
        debug_assert!(off != 0 && off % 8 == 0);
        &mut *(self.base().add(off as usize) as *mut ItemHeader)
    }

    pub(crate) unsafe fn bytes(&self, off: u64, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.base().add(off as usize), len)
    }

    pub(crate) unsafe fn bytes_mut(&self, off: u64, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base().add(off as usize), len)
    }

    /// Flush the first `len` mapped bytes to the backing file synchronously.
    pub fn sync(&self, len: usize) -> io::Result<()> {
        self.mmap.flush_range(0, len)
    }
}

// Dropping the region unmaps and closes this attachment. The in-region locks
// are left untouched for the remaining attachers.
