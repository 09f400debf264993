//! Shared-memory key/value cache with a memcache-style TCP front-end.
//!
//! The cache lives in a single memory-mapped file that unrelated processes
//! attach to concurrently: a slab allocator with per-class free lists, one
//! LRU list per size class, a chained hash table, and process-shared locks,
//! all addressed through in-region byte offsets. The [`net`] module wraps
//! the engine in a single-threaded epoll server speaking the text protocol.

pub mod hash;
pub mod net;
pub mod shm;

pub use net::server::Server;
pub use shm::{Attr, CacheError, Result, ShmCache, VERSION};
