//! Handle → object record cache.
//!
//! Records live in fixed 64 KiB blocks of a [`ChunkDirectory`] indexed by
//! [`handle_to_index`]. Block 0 exists from construction; later blocks are
//! allocated on first insert. Lookups never allocate and never lock.
//!
//! Each record is published exactly once:
//!
//! ```text
//! kind: 0 --CAS--> CLAIMING --store(Release)--> type
//!                     |
//!                     +-- winner writes `shm` here
//! ```
//!
//! Readers treat `0` and [`CLAIMING`] as "not cached", so a reader that sees
//! a real type tag always sees the pointer written before it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use fsync_shm::ChunkDirectory;
use fsync_types::limits::{HANDLE_CACHE_BLOCK_BYTES, HANDLE_CACHE_BLOCKS};
use fsync_types::{Handle, ObjectType, handle_to_index};
use serde::Serialize;
use tracing::{trace, warn};

/// Type tag held while the claiming thread writes the pointer.
pub const CLAIMING: u32 = u32::MAX;

#[derive(Debug, Default)]
pub struct ObjectRecord {
    kind: AtomicU32,
    shm: AtomicPtr<u8>,
}

impl ObjectRecord {
    fn load(&self) -> Option<CachedRecord> {
        let kind = ObjectType::from_raw(self.kind.load(Ordering::Acquire))?;
        let shm = NonNull::new(self.shm.load(Ordering::Relaxed))?;
        Some(CachedRecord { kind, shm })
    }
}

/// A published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRecord {
    pub kind: ObjectType,
    /// Address of the object's state block in the page pool.
    pub shm: NonNull<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheMetrics {
    pub blocks_allocated: u64,
    pub publishes: u64,
    pub lost_publishes: u64,
    pub overflow_skips: u64,
}

pub struct HandleCache {
    blocks: ChunkDirectory<ObjectRecord>,
    publishes: AtomicU64,
    lost_publishes: AtomicU64,
    overflow_skips: AtomicU64,
}

impl HandleCache {
    /// Records per 64 KiB block.
    pub const RECORDS_PER_BLOCK: usize =
        HANDLE_CACHE_BLOCK_BYTES / std::mem::size_of::<ObjectRecord>();

    #[must_use]
    pub fn new() -> Self {
        Self::with_blocks(HANDLE_CACHE_BLOCKS)
    }

    /// A cache covering `blocks` blocks of handle indices.
    ///
    /// # Panics
    ///
    /// Panics if `blocks` is zero; block 0 is always present.
    #[must_use]
    pub fn with_blocks(blocks: usize) -> Self {
        Self {
            blocks: ChunkDirectory::with_first_chunk(blocks, Self::RECORDS_PER_BLOCK),
            publishes: AtomicU64::new(0),
            lost_publishes: AtomicU64::new(0),
            overflow_skips: AtomicU64::new(0),
        }
    }

    /// Number of handle indices the cache can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks.capacity()
    }

    /// Record `handle` as an object of `kind` whose state lives at `shm`.
    ///
    /// Returns the record now published for `handle`: ours, or one another
    /// thread published first. Returns `None` if the handle falls outside
    /// the cache (logged, not an error) or a concurrent claimer has not
    /// finished publishing yet.
    pub fn add_to_list(
        &self,
        handle: Handle,
        kind: ObjectType,
        shm: NonNull<u8>,
    ) -> Option<CachedRecord> {
        let Some(record) = self.slot_or_alloc(handle) else {
            self.overflow_skips.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "fsync_core::handle_cache",
                %handle,
                capacity = self.capacity(),
                "too many allocated handles, not caching"
            );
            return None;
        };

        match record
            .kind
            .compare_exchange(0, CLAIMING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                record.shm.store(shm.as_ptr(), Ordering::Relaxed);
                record.kind.store(kind.to_raw(), Ordering::Release);
                self.publishes.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "fsync_core::handle_cache",
                    %handle,
                    %kind,
                    shm = ?shm,
                    "cached object"
                );
                Some(CachedRecord { kind, shm })
            }
            Err(_) => {
                self.lost_publishes.fetch_add(1, Ordering::Relaxed);
                trace!(
                    target: "fsync_core::handle_cache",
                    %handle,
                    "handle already cached"
                );
                record.load()
            }
        }
    }

    /// The published record for `handle`, or `None` if it was never cached,
    /// is still being published, or lies outside the cache.
    #[must_use]
    pub fn get_cached_object(&self, handle: Handle) -> Option<CachedRecord> {
        let index = usize::try_from(handle_to_index(handle)?).ok()?;
        self.blocks.get(index)?.load()
    }

    fn slot_or_alloc(&self, handle: Handle) -> Option<&ObjectRecord> {
        let index = usize::try_from(handle_to_index(handle)?).ok()?;
        self.blocks.get_or_alloc(index)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            blocks_allocated: self.blocks.allocated_chunks(),
            publishes: self.publishes.load(Ordering::Relaxed),
            lost_publishes: self.lost_publishes.load(Ordering::Relaxed),
            overflow_skips: self.overflow_skips.load(Ordering::Relaxed),
        }
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCache")
            .field("capacity", &self.capacity())
            .field("metrics", &self.metrics())
            .finish()
    }
}
