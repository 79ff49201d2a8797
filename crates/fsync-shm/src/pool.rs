//! Lazily mapped view of the backing file, one page at a time.
//!
//! [`SharedPagePool::get_shm`] turns a slot index into the address of that
//! slot's state block:
//!
//! ```text
//! page   = slot * STATE_BLOCK_SIZE / page_size
//! offset = slot * STATE_BLOCK_SIZE % page_size
//! ```
//!
//! The first access to a page maps it `MAP_SHARED` at the matching file
//! offset and publishes the address into a [`ChunkDirectory`] slot with a
//! compare-and-swap from null. If two threads race, both map the same bytes;
//! the loser unmaps its copy so each page is mapped at most once per pool.
//! Published pages stay mapped until the pool is dropped.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use fsync_error::{FsyncError, Result};
use fsync_types::SlotIndex;
use fsync_types::limits::{PAGE_CHUNK_LEN, PAGE_CHUNKS, STATE_BLOCK_SIZE};
use nix::unistd::{SysconfVar, sysconf};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::backing::open_backing_file;
use crate::directory::ChunkDirectory;
use crate::state::StateBlock;

/// Counters describing a pool's mapping activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolMetrics {
    /// Pages currently mapped and published.
    pub pages_mapped: u64,
    /// Mappings unmapped after losing a publish race.
    pub redundant_unmaps: u64,
    /// `mmap` failures and out-of-range slots.
    pub map_failures: u64,
}

pub struct SharedPagePool {
    file: File,
    path: PathBuf,
    page_size: usize,
    pages: ChunkDirectory<AtomicPtr<u8>>,
    pages_mapped: AtomicU64,
    redundant_unmaps: AtomicU64,
    map_failures: AtomicU64,
}

impl SharedPagePool {
    /// Open the backing file at `path` and prepare an empty pool over it.
    ///
    /// # Errors
    ///
    /// [`FsyncError::BackingFileMissing`] if the file does not exist;
    /// [`FsyncError::Io`] if it cannot be opened or the page size cannot be
    /// determined.
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_backing_file(path)?;
        Ok(Self::from_file(file, path, system_page_size()?))
    }

    /// Build a pool over an already open backing file.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two holding whole state
    /// blocks.
    #[must_use]
    pub fn from_file(file: File, path: &Path, page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two() && page_size >= STATE_BLOCK_SIZE,
            "page size {page_size} cannot hold state blocks"
        );
        debug!(
            target: "fsync_shm::pool",
            path = %path.display(),
            page_size,
            "shared page pool ready"
        );
        Self {
            file,
            path: PathBuf::from(path),
            page_size,
            pages: ChunkDirectory::new(PAGE_CHUNKS, PAGE_CHUNK_LEN),
            pages_mapped: AtomicU64::new(0),
            redundant_unmaps: AtomicU64::new(0),
            map_failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address of the state block for `slot`.
    ///
    /// Repeated calls for the same slot return the same address for the
    /// lifetime of the pool. Returns `None` (after logging) if the page could
    /// not be mapped; the caller then proceeds without the fast path.
    pub fn get_shm(&self, slot: SlotIndex) -> Option<StateBlock<'_>> {
        let (page, offset) = self.locate(slot);
        let Some(entry) = usize::try_from(page)
            .ok()
            .and_then(|page| self.pages.get_or_alloc(page))
        else {
            self.map_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "fsync_shm::pool",
                %slot,
                page,
                "slot lies beyond the page directory; not mapping"
            );
            return None;
        };

        let mut base = entry.load(Ordering::Acquire);
        if base.is_null() {
            base = self.map_page(page, entry)?;
        }
        // SAFETY: `base` is a live page-sized mapping owned by this pool,
        // `offset` is a multiple of STATE_BLOCK_SIZE below the page size, and
        // the mapping outlives the returned borrow of `self`.
        unsafe {
            let block = NonNull::new_unchecked(base.add(offset));
            Some(StateBlock::from_raw(block))
        }
    }

    /// Map `page` and publish it into `entry`, or adopt a concurrent winner's
    /// mapping.
    fn map_page(&self, page: u64, entry: &AtomicPtr<u8>) -> Option<*mut u8> {
        let file_offset = page * self.page_size as u64;
        let Ok(off) = libc::off_t::try_from(file_offset) else {
            self.map_failures.fetch_add(1, Ordering::Relaxed);
            warn!(target: "fsync_shm::pool", page, "page offset overflows off_t");
            return None;
        };

        // SAFETY: a fresh shared mapping of an open descriptor; no existing
        // memory is touched.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                off,
            )
        };
        if addr == libc::MAP_FAILED {
            self.map_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                target: "fsync_shm::pool",
                page,
                file_offset,
                error = %std::io::Error::last_os_error(),
                "failed to map shared page"
            );
            return None;
        }
        let addr = addr.cast::<u8>();
        trace!(target: "fsync_shm::pool", page, ?addr, "mapped shared page");

        match entry.compare_exchange(ptr::null_mut(), addr, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.pages_mapped.fetch_add(1, Ordering::Relaxed);
                Some(addr)
            }
            Err(winner) => {
                // SAFETY: `addr` is our own unpublished mapping of `page_size`
                // bytes; nobody else has seen it.
                unsafe {
                    libc::munmap(addr.cast(), self.page_size);
                }
                self.redundant_unmaps.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "fsync_shm::pool",
                    page,
                    "lost page publish race; unmapped duplicate"
                );
                Some(winner)
            }
        }
    }

    fn locate(&self, slot: SlotIndex) -> (u64, usize) {
        let byte = slot.byte_offset();
        let page_size = self.page_size as u64;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (byte % page_size) as usize;
        (byte / page_size, offset)
    }

    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            pages_mapped: self.pages_mapped.load(Ordering::Relaxed),
            redundant_unmaps: self.redundant_unmaps.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SharedPagePool {
    fn drop(&mut self) {
        for entry in self.pages.iter_allocated() {
            let addr = entry.load(Ordering::Acquire);
            if !addr.is_null() {
                // SAFETY: published pages are mappings this pool created; with
                // `&mut self` no borrow of them can remain.
                unsafe {
                    libc::munmap(addr.cast(), self.page_size);
                }
            }
        }
    }
}

impl std::fmt::Debug for SharedPagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPagePool")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

/// The system page size, which is also the mapping granule.
pub fn system_page_size() -> Result<usize> {
    let size = sysconf(SysconfVar::PAGE_SIZE)
        .map_err(|errno| FsyncError::Io(errno.into()))?
        .ok_or_else(|| FsyncError::Io(std::io::Error::other("page size is indeterminate")))?;
    usize::try_from(size)
        .map_err(|_| FsyncError::Io(std::io::Error::other(format!("bad page size {size}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn pool_with_pages(pages: u64) -> (tempfile::TempDir, SharedPagePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsync-test");
        let file = std::fs::File::create(&path).unwrap();
        let page_size = system_page_size().unwrap();
        file.set_len(pages * page_size as u64).unwrap();
        let pool = SharedPagePool::open(&path).unwrap();
        (dir, pool)
    }

    /// Lines of `/proc/self/maps` backed by `path`.
    fn mappings_of(path: &Path) -> usize {
        let path = std::fs::canonicalize(path).unwrap();
        let path = path.to_str().unwrap();
        std::fs::read_to_string("/proc/self/maps")
            .unwrap()
            .lines()
            .filter(|line| line.ends_with(path))
            .count()
    }

    #[test]
    fn open_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SharedPagePool::open(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, FsyncError::BackingFileMissing { .. }));
    }

    #[test]
    fn get_shm_is_idempotent() {
        let (_dir, pool) = pool_with_pages(1);
        let a = pool.get_shm(SlotIndex::new(3)).unwrap();
        let b = pool.get_shm(SlotIndex::new(3)).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.metrics().pages_mapped, 1);
    }

    #[test]
    fn slots_in_one_page_share_a_mapping() {
        let (_dir, pool) = pool_with_pages(1);
        let s0 = pool.get_shm(SlotIndex::new(0)).unwrap();
        let s5 = pool.get_shm(SlotIndex::new(5)).unwrap();
        assert_eq!(
            s5.as_ptr().as_ptr() as usize - s0.as_ptr().as_ptr() as usize,
            40
        );
        assert_eq!(pool.metrics().pages_mapped, 1);
    }

    #[test]
    fn slots_across_pages_map_each_page() {
        let (_dir, pool) = pool_with_pages(3);
        let per_page = u32::try_from(pool.page_size() / STATE_BLOCK_SIZE).unwrap();
        pool.get_shm(SlotIndex::new(0)).unwrap();
        pool.get_shm(SlotIndex::new(per_page)).unwrap();
        pool.get_shm(SlotIndex::new(per_page * 2 + 1)).unwrap();
        assert_eq!(pool.metrics().pages_mapped, 3);
    }

    #[test]
    fn writes_reach_the_file() {
        let (dir, pool) = pool_with_pages(1);
        let sem = pool.get_shm(SlotIndex::new(2)).unwrap().semaphore();
        sem.count_word().store(7, Ordering::Release);
        sem.max_word().store(9, Ordering::Release);

        let bytes = std::fs::read(dir.path().join("fsync-test")).unwrap();
        assert_eq!(&bytes[16..20], &7_u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &9_u32.to_ne_bytes());
    }

    #[test]
    fn two_pools_see_each_other() {
        let (dir, first) = pool_with_pages(2);
        let second = SharedPagePool::open(&dir.path().join("fsync-test")).unwrap();
        let slot = SlotIndex::new(600);
        first
            .get_shm(slot)
            .unwrap()
            .semaphore()
            .count_word()
            .store(11, Ordering::Release);
        assert_eq!(second.get_shm(slot).unwrap().semaphore().count(), 11);
        assert_ne!(
            first.get_shm(slot).unwrap().as_ptr(),
            second.get_shm(slot).unwrap().as_ptr()
        );
    }

    #[test]
    fn racing_first_access_keeps_one_mapping() {
        const THREADS: usize = 8;
        for _ in 0..20 {
            let (dir, pool) = pool_with_pages(1);
            let path = dir.path().join("fsync-test");
            let pool = Arc::new(pool);
            let barrier = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        let first = pool.get_shm(SlotIndex::new(40)).unwrap().as_ptr();
                        let again = pool.get_shm(SlotIndex::new(40)).unwrap().as_ptr();
                        assert_eq!(first, again);
                        first.as_ptr() as usize
                    })
                })
                .collect();
            let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert!(addrs.windows(2).all(|w| w[0] == w[1]));
            let metrics = pool.metrics();
            assert_eq!(metrics.pages_mapped, 1);
            assert!(metrics.redundant_unmaps < THREADS as u64);
            assert_eq!(metrics.map_failures, 0);
            assert_eq!(mappings_of(&path), 1);

            drop(pool);
            assert_eq!(mappings_of(&path), 0);
        }
    }

    #[test]
    fn metrics_serialize_with_field_names() {
        let (_dir, pool) = pool_with_pages(1);
        pool.get_shm(SlotIndex::new(0)).unwrap();
        let json = serde_json::to_value(pool.metrics()).unwrap();
        assert_eq!(json["pages_mapped"], 1);
        assert_eq!(json["redundant_unmaps"], 0);
        assert_eq!(json["map_failures"], 0);
    }
}
