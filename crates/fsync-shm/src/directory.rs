//! Append-only, lock-free chunked array.
//!
//! A [`ChunkDirectory`] is a fixed-length directory of chunk pointers. Each
//! chunk is a heap array of `chunk_len` elements, allocated on first touch
//! and published with a compare-and-swap from null. A thread that loses the
//! publish race frees its own allocation and uses the winner's. Chunks are
//! never moved or freed while the directory lives, so a `&T` handed out by
//! [`ChunkDirectory::get_or_alloc`] stays valid for the directory's lifetime.
//!
//! Because the directory itself never grows, there is no resize step for
//! concurrent growers to race on.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use tracing::debug;

pub struct ChunkDirectory<T> {
    chunk_len: usize,
    chunks: Box<[AtomicPtr<T>]>,
    /// Chunks published so far.
    allocated: AtomicU64,
    /// Allocations freed after losing a publish race.
    lost_races: AtomicU64,
}

// SAFETY: chunks are only reached through `&T`, published with
// release/acquire ordering, and freed only in `Drop` (which needs `&mut`).
unsafe impl<T: Send + Sync> Send for ChunkDirectory<T> {}
unsafe impl<T: Send + Sync> Sync for ChunkDirectory<T> {}

impl<T: Default> ChunkDirectory<T> {
    /// Create an empty directory of `chunk_count` chunks of `chunk_len`
    /// elements each.
    ///
    /// # Panics
    ///
    /// Panics if either dimension is zero.
    #[must_use]
    pub fn new(chunk_count: usize, chunk_len: usize) -> Self {
        assert!(chunk_count > 0, "chunk directory needs at least one chunk");
        assert!(chunk_len > 0, "chunks must hold at least one element");
        let chunks: Box<[AtomicPtr<T>]> = (0..chunk_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            chunk_len,
            chunks,
            allocated: AtomicU64::new(0),
            lost_races: AtomicU64::new(0),
        }
    }

    /// Like [`ChunkDirectory::new`], with chunk 0 allocated up front so the
    /// first `chunk_len` indices never allocate.
    #[must_use]
    pub fn with_first_chunk(chunk_count: usize, chunk_len: usize) -> Self {
        let dir = Self::new(chunk_count, chunk_len);
        let _ = dir.chunk_or_alloc(0);
        dir
    }

    /// Element at `index`, allocating its chunk if needed. Returns `None` only
    /// when `index` is beyond [`ChunkDirectory::capacity`].
    pub fn get_or_alloc(&self, index: usize) -> Option<&T> {
        let (chunk, offset) = self.split(index)?;
        let base = self.chunk_or_alloc(chunk);
        // SAFETY: `base` points at a live chunk of `chunk_len` elements and
        // `offset < chunk_len`.
        Some(unsafe { &*base.add(offset) })
    }

    fn chunk_or_alloc(&self, chunk: usize) -> *mut T {
        let slot = &self.chunks[chunk];
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            return current;
        }

        let fresh: Box<[T]> = (0..self.chunk_len).map(|_| T::default()).collect();
        let fresh = Box::into_raw(fresh).cast::<T>();
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                fresh
            }
            Err(winner) => {
                // SAFETY: `fresh` came from `Box::into_raw` of a slice of
                // `chunk_len` elements just above and was never published.
                drop(unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, self.chunk_len))
                });
                self.lost_races.fetch_add(1, Ordering::Relaxed);
                debug!(target: "fsync_shm::directory", chunk, "lost chunk publish race");
                winner
            }
        }
    }
}

impl<T> ChunkDirectory<T> {
    /// Element at `index` if its chunk has been allocated. Never allocates.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        let (chunk, offset) = self.split(index)?;
        let base = self.chunks[chunk].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // SAFETY: non-null chunk pointers always reference `chunk_len`
        // elements, and `offset < chunk_len`.
        Some(unsafe { &*base.add(offset) })
    }

    /// Total number of addressable elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_len
    }

    /// Number of chunks currently allocated.
    #[must_use]
    pub fn allocated_chunks(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of chunk allocations discarded after losing a publish race.
    #[must_use]
    pub fn lost_races(&self) -> u64 {
        self.lost_races.load(Ordering::Relaxed)
    }

    /// Iterate over every element of every allocated chunk.
    pub fn iter_allocated(&self) -> impl Iterator<Item = &T> + '_ {
        self.chunks.iter().flat_map(move |slot| {
            let base = slot.load(Ordering::Acquire);
            let len = if base.is_null() { 0 } else { self.chunk_len };
            // SAFETY: see `get`; a null chunk yields an empty range.
            (0..len).map(move |i| unsafe { &*base.add(i) })
        })
    }

    fn split(&self, index: usize) -> Option<(usize, usize)> {
        let chunk = index / self.chunk_len;
        (chunk < self.chunks.len()).then_some((chunk, index % self.chunk_len))
    }
}

impl<T> Drop for ChunkDirectory<T> {
    fn drop(&mut self) {
        for slot in &mut *self.chunks {
            let base = *slot.get_mut();
            if !base.is_null() {
                // SAFETY: every published chunk came from `Box::into_raw` of a
                // `chunk_len` slice, and `&mut self` rules out other users.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, self.chunk_len)) });
            }
        }
    }
}

impl<T> std::fmt::Debug for ChunkDirectory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDirectory")
            .field("chunk_len", &self.chunk_len)
            .field("chunk_count", &self.chunks.len())
            .field("allocated", &self.allocated_chunks())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Barrier};

    #[test]
    fn lazily_allocates_chunks() {
        let dir: ChunkDirectory<AtomicU32> = ChunkDirectory::new(4, 8);
        assert_eq!(dir.capacity(), 32);
        assert!(dir.get(9).is_none());
        assert_eq!(dir.allocated_chunks(), 0);

        dir.get_or_alloc(9).unwrap().store(5, Ordering::Relaxed);
        assert_eq!(dir.allocated_chunks(), 1);
        assert_eq!(dir.get(9).unwrap().load(Ordering::Relaxed), 5);
        // Neighbours in the same chunk are now visible, other chunks are not.
        assert_eq!(dir.get(8).unwrap().load(Ordering::Relaxed), 0);
        assert!(dir.get(0).is_none());
    }

    #[test]
    fn first_chunk_is_preallocated() {
        let dir: ChunkDirectory<AtomicU32> = ChunkDirectory::with_first_chunk(4, 8);
        assert_eq!(dir.allocated_chunks(), 1);
        assert!(dir.get(7).is_some());
        assert!(dir.get(8).is_none());
    }

    #[test]
    fn out_of_range_is_none() {
        let dir: ChunkDirectory<AtomicU32> = ChunkDirectory::new(2, 4);
        assert!(dir.get_or_alloc(8).is_none());
        assert!(dir.get(100).is_none());
        assert!(dir.get_or_alloc(7).is_some());
    }

    #[test]
    fn elements_never_move() {
        let dir: ChunkDirectory<AtomicU32> = ChunkDirectory::new(16, 4);
        let first = std::ptr::from_ref(dir.get_or_alloc(1).unwrap());
        for i in 4..64 {
            let _ = dir.get_or_alloc(i);
        }
        assert_eq!(std::ptr::from_ref(dir.get(1).unwrap()), first);
        assert_eq!(dir.iter_allocated().count(), 64);
    }

    #[test]
    fn concurrent_first_touch_publishes_one_chunk() {
        const THREADS: usize = 8;
        for _ in 0..50 {
            let dir: Arc<ChunkDirectory<AtomicU32>> = Arc::new(ChunkDirectory::new(4, 64));
            let barrier = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let dir = Arc::clone(&dir);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        let elem = dir.get_or_alloc(70).unwrap();
                        elem.fetch_add(1, Ordering::AcqRel);
                        std::ptr::from_ref(elem) as usize
                    })
                })
                .collect();
            let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert!(addrs.windows(2).all(|w| w[0] == w[1]));
            assert_eq!(dir.allocated_chunks(), 1);
            assert_eq!(
                dir.get(70).unwrap().load(Ordering::Acquire),
                THREADS as u32
            );
        }
    }
}
