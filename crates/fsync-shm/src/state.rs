//! Typed views over shared state blocks.
//!
//! A state block is [`STATE_BLOCK_SIZE`] bytes inside a page shared with
//! other processes. No process-local lock can protect it, so the views hand
//! out nothing but atomics: every read and write is a sized atomic access.
//!
//! [`STATE_BLOCK_SIZE`]: fsync_types::limits::STATE_BLOCK_SIZE

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use fsync_types::limits::STATE_BLOCK_SIZE;

const WORDS: usize = STATE_BLOCK_SIZE / std::mem::size_of::<AtomicU32>();

/// Borrowed view of one shared state block.
///
/// The lifetime ties the view to the mapping that contains it (normally a
/// [`SharedPagePool`](crate::SharedPagePool)).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateBlock<'a> {
    ptr: NonNull<[AtomicU32; WORDS]>,
    _mapping: PhantomData<&'a [AtomicU32; WORDS]>,
}

// SAFETY: the block is only reached through atomics.
unsafe impl Send for StateBlock<'_> {}
unsafe impl Sync for StateBlock<'_> {}

impl<'a> StateBlock<'a> {
    /// Wrap a raw block address.
    ///
    /// # Safety
    ///
    /// `ptr` must be 4-byte aligned, point at [`STATE_BLOCK_SIZE`] bytes of
    /// read/write memory, and that memory must stay mapped for `'a`.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self {
            ptr: ptr.cast(),
            _mapping: PhantomData,
        }
    }

    /// Wrap a block living in ordinary process memory.
    #[must_use]
    pub fn from_words(words: &'a [AtomicU32; WORDS]) -> Self {
        Self {
            ptr: NonNull::from(words),
            _mapping: PhantomData,
        }
    }

    /// Address of the block; stable for `'a`.
    #[must_use]
    pub const fn as_ptr(self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Both 32-bit words of the block.
    #[must_use]
    pub fn words(self) -> &'a [AtomicU32; WORDS] {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { self.ptr.as_ref() }
    }

    /// View this block as semaphore state.
    #[must_use]
    pub const fn semaphore(self) -> SemaphoreState<'a> {
        SemaphoreState { block: self }
    }
}

impl std::fmt::Debug for StateBlock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [lo, hi] = self.words();
        f.debug_struct("StateBlock")
            .field("addr", &self.ptr)
            .field(
                "words",
                &[lo.load(Ordering::Relaxed), hi.load(Ordering::Relaxed)],
            )
            .finish()
    }
}

/// Semaphore layout: word 0 is the current count, word 1 the maximum.
///
/// Both are stored as the bit pattern of a signed 32-bit integer. The
/// authority writes them when it creates the object; the acquire/release
/// protocol that mutates `count` is built on top of [`count_word`].
///
/// [`count_word`]: SemaphoreState::count_word
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreState<'a> {
    block: StateBlock<'a>,
}

impl<'a> SemaphoreState<'a> {
    /// The shared count word, for atomic updates and futex waits.
    #[must_use]
    pub fn count_word(self) -> &'a AtomicU32 {
        &self.block.words()[0]
    }

    #[must_use]
    pub fn max_word(self) -> &'a AtomicU32 {
        &self.block.words()[1]
    }

    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn count(self) -> i32 {
        self.count_word().load(Ordering::Acquire) as i32
    }

    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn max(self) -> i32 {
        self.max_word().load(Ordering::Acquire) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_words_map_to_count_and_max() {
        let words = [AtomicU32::new(3), AtomicU32::new(5)];
        let sem = StateBlock::from_words(&words).semaphore();
        assert_eq!(sem.count(), 3);
        assert_eq!(sem.max(), 5);

        sem.count_word().fetch_sub(1, Ordering::AcqRel);
        assert_eq!(words[0].load(Ordering::Acquire), 2);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn values_are_signed() {
        let words = [AtomicU32::new(u32::MAX), AtomicU32::new(0x7fff_ffff)];
        let sem = StateBlock::from_words(&words).semaphore();
        assert_eq!(sem.count(), -1);
        assert_eq!(sem.max(), i32::MAX);
    }

    #[test]
    fn raw_roundtrip_keeps_address() {
        let words = [AtomicU32::new(0), AtomicU32::new(0)];
        let block = StateBlock::from_words(&words);
        // SAFETY: `block.as_ptr()` points at `words`, which outlives `again`.
        let again = unsafe { StateBlock::from_raw(block.as_ptr()) };
        assert_eq!(again, block);
        again.words()[1].store(9, Ordering::Release);
        assert_eq!(block.semaphore().max(), 9);
    }

    #[test]
    fn block_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<[AtomicU32; WORDS]>(), STATE_BLOCK_SIZE);
    }
}
