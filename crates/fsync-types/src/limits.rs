//! Size constants shared between the page pool, the handle cache and the
//! authority protocol.

/// Bytes of shared state per slot. Every object kind fits in two 32-bit
/// words; a semaphore uses them for `(count, max)`.
pub const STATE_BLOCK_SIZE: usize = 8;

/// Bytes of process memory backing one handle cache block.
pub const HANDLE_CACHE_BLOCK_BYTES: usize = 65_536;

/// Number of handle cache blocks. Handles beyond
/// `HANDLE_CACHE_BLOCKS * records_per_block` are served uncached.
pub const HANDLE_CACHE_BLOCKS: usize = 256;

/// Longest object name accepted, in UTF-16 code units.
pub const MAX_NAME_UNITS: usize = 32_767;

/// Page pool directory chunk length, in pages.
pub const PAGE_CHUNK_LEN: usize = 1024;

/// Number of page pool directory chunks. With 4 KiB pages this covers the
/// full `u32` slot range.
pub const PAGE_CHUNKS: usize = 8192;
