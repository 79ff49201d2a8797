//! Shared-memory side of fsync.
//!
//! The authority owns a backing file holding one fixed-size state block per
//! object. Every process maps that file page by page through a
//! [`SharedPagePool`] and reads and writes state blocks only through the
//! atomic views in [`state`].

pub mod backing;
pub mod directory;
pub mod pool;
pub mod state;

pub use backing::{BACKING_PREFIX, backing_file_name, open_backing_file};
pub use directory::ChunkDirectory;
pub use pool::{PoolMetrics, SharedPagePool};
pub use state::{SemaphoreState, StateBlock};
