//! Process-side fsync: feature gate, handle cache, authority protocol and
//! object creation.
//!
//! A process builds one [`FsyncContext`] at startup. Creating an object asks
//! the [`Authority`] for a handle and a slot in the shared backing file, maps
//! that slot through the page pool and records it in the [`HandleCache`], so
//! later lookups by handle never leave the process.

pub mod authority;
pub mod config;
pub mod context;
pub mod gate;
pub mod handle_cache;

pub use authority::{Authority, CreateRequest, FramedAuthority, MemoryAuthority, Reply};
pub use config::FsyncConfig;
pub use context::{ContextMetrics, Created, FsyncContext, SyncObject};
pub use gate::{FeatureGate, GateDecision};
pub use handle_cache::{CacheMetrics, CachedRecord, HandleCache};
