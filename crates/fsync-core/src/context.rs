//! Per-process fsync context: gate decision, page pool, handle cache and the
//! authority connection.

use std::io;
use std::ptr::NonNull;

use fsync_error::{FsyncError, Result, ServerStatus};
use fsync_shm::{PoolMetrics, SemaphoreState, SharedPagePool, StateBlock};
use fsync_types::{AccessMask, Handle, ObjectAttributes, ObjectType, SlotIndex};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::authority::{Authority, CreateRequest};
use crate::config::FsyncConfig;
use crate::gate::{self, FeatureGate, GateDecision};
use crate::handle_cache::{CacheMetrics, HandleCache};

/// Result of a successful [`FsyncContext::create_fsync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    /// `Success`, or `ObjectNameExists` when a named object was opened.
    pub status: ServerStatus,
    pub handle: Handle,
    pub slot: SlotIndex,
}

/// A resolved object: its type and a view of its shared state.
#[derive(Debug, Clone, Copy)]
pub struct SyncObject<'a> {
    pub handle: Handle,
    pub kind: ObjectType,
    pub state: StateBlock<'a>,
}

impl<'a> SyncObject<'a> {
    #[must_use]
    pub fn as_semaphore(&self) -> Option<SemaphoreState<'a>> {
        (self.kind == ObjectType::Semaphore).then(|| self.state.semaphore())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextMetrics {
    pub gate: GateDecision,
    pub pool: PoolMetrics,
    pub cache: CacheMetrics,
}

struct Runtime {
    pool: SharedPagePool,
    cache: HandleCache,
}

pub struct FsyncContext<A> {
    authority: A,
    config: FsyncConfig,
    decision: GateDecision,
    runtime: Option<Runtime>,
}

impl<A: Authority> FsyncContext<A> {
    /// Initialize against the process-wide feature gate.
    pub fn init(config: FsyncConfig, authority: A) -> Result<Self> {
        Self::init_with_gate(config, authority, gate::global())
    }

    /// Initialize against an explicit gate.
    ///
    /// The authority is queried whatever the gate decides. A disabled process
    /// talking to an authority that runs fsync, or an enabled process
    /// talking to one that does not, is a fatal [`FsyncError::ConfigMismatch`].
    /// An enabled process also needs the backing file, and its absence is
    /// fatal too.
    pub fn init_with_gate(config: FsyncConfig, authority: A, gate: &FeatureGate) -> Result<Self> {
        let decision = gate.decide(config.enabled);
        let reply = authority.create_fsync(&CreateRequest::support_query())?.status;
        let authority_enabled = reply != ServerStatus::NotImplemented;

        if !decision.enabled() {
            if authority_enabled {
                return Err(FsyncError::mismatch(format!(
                    "authority is running with fsync but this process is not ({decision}); \
                     enable fsync or restart the authority"
                )));
            }
            debug!(target: "fsync_core::context", %decision, "fsync disabled");
            return Ok(Self {
                authority,
                config,
                decision,
                runtime: None,
            });
        }

        if !authority_enabled {
            return Err(FsyncError::mismatch(
                "fsync is enabled but the authority answered STATUS_NOT_IMPLEMENTED",
            ));
        }
        let path = config.backing_path()?;
        let pool = SharedPagePool::open(&path)?;
        debug!(
            target: "fsync_core::context",
            path = %path.display(),
            page_size = pool.page_size(),
            "fsync enabled"
        );
        Ok(Self {
            authority,
            config,
            decision,
            runtime: Some(Runtime {
                pool,
                cache: HandleCache::new(),
            }),
        })
    }

    /// [`init`](Self::init), terminating the process with status 1 on
    /// failure.
    #[must_use]
    pub fn init_or_exit(config: FsyncConfig, authority: A) -> Self {
        match Self::init(config, authority) {
            Ok(context) => context,
            Err(err) => {
                error!(target: "fsync_core::context", fatal = err.is_fatal(), "{err}");
                std::process::exit(1);
            }
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.runtime.is_some()
    }

    #[must_use]
    pub fn decision(&self) -> GateDecision {
        self.decision
    }

    #[must_use]
    pub fn config(&self) -> &FsyncConfig {
        &self.config
    }

    #[must_use]
    pub fn authority(&self) -> &A {
        &self.authority
    }

    /// Create an object of raw type `object_type` through the authority.
    ///
    /// `low` and `high` are the type-specific initial values. Authority
    /// failures come back as [`FsyncError::Authority`] with the status
    /// unchanged. Attributes the authority could never accept, such as an
    /// overlong name, fail here with [`FsyncError::InvalidAttributes`]
    /// before any request is sent. On `Success` or `ObjectNameExists` the
    /// slot is mapped and the handle cached; either step may be skipped (and
    /// logged) without failing the call.
    pub fn create_fsync(
        &self,
        object_type: u32,
        access: AccessMask,
        attributes: Option<&ObjectAttributes>,
        low: i32,
        high: i32,
    ) -> Result<Created> {
        let runtime = self.runtime.as_ref().ok_or(FsyncError::Disabled)?;
        if let Some(attributes) = attributes {
            attributes.validate()?;
        }
        let request = CreateRequest {
            object_type,
            access,
            low,
            high,
            attributes: attributes.cloned(),
        };
        let reply = self.authority.create_fsync(&request)?;
        if !reply.status.yields_object() {
            return Err(FsyncError::authority(reply.status));
        }
        let handle = reply
            .handle
            .ok_or_else(|| FsyncError::protocol(format!("{} without a handle", reply.status)))?;

        match ObjectType::from_raw(object_type) {
            Some(kind) => {
                if let Some(block) = runtime.pool.get_shm(reply.slot) {
                    runtime.cache.add_to_list(handle, kind, block.as_ptr());
                }
            }
            None => warn!(
                target: "fsync_core::context",
                object_type,
                %handle,
                "authority created an object of unknown type; not caching"
            ),
        }
        trace!(
            target: "fsync_core::context",
            %handle,
            slot = %reply.slot,
            status = %reply.status,
            "created fsync object"
        );
        Ok(Created {
            status: reply.status,
            handle,
            slot: reply.slot,
        })
    }

    /// Create (or open, if `attributes` names an existing one) a semaphore.
    ///
    /// The limits are forwarded untouched; the authority validates them.
    pub fn create_semaphore(
        &self,
        access: AccessMask,
        attributes: Option<&ObjectAttributes>,
        initial: i32,
        max: i32,
    ) -> Result<Created> {
        trace!(
            target: "fsync_core::context",
            name = attributes.map_or("<no name>", ObjectAttributes::display_name),
            initial,
            max,
            "create semaphore"
        );
        self.create_fsync(
            ObjectType::Semaphore.to_raw(),
            access,
            attributes,
            initial,
            max,
        )
    }

    /// Cached lookup; never talks to the authority.
    #[must_use]
    pub fn get_cached_object(&self, handle: Handle) -> Option<SyncObject<'_>> {
        let record = self.runtime.as_ref()?.cache.get_cached_object(handle)?;
        Some(self.object_at(handle, record.kind, record.shm))
    }

    /// Cached lookup, falling back to asking the authority on a miss.
    pub fn get_object(&self, handle: Handle) -> Result<SyncObject<'_>> {
        if let Some(object) = self.get_cached_object(handle) {
            return Ok(object);
        }
        let runtime = self.runtime.as_ref().ok_or(FsyncError::Disabled)?;
        let reply = self.authority.query_object(handle)?;
        if reply.status != ServerStatus::Success {
            return Err(FsyncError::authority(reply.status));
        }
        let kind = ObjectType::from_raw(reply.object_type).ok_or_else(|| {
            FsyncError::protocol(format!("unknown object type {}", reply.object_type))
        })?;
        let block = runtime.pool.get_shm(reply.slot).ok_or_else(|| {
            FsyncError::Io(io::Error::other(format!(
                "cannot map shared state for slot {}",
                reply.slot
            )))
        })?;
        runtime.cache.add_to_list(handle, kind, block.as_ptr());
        Ok(SyncObject {
            handle,
            kind,
            state: block,
        })
    }

    fn object_at(&self, handle: Handle, kind: ObjectType, shm: NonNull<u8>) -> SyncObject<'_> {
        // SAFETY: cached pointers come from this context's page pool, whose
        // mappings live as long as `self`.
        let state = unsafe { StateBlock::from_raw(shm) };
        SyncObject {
            handle,
            kind,
            state,
        }
    }

    /// Counters for the pool and cache; `None` when disabled.
    #[must_use]
    pub fn metrics(&self) -> Option<ContextMetrics> {
        let runtime = self.runtime.as_ref()?;
        Some(ContextMetrics {
            gate: self.decision,
            pool: runtime.pool.metrics(),
            cache: runtime.cache.metrics(),
        })
    }
}

impl<A> std::fmt::Debug for FsyncContext<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsyncContext")
            .field("decision", &self.decision)
            .field("enabled", &self.runtime.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MemoryAuthority;
    use std::sync::atomic::Ordering;

    fn enabled_gate() -> FeatureGate {
        let gate = FeatureGate::new();
        gate.decide_with(true, || true);
        gate
    }

    fn enabled_context() -> (tempfile::TempDir, FsyncContext<MemoryAuthority>) {
        let dir = tempfile::tempdir().unwrap();
        let config = FsyncConfig::enabled_at(dir.path(), dir.path());
        let authority = MemoryAuthority::create(&config).unwrap();
        let context = FsyncContext::init_with_gate(config, authority, &enabled_gate()).unwrap();
        (dir, context)
    }

    #[test]
    fn created_semaphore_is_cached_with_initial_state() {
        let (_dir, ctx) = enabled_context();
        let created = ctx
            .create_semaphore(AccessMask::SEMAPHORE_ALL_ACCESS, None, 2, 6)
            .unwrap();
        assert_eq!(created.status, ServerStatus::Success);

        let object = ctx.get_cached_object(created.handle).unwrap();
        assert_eq!(object.kind, ObjectType::Semaphore);
        let sem = object.as_semaphore().unwrap();
        assert_eq!((sem.count(), sem.max()), (2, 6));
    }

    #[test]
    fn cached_state_is_live_shared_memory() {
        let (_dir, ctx) = enabled_context();
        let created = ctx
            .create_semaphore(AccessMask::SEMAPHORE_ALL_ACCESS, None, 0, 3)
            .unwrap();
        let first = ctx.get_cached_object(created.handle).unwrap();
        let sem = first.as_semaphore().unwrap();
        sem.count_word().store(3, Ordering::Release);
        let second = ctx.get_object(created.handle).unwrap();
        assert_eq!(second.as_semaphore().unwrap().count(), 3);
        assert_eq!(first.state.as_ptr(), second.state.as_ptr());
    }

    #[test]
    fn authority_failure_is_returned_verbatim() {
        let (_dir, ctx) = enabled_context();
        let err = ctx
            .create_semaphore(AccessMask::SEMAPHORE_ALL_ACCESS, None, 4, 1)
            .unwrap_err();
        assert_eq!(err.status(), Some(ServerStatus::InvalidParameter));
        assert!(!err.is_fatal());
    }

    #[test]
    fn metrics_track_activity() {
        let (_dir, ctx) = enabled_context();
        ctx.create_semaphore(AccessMask::SEMAPHORE_ALL_ACCESS, None, 0, 1).unwrap();
        let metrics = ctx.metrics().unwrap();
        assert!(metrics.gate.enabled());
        assert_eq!(metrics.pool.pages_mapped, 1);
        assert_eq!(metrics.cache.publishes, 1);

        let json = serde_json::to_value(metrics).unwrap();
        assert_eq!(json["cache"]["publishes"], 1);
        assert_eq!(json["gate"]["requested"], true);
    }

    #[test]
    fn disabled_context_is_inert() {
        let gate = FeatureGate::new();
        gate.decide_with(false, || unreachable!());
        let ctx = FsyncContext::init_with_gate(
            FsyncConfig::default(),
            MemoryAuthority::unsupported(),
            &gate,
        )
        .unwrap();
        assert!(!ctx.is_enabled());
        assert!(ctx.metrics().is_none());
        let err = ctx
            .create_semaphore(AccessMask::SEMAPHORE_ALL_ACCESS, None, 0, 1)
            .unwrap_err();
        assert!(matches!(err, FsyncError::Disabled));
        let handle = Handle::new(4).unwrap();
        assert!(ctx.get_cached_object(handle).is_none());
        assert!(matches!(ctx.get_object(handle), Err(FsyncError::Disabled)));
    }
}
