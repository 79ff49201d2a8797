//! One-shot decision of whether the fast path is active in this process.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

/// Outcome of the feature gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    /// The environment opt-in was set.
    pub requested: bool,
    /// Result of the futex capability check; `None` if it was never run
    /// because fsync was not requested.
    pub futex_supported: Option<bool>,
}

impl GateDecision {
    #[must_use]
    pub const fn enabled(self) -> bool {
        self.requested && matches!(self.futex_supported, Some(true))
    }

    /// Short machine-readable status.
    #[must_use]
    pub const fn status(self) -> &'static str {
        match (self.requested, self.futex_supported) {
            (false, _) => "disabled:not-requested",
            (true, Some(true)) => "enabled",
            (true, _) => "disabled:futex-wait-multiple-unavailable",
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status())
    }
}

/// Caches the gate decision for the lifetime of its owner.
///
/// Concurrent first callers race on a [`OnceLock`]; exactly one computes the
/// decision and all observe the same value afterwards.
pub struct FeatureGate {
    decision: OnceLock<GateDecision>,
    computations: AtomicU64,
}

impl FeatureGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            decision: OnceLock::new(),
            computations: AtomicU64::new(0),
        }
    }

    /// Decide once, probing the kernel for `FUTEX_WAIT_MULTIPLE` if fsync was
    /// requested. Later calls return the first decision regardless of
    /// `requested`.
    pub fn decide(&self, requested: bool) -> GateDecision {
        self.decide_with(requested, fsync_futex::wait_multiple_supported)
    }

    /// As [`decide`](Self::decide) with a caller-supplied capability check.
    pub fn decide_with(&self, requested: bool, check: impl FnOnce() -> bool) -> GateDecision {
        *self.decision.get_or_init(|| {
            self.computations.fetch_add(1, Ordering::Relaxed);
            let decision = GateDecision {
                requested,
                futex_supported: requested.then(check),
            };
            debug!(
                target: "fsync_core::gate",
                requested,
                futex_supported = ?decision.futex_supported,
                status = decision.status(),
                "fsync feature gate decided"
            );
            decision
        })
    }

    /// The cached decision, if one has been made.
    #[must_use]
    pub fn decision(&self) -> Option<GateDecision> {
        self.decision.get().copied()
    }

    /// How many times the decision was computed; at most 1.
    #[must_use]
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }
}

impl Default for FeatureGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FeatureGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureGate")
            .field("decision", &self.decision())
            .finish_non_exhaustive()
    }
}

/// The process-wide gate.
pub fn global() -> &'static FeatureGate {
    static GATE: FeatureGate = FeatureGate::new();
    &GATE
}
