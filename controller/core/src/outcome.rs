//! Per-pass resource state and the dependency gate.
//!
//! A pass visits resources in topological order, so by the time a resource
//! is gated every one of its dependencies already has a state. Failures and
//! skips propagate forward in that single pass; readiness waits only defer.

use ahash::AHashMap as HashMap;
use std::collections::BTreeSet;

/// Why a resource failed in a pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureReason {
    Conflict,
    Render,
    ReadinessTimeout,
    Apply,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceState {
    /// Written and ready.
    Ready,
    /// Written, waiting for the readiness predicate.
    Pending,
    /// Not written because a dependency is still pending.
    Deferred,
    Failed(FailureReason),
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gate<'d> {
    Proceed,
    /// Some dependencies are written but not ready yet.
    Defer { waiting_on: Vec<&'d str> },
    /// Dependencies failed but the resource opted out of skipping.
    ProceedDespiteFailure { failed: Vec<&'d str> },
    Skip { blocked_by: Vec<&'d str> },
}

/// States recorded so far in one pass over a node's resources.
#[derive(Clone, Debug, Default)]
pub struct Pass {
    states: HashMap<String, ResourceState>,
    order: Vec<String>,
}

/// Aggregate counts for a pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub desired: u32,
    pub ready: u32,
    pub failed: u32,
    pub skipped: u32,
    pub conflicted: u32,
    pub waiting: u32,
    pub skipped_ids: BTreeSet<String>,
    pub failed_ids: BTreeSet<String>,
    pub degraded: Option<FailureReason>,
}

// === impl FailureReason ===

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "ResourceConflict",
            Self::Render => "TemplateRenderError",
            Self::ReadinessTimeout => "ReadinessTimeout",
            Self::Apply => "ApplyFailed",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceState ===

impl ResourceState {
    /// Only failures and skips cascade to dependents.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Skipped)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Deferred)
    }
}

// === impl Pass ===

impl Pass {
    pub fn gate<'d>(&self, depends_on: &'d [String], skip_on_failure: bool) -> Gate<'d> {
        let mut blocked = Vec::new();
        let mut waiting = Vec::new();
        for dep in depends_on {
            match self.states.get(dep) {
                Some(state) if state.blocks_dependents() => blocked.push(dep.as_str()),
                Some(state) if state.is_waiting() => waiting.push(dep.as_str()),
                _ => {}
            }
        }

        if !blocked.is_empty() && skip_on_failure {
            return Gate::Skip {
                blocked_by: blocked,
            };
        }
        if !waiting.is_empty() {
            return Gate::Defer {
                waiting_on: waiting,
            };
        }
        if !blocked.is_empty() {
            return Gate::ProceedDespiteFailure { failed: blocked };
        }
        Gate::Proceed
    }

    pub fn record(&mut self, id: impl Into<String>, state: ResourceState) {
        let id = id.into();
        if self.states.insert(id.clone(), state).is_none() {
            self.order.push(id);
        }
    }

    pub fn state(&self, id: &str) -> Option<&ResourceState> {
        self.states.get(id)
    }

    /// Recorded states in the order they were first recorded.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResourceState)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.states.get(id).map(|s| (id.as_str(), s)))
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for (id, state) in self.iter() {
            if *state != ResourceState::Skipped {
                summary.desired += 1;
            }
            match state {
                ResourceState::Ready => summary.ready += 1,
                ResourceState::Pending | ResourceState::Deferred => summary.waiting += 1,
                ResourceState::Skipped => {
                    summary.skipped += 1;
                    summary.skipped_ids.insert(id.to_string());
                }
                ResourceState::Failed(reason) => {
                    summary.failed += 1;
                    summary.failed_ids.insert(id.to_string());
                    if *reason == FailureReason::Conflict {
                        summary.conflicted += 1;
                    }
                    // Ordered by severity: conflicts first.
                    summary.degraded = Some(match summary.degraded {
                        Some(current) => current.min(*reason),
                        None => *reason,
                    });
                }
            }
        }
        summary
    }
}

// === impl Summary ===

impl Summary {
    pub fn is_ready(&self) -> bool {
        self.failed == 0 && self.ready == self.desired
    }

    pub fn is_degraded(&self) -> bool {
        self.failed > 0
    }
}

/// Ids in `current` that were not in `previous`.
pub fn entered<'a>(
    previous: &'a BTreeSet<String>,
    current: &'a BTreeSet<String>,
) -> impl Iterator<Item = &'a str> + 'a {
    current.difference(previous).map(String::as_str)
}
