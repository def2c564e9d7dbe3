//! One reconciliation pass over a node's resources.
//!
//! Resources are visited in dependency order. Each is gated on the states its
//! dependencies reached earlier in the same pass, rendered, checked for
//! conflicts, written with its patch strategy and checked for readiness. A
//! failing resource never stops independent resources from being applied.
//!
//! After the declared resources, records from the previous pass that are no
//! longer declared (or whose id now renders to a different object) are
//! released according to the deletion policy stored on each object.

use crate::{
    cluster::{Cluster, ClusterError, ObjectRef},
    desired::{self, NodeRef, Rendered},
    orphan::{self, Disposition, OrphanReason},
    wait::{self, WaitError},
};
use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use lynq_controller_core::{
    fieldpath::{self, FieldPath},
    outcome, readiness, AppliedResource, FailureReason, Gate, GraphError, Pass, Render,
    ResourceState, Summary, Variables,
};
use lynq_controller_k8s_api::{
    condition::{self, Condition},
    labels, ConflictPolicy, CreationPolicy, Declared, DeletionPolicy, LynqNode, LynqNodeStatus,
    Resources,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

/// Event reasons emitted by the pipeline, in addition to the
/// [`FailureReason`] names.
pub mod reason {
    pub const DEPENDENCY_SKIPPED: &str = "DependencySkipped";
    pub const DEPENDENCY_FAILED_BUT_PROCEEDING: &str = "DependencyFailedButProceeding";
    pub const RESOURCE_ORPHANED: &str = "ResourceOrphaned";
    pub const RESOURCE_DELETED: &str = "ResourceDeleted";
    pub const RESOURCE_READOPTED: &str = "ResourceReadopted";
    pub const INVALID_DEPENDENCY_GRAPH: &str = "InvalidDependencyGraph";
}

pub struct Pipeline<C, R> {
    cluster: C,
    renderer: R,
    settle: Option<Settle>,
}

/// Bounds an in-pass wait for readiness before a resource is left pending.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settle {
    pub timeout: Duration,
    pub interval: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// Something worth recording as an event on the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub severity: Severity,
    pub reason: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub kind: String,
    pub policy: ConflictPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempt {
    pub kind: String,
    pub success: bool,
}

/// Everything a pass observed.
#[derive(Debug, Default)]
pub struct PassReport {
    pub summary: Summary,
    /// Resources written or confirmed present, in application order.
    pub applied: Vec<AppliedResource>,
    pub pending_since: BTreeMap<String, DateTime<Utc>>,
    pub failures: BTreeMap<String, (FailureReason, String)>,
    pub notices: Vec<Notice>,
    pub conflicts: Vec<Conflict>,
    pub attempts: Vec<Attempt>,
    /// Errors expected to clear on retry.
    pub transient: Vec<String>,
    pub invalid_graph: Option<GraphError>,
    declared: u32,
    skipped_by: BTreeMap<String, Vec<String>>,
}

/// The outcome of releasing a deleted node's resources.
#[derive(Debug, Default)]
pub struct Cleanup {
    /// Records that could not be released yet.
    pub remaining: Vec<AppliedResource>,
    pub notices: Vec<Notice>,
    pub transient: Vec<String>,
}

/// What the previous pass left in status.
struct Previous<'s> {
    applied: &'s [AppliedResource],
    pending_since: BTreeMap<String, DateTime<Utc>>,
    skipped: BTreeSet<String>,
    failed: BTreeSet<String>,
    degraded_reason: Option<&'s str>,
}

// === impl Pipeline ===

impl<C: Cluster, R: Render + Send + Sync> Pipeline<C, R> {
    pub fn new(cluster: C, renderer: R) -> Self {
        Self {
            cluster,
            renderer,
            settle: None,
        }
    }

    /// Waits up to `timeout` within a pass for a written resource to become
    /// ready before leaving it pending.
    pub fn with_settle(mut self, settle: Settle) -> Self {
        self.settle = Some(settle).filter(|s| !s.timeout.is_zero());
        self
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    pub async fn run(
        &self,
        node: &NodeRef,
        resources: &Resources,
        vars: &Variables,
        status: Option<&LynqNodeStatus>,
        now: DateTime<Utc>,
    ) -> PassReport {
        let previous = Previous::new(status, node.generation);
        let mut report = PassReport {
            declared: resources.len() as u32,
            ..Default::default()
        };

        let graph = match resources.graph() {
            Ok(graph) => graph,
            Err(error) => return report.invalid(error, &previous),
        };
        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(error) => return report.invalid(error, &previous),
        };

        let mut pass = Pass::default();
        let mut written = BTreeMap::<&str, AppliedResource>::new();
        for &id in &order {
            let Some(declared) = resources.get(id) else {
                continue;
            };
            let resource = declared.resource;

            match pass.gate(graph.dependencies(id), resource.skip_on_dependency_failure) {
                Gate::Skip { blocked_by } => {
                    tracing::debug!(%id, ?blocked_by, "Skipping resource");
                    report
                        .skipped_by
                        .insert(id.to_string(), blocked_by.iter().map(|s| s.to_string()).collect());
                    pass.record(id, ResourceState::Skipped);
                    continue;
                }
                Gate::Defer { waiting_on } => {
                    tracing::debug!(%id, ?waiting_on, "Deferring resource");
                    pass.record(id, ResourceState::Deferred);
                    continue;
                }
                Gate::ProceedDespiteFailure { failed } => {
                    if failed
                        .iter()
                        .any(|dep| !previous.failed.contains(*dep) && !previous.skipped.contains(*dep))
                    {
                        report.notice(
                            Severity::Warning,
                            reason::DEPENDENCY_FAILED_BUT_PROCEEDING,
                            format!(
                                "Applying {id} even though {} failed",
                                failed.join(", ")
                            ),
                        );
                    }
                }
                Gate::Proceed => {}
            }

            let pending = previous.pending_since.get(id).copied();
            let (state, record) = self
                .apply(node, &declared, vars, pending, now, &mut report)
                .await;
            tracing::debug!(%id, ?state, "Applied resource");
            if let Some(record) = record {
                written.insert(id, record);
            }
            pass.record(id, state);
        }

        report.summary = pass.summary();

        // Keep previous records for declared resources that were neither
        // written nor skipped this pass; they are still ours.
        let mut applied = Vec::new();
        for &id in &order {
            match written.get(id) {
                Some(record) => applied.push(record.clone()),
                None if pass.state(id) == Some(&ResourceState::Skipped) => {}
                None => applied.extend(
                    previous
                        .applied
                        .iter()
                        .filter(|r| r.id == id)
                        .cloned(),
                ),
            }
        }

        let candidates = previous
            .applied
            .iter()
            .filter(|r| match written.get(r.id.as_str()) {
                Some(current) => !current.same_object(r),
                None => resources.get(&r.id).is_none(),
            })
            .filter(|r| !applied.iter().any(|a| a.same_object(r)))
            .cloned()
            .collect::<Vec<_>>();
        for (record, result) in orphan::release_all(
            &self.cluster,
            node,
            &candidates,
            OrphanReason::RemovedFromTemplate,
            now,
        )
        .await
        {
            match result {
                Ok(disposition) => report.released(&record, disposition),
                Err(error) => {
                    if error.is_transient() {
                        report.transient.push(format!("{record}: {error}"));
                    }
                    applied.push(record);
                }
            }
        }
        report.applied = applied;

        report.transitions(&previous);
        report
    }

    /// Releases every resource recorded for a node that is being deleted.
    pub async fn cleanup(
        &self,
        node: &NodeRef,
        applied: &[AppliedResource],
        now: DateTime<Utc>,
    ) -> Cleanup {
        let mut cleanup = Cleanup::default();
        let results = orphan::release_all(
            &self.cluster,
            node,
            applied,
            OrphanReason::LynqNodeDeleted,
            now,
        )
        .await;
        for (record, result) in results {
            match result {
                Ok(disposition) => {
                    if let Some(notice) = release_notice(&record, disposition) {
                        cleanup.notices.push(notice);
                    }
                }
                Err(error) => {
                    if error.is_transient() {
                        cleanup.transient.push(format!("{record}: {error}"));
                    }
                    cleanup.remaining.push(record);
                }
            }
        }
        cleanup.remaining.reverse();
        cleanup
    }

    async fn apply(
        &self,
        node: &NodeRef,
        declared: &Declared<'_>,
        vars: &Variables,
        pending: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> (ResourceState, Option<AppliedResource>) {
        let resource = declared.resource;
        let id = resource.id.as_str();

        let rendered = match Rendered::render(&self.renderer, declared, vars) {
            Ok(rendered) => rendered,
            Err(error) => return (report.fail(id, FailureReason::Render, error.to_string()), None),
        };
        let paths = match FieldPath::parse_all(&resource.ignore_fields) {
            Ok(paths) => paths,
            Err(error) => return (report.fail(id, FailureReason::Render, error.to_string()), None),
        };
        let kind = rendered.kind.clone();
        let scope = match self
            .cluster
            .scope(Some(&rendered.api_version), &rendered.kind)
            .await
        {
            Ok(scope) => scope,
            Err(error) => return (report.cluster_failure(id, error), None),
        };

        let (target, mut desired) = rendered.assemble(scope, node, resource);
        let mut live = match self.cluster.get(&target).await {
            Ok(live) => live,
            Err(error) => return (report.cluster_failure(id, error), None),
        };
        let record = AppliedResource::new(&target.kind, target.namespace.as_deref(), &target.name, id);

        if let Some(current) = live.as_mut() {
            let orphaned = labels::is_orphaned(&current.metadata);
            let foreign =
                !orphaned && !node.tracking().is_managing(&current.metadata, node.uid.as_deref());
            if foreign {
                report.conflicts.push(Conflict {
                    kind: kind.clone(),
                    policy: resource.conflict_policy,
                });
                match resource.conflict_policy {
                    ConflictPolicy::Stuck => {
                        let message = format!("{target} exists and is not managed by this node");
                        return (report.fail(id, FailureReason::Conflict, message), None);
                    }
                    ConflictPolicy::Force => {
                        tracing::info!(%target, "Taking ownership of existing resource");
                    }
                }
            }

            let created_once = resource.creation_policy == CreationPolicy::Once
                && labels::is_created_once(&current.metadata);

            // Created-once objects are never rewritten, so tracking is taken
            // through metadata alone.
            if orphaned || (foreign && created_once) {
                let owned = resource.deletion_policy == DeletionPolicy::Delete
                    && target.namespace.as_deref() == Some(node.namespace.as_str());
                let patch =
                    orphan::adopt_patch(&current.metadata, node, resource.deletion_policy, owned);
                match self.cluster.patch_metadata(&target, &patch).await {
                    Ok(patched) => *current = patched,
                    Err(error) => return (report.cluster_failure(id, error), None),
                }
                if orphaned {
                    tracing::info!(%target, "Re-adopted orphaned resource");
                    report.notice(
                        Severity::Normal,
                        reason::RESOURCE_READOPTED,
                        format!("Re-adopted {target} for {id}"),
                    );
                }
            }

            desired::yield_controller(&mut desired, node, &current.metadata);

            if created_once {
                tracing::debug!(%target, "Created once; not rewriting");
                let state = match serde_json::to_value(&*current) {
                    Ok(obj) => self.readiness(declared, &target, &obj, pending, now, report).await,
                    Err(error) => report.cluster_failure(id, error.into()),
                };
                return (state, Some(record));
            }
        }

        let live_value = match live.as_ref().map(serde_json::to_value).transpose() {
            Ok(value) => value,
            Err(error) => return (report.cluster_failure(id, error.into()), None),
        };
        fieldpath::preserve_ignored_fields(&mut desired, live_value.as_ref(), &paths);
        let desired = match serde_json::from_value::<DynamicObject>(desired) {
            Ok(desired) => desired,
            Err(error) => return (report.cluster_failure(id, error.into()), None),
        };

        let written = self
            .cluster
            .write(&target, &desired, resource.patch_strategy, live.as_ref())
            .await;
        report.attempts.push(Attempt {
            kind,
            success: written.is_ok(),
        });
        let written = match written.and_then(|w| Ok(serde_json::to_value(w)?)) {
            Ok(written) => written,
            Err(error) => return (report.cluster_failure(id, error), None),
        };
        tracing::debug!(%target, strategy = resource.patch_strategy.as_str(), "Wrote resource");

        let state = self
            .readiness(declared, &target, &written, pending, now, report)
            .await;
        (state, Some(record))
    }

    async fn readiness(
        &self,
        declared: &Declared<'_>,
        target: &ObjectRef,
        obj: &serde_json::Value,
        pending: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> ResourceState {
        let resource = declared.resource;
        let id = resource.id.as_str();
        if !resource.wait_for_ready || readiness::is_ready(obj) {
            return ResourceState::Ready;
        }

        let timeout = chrono::Duration::seconds(i64::from(resource.timeout_seconds));
        let since = pending.unwrap_or(now);
        let elapsed = now.signed_duration_since(since);

        if let Some(settle) = self.settle {
            let remaining = (timeout - elapsed).to_std().unwrap_or_default();
            let budget = settle.timeout.min(remaining);
            if !budget.is_zero() {
                match wait::wait_for_ready(&self.cluster, target, budget, settle.interval).await {
                    Ok(_) => return ResourceState::Ready,
                    Err(WaitError::Cluster(error)) => return report.cluster_failure(id, error),
                    Err(WaitError::Timeout { .. }) | Err(WaitError::Gone(_)) => {}
                }
            }
        }

        report.pending_since.insert(id.to_string(), since);
        if elapsed >= timeout {
            let message = format!(
                "{target} not ready after {}s: {}",
                resource.timeout_seconds,
                readiness::readiness_message(obj)
            );
            return report.fail(id, FailureReason::ReadinessTimeout, message);
        }
        ResourceState::Pending
    }
}

// === impl PassReport ===

impl PassReport {
    pub fn is_waiting(&self) -> bool {
        self.summary.waiting > 0
    }

    pub fn is_transient_failure(&self) -> bool {
        !self.transient.is_empty()
    }

    /// Builds the node status for this pass, updating conditions carried
    /// over from `previous`.
    pub fn to_status(
        &self,
        node: &NodeRef,
        previous: Option<&LynqNodeStatus>,
        now: DateTime<Utc>,
    ) -> LynqNodeStatus {
        let generation = node.generation;
        let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
        let summary = &self.summary;

        let (ready, degraded) = if let Some(error) = &self.invalid_graph {
            let message = error.to_string();
            (
                Condition::new(
                    LynqNode::READY,
                    false,
                    reason::INVALID_DEPENDENCY_GRAPH,
                    message.clone(),
                    generation,
                    now,
                ),
                Condition::new(
                    LynqNode::DEGRADED,
                    true,
                    reason::INVALID_DEPENDENCY_GRAPH,
                    message,
                    generation,
                    now,
                ),
            )
        } else {
            let ready = if summary.is_ready() {
                Condition::new(
                    LynqNode::READY,
                    true,
                    "Reconciled",
                    format!("All {} resources are ready", summary.desired),
                    generation,
                    now,
                )
            } else if summary.is_degraded() {
                Condition::new(
                    LynqNode::READY,
                    false,
                    "ResourcesFailed",
                    format!(
                        "{} failed, {} skipped, {}/{} ready",
                        summary.failed, summary.skipped, summary.ready, summary.desired
                    ),
                    generation,
                    now,
                )
            } else {
                Condition::new(
                    LynqNode::READY,
                    false,
                    "ResourcesNotReady",
                    format!(
                        "{}/{} ready, {} waiting",
                        summary.ready, summary.desired, summary.waiting
                    ),
                    generation,
                    now,
                )
            };
            let degraded = match summary.degraded {
                Some(reason) => Condition::new(
                    LynqNode::DEGRADED,
                    true,
                    reason.as_str(),
                    self.failures
                        .iter()
                        .map(|(id, (_, message))| format!("{id}: {message}"))
                        .collect::<Vec<_>>()
                        .join("; "),
                    generation,
                    now,
                ),
                None => Condition::new(LynqNode::DEGRADED, false, "Healthy", "", generation, now),
            };
            (ready, degraded)
        };
        condition::set(&mut conditions, ready);
        condition::set(&mut conditions, degraded);

        LynqNodeStatus {
            observed_generation: generation,
            desired_resources: if self.invalid_graph.is_some() {
                self.declared
            } else {
                summary.desired
            },
            ready_resources: summary.ready,
            failed_resources: summary.failed,
            skipped_resources: summary.skipped,
            conflicted_resources: summary.conflicted,
            skipped_resource_ids: summary.skipped_ids.clone(),
            failed_resource_ids: summary.failed_ids.clone(),
            applied_resources: self.applied.clone(),
            pending_since: self.pending_since.clone(),
            conditions,
        }
    }

    fn invalid(mut self, error: GraphError, previous: &Previous<'_>) -> Self {
        tracing::warn!(%error, "Invalid dependency graph");
        if previous.degraded_reason != Some(reason::INVALID_DEPENDENCY_GRAPH) {
            self.notice(
                Severity::Warning,
                reason::INVALID_DEPENDENCY_GRAPH,
                error.to_string(),
            );
        }
        self.applied = previous.applied.to_vec();
        self.invalid_graph = Some(error);
        self
    }

    fn notice(&mut self, severity: Severity, reason: &'static str, message: String) {
        self.notices.push(Notice {
            severity,
            reason,
            message,
        });
    }

    fn fail(&mut self, id: &str, reason: FailureReason, message: String) -> ResourceState {
        tracing::warn!(%id, %reason, %message, "Resource failed");
        self.failures.insert(id.to_string(), (reason, message));
        ResourceState::Failed(reason)
    }

    fn cluster_failure(&mut self, id: &str, error: ClusterError) -> ResourceState {
        if error.is_transient() {
            self.transient.push(format!("{id}: {error}"));
        }
        self.fail(id, FailureReason::Apply, error.to_string())
    }

    fn released(&mut self, record: &AppliedResource, disposition: Disposition) {
        if let Some(notice) = release_notice(record, disposition) {
            self.notices.push(notice);
        }
    }

    /// Emits events for resources that entered the skipped or failed sets
    /// this pass.
    fn transitions(&mut self, previous: &Previous<'_>) {
        let mut notices = Vec::new();
        for id in outcome::entered(&previous.skipped, &self.summary.skipped_ids) {
            let blocked_by = self
                .skipped_by
                .get(id)
                .map(|deps| deps.join(", "))
                .unwrap_or_default();
            notices.push(Notice {
                severity: Severity::Warning,
                reason: reason::DEPENDENCY_SKIPPED,
                message: format!("Skipped {id}: dependency {blocked_by} failed or was skipped"),
            });
        }
        for id in outcome::entered(&previous.failed, &self.summary.failed_ids) {
            if let Some((reason, message)) = self.failures.get(id) {
                notices.push(Notice {
                    severity: Severity::Warning,
                    reason: reason.as_str(),
                    message: format!("{id}: {message}"),
                });
            }
        }
        self.notices.extend(notices);
    }
}

// === impl Previous ===

impl<'s> Previous<'s> {
    fn new(status: Option<&'s LynqNodeStatus>, generation: Option<i64>) -> Self {
        let Some(status) = status else {
            return Self {
                applied: &[],
                pending_since: BTreeMap::new(),
                skipped: BTreeSet::new(),
                failed: BTreeSet::new(),
                degraded_reason: None,
            };
        };

        // Readiness timers restart when the node's spec changes.
        let pending_since = if status.observed_generation == generation {
            status.pending_since.clone()
        } else {
            BTreeMap::new()
        };
        Self {
            applied: &status.applied_resources,
            pending_since,
            skipped: status.skipped_resource_ids.clone(),
            failed: status.failed_resource_ids.clone(),
            degraded_reason: condition::find(&status.conditions, LynqNode::DEGRADED)
                .filter(|c| c.is_true())
                .map(|c| c.reason.as_str()),
        }
    }
}

fn release_notice(record: &AppliedResource, disposition: Disposition) -> Option<Notice> {
    match disposition {
        Disposition::Deleted => Some(Notice {
            severity: Severity::Normal,
            reason: reason::RESOURCE_DELETED,
            message: format!("Deleted {record}"),
        }),
        Disposition::Retained => Some(Notice {
            severity: Severity::Normal,
            reason: reason::RESOURCE_ORPHANED,
            message: format!("Retained {record} as an orphan"),
        }),
        Disposition::Untracked => None,
    }
}
