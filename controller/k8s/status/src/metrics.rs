use ahash::AHashMap as HashMap;
use lynq_controller_core::{RolloutPhase, RolloutStats};
use lynq_controller_k8s_api::{condition, ConflictPolicy, LynqNode, LynqNodeStatus};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::sync::{atomic::AtomicU64, Arc};
use tokio::time;

#[derive(Clone, Debug)]
pub struct NodeMetrics {
    desired: Family<NodeLabels, Gauge>,
    ready: Family<NodeLabels, Gauge>,
    failed: Family<NodeLabels, Gauge>,
    skipped: Family<NodeLabels, Gauge>,
    conflicted: Family<NodeLabels, Gauge>,
    condition: Family<ConditionLabels, Gauge>,
    degraded: Family<DegradedLabels, Gauge>,
    conflicts: Family<ConflictLabels, Counter>,
    attempts: Family<AttemptLabels, Counter>,
    reconciles: Family<ResultLabels, Histogram>,
    degraded_reasons: Arc<Mutex<HashMap<NodeLabels, String>>>,
}

#[derive(Clone, Debug)]
pub struct FormMetrics {
    updating: Family<FormLabels, Gauge>,
    phase: Family<FormLabels, Gauge>,
    progress: Family<FormLabels, Gauge<f64, AtomicU64>>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NodeLabels {
    namespace: String,
    lynqnode: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConditionLabels {
    namespace: String,
    lynqnode: String,
    condition: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DegradedLabels {
    namespace: String,
    lynqnode: String,
    reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConflictLabels {
    resource_kind: String,
    conflict_policy: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AttemptLabels {
    kind: String,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FormLabels {
    namespace: String,
    lynqform: String,
}

const CONDITIONS: [&str; 2] = [LynqNode::READY, LynqNode::DEGRADED];

// === impl NodeMetrics ===

impl NodeMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let desired = gauge(reg, "resources_desired", "Resources declared by the node");
        let ready = gauge(reg, "resources_ready", "Resources written and ready");
        let failed = gauge(reg, "resources_failed", "Resources that failed in the last pass");
        let skipped = gauge(
            reg,
            "resources_skipped",
            "Resources skipped because a dependency failed",
        );
        let conflicted = gauge(
            reg,
            "resources_conflicted",
            "Resources blocked by an object the node does not manage",
        );

        let condition = Family::<ConditionLabels, Gauge>::default();
        reg.register(
            "condition_status",
            "Node condition status (0 False, 1 True, 2 Unknown)",
            condition.clone(),
        );

        let degraded = Family::<DegradedLabels, Gauge>::default();
        reg.register(
            "degraded_status",
            "Set to 1 with the reason a node is degraded",
            degraded.clone(),
        );

        let conflicts = Family::<ConflictLabels, Counter>::default();
        reg.register(
            "conflicts",
            "Resources found owned by someone else",
            conflicts.clone(),
        );

        let attempts = Family::<AttemptLabels, Counter>::default();
        reg.register(
            "apply_attempts",
            "Resource writes by kind and result",
            attempts.clone(),
        );

        let reconciles = Family::<ResultLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0])
        });
        reg.register_with_unit(
            "reconcile_duration",
            "Time spent reconciling a node",
            Unit::Seconds,
            reconciles.clone(),
        );

        Self {
            desired,
            ready,
            failed,
            skipped,
            conflicted,
            condition,
            degraded,
            conflicts,
            attempts,
            reconciles,
            degraded_reasons: Default::default(),
        }
    }

    pub fn observe(&self, namespace: &str, name: &str, status: &LynqNodeStatus) {
        let labels = NodeLabels::new(namespace, name);
        self.desired
            .get_or_create(&labels)
            .set(status.desired_resources.into());
        self.ready.get_or_create(&labels).set(status.ready_resources.into());
        self.failed.get_or_create(&labels).set(status.failed_resources.into());
        self.skipped
            .get_or_create(&labels)
            .set(status.skipped_resources.into());
        self.conflicted
            .get_or_create(&labels)
            .set(status.conflicted_resources.into());

        for c in &status.conditions {
            self.condition
                .get_or_create(&labels.condition(&c.type_))
                .set(c.status.as_metric());
        }

        let reason = condition::find(&status.conditions, LynqNode::DEGRADED)
            .filter(|c| c.is_true())
            .map(|c| c.reason.clone());
        let mut reasons = self.degraded_reasons.lock();
        let previous = match &reason {
            Some(reason) => reasons.insert(labels.clone(), reason.clone()),
            None => reasons.remove(&labels),
        };
        if let Some(previous) = previous.filter(|p| Some(p) != reason.as_ref()) {
            self.degraded.remove(&labels.degraded(&previous));
        }
        if let Some(reason) = reason {
            self.degraded.get_or_create(&labels.degraded(&reason)).set(1);
        }
    }

    /// Drops every series for a deleted node.
    pub fn remove(&self, namespace: &str, name: &str) {
        let labels = NodeLabels::new(namespace, name);
        for family in [
            &self.desired,
            &self.ready,
            &self.failed,
            &self.skipped,
            &self.conflicted,
        ] {
            family.remove(&labels);
        }
        for type_ in CONDITIONS {
            self.condition.remove(&labels.condition(type_));
        }
        if let Some(reason) = self.degraded_reasons.lock().remove(&labels) {
            self.degraded.remove(&labels.degraded(&reason));
        }
    }

    pub fn conflict(&self, kind: &str, policy: ConflictPolicy) {
        self.conflicts
            .get_or_create(&ConflictLabels {
                resource_kind: kind.to_string(),
                conflict_policy: policy.as_str(),
            })
            .inc();
    }

    pub fn apply_attempt(&self, kind: &str, success: bool) {
        self.attempts
            .get_or_create(&AttemptLabels {
                kind: kind.to_string(),
                result: if success { "success" } else { "error" },
            })
            .inc();
    }

    pub fn reconciled(&self, result: &'static str, elapsed: time::Duration) {
        self.reconciles
            .get_or_create(&ResultLabels { result })
            .observe(elapsed.as_secs_f64());
    }
}

fn gauge(reg: &mut Registry, name: &str, help: &str) -> Family<NodeLabels, Gauge> {
    let family = Family::<NodeLabels, Gauge>::default();
    reg.register(name, help, family.clone());
    family
}

impl NodeLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            lynqnode: name.to_string(),
        }
    }

    fn condition(&self, type_: &str) -> ConditionLabels {
        ConditionLabels {
            namespace: self.namespace.clone(),
            lynqnode: self.lynqnode.clone(),
            condition: type_.to_string(),
        }
    }

    fn degraded(&self, reason: &str) -> DegradedLabels {
        DegradedLabels {
            namespace: self.namespace.clone(),
            lynqnode: self.lynqnode.clone(),
            reason: reason.to_string(),
        }
    }
}

// === impl FormMetrics ===

impl FormMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let updating = Family::<FormLabels, Gauge>::default();
        reg.register(
            "rollout_updating_nodes",
            "Nodes on the target generation that are not ready yet",
            updating.clone(),
        );

        let phase = Family::<FormLabels, Gauge>::default();
        reg.register(
            "rollout_phase",
            "Rollout phase (0 Idle, 1 InProgress, 2 Failed, 3 Complete)",
            phase.clone(),
        );

        let progress = Family::<FormLabels, Gauge<f64, AtomicU64>>::default();
        reg.register(
            "rollout_progress",
            "Percentage of nodes updated and ready",
            progress.clone(),
        );

        Self {
            updating,
            phase,
            progress,
        }
    }

    pub fn observe(&self, namespace: &str, name: &str, stats: &RolloutStats, phase: RolloutPhase) {
        let labels = FormLabels {
            namespace: namespace.to_string(),
            lynqform: name.to_string(),
        };
        self.updating.get_or_create(&labels).set(stats.updating.into());
        self.phase.get_or_create(&labels).set(phase.as_metric());
        self.progress.get_or_create(&labels).set(stats.progress());
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let labels = FormLabels {
            namespace: namespace.to_string(),
            lynqform: name.to_string(),
        };
        self.updating.remove(&labels);
        self.phase.remove(&labels);
        self.progress.remove(&labels);
    }
}
