//! Form-level rollout accounting and admission.
//!
//! Nothing here is stored between passes except the previous
//! [`RolloutState`], which only carries timestamps forward. Counts are
//! recomputed from the current list of nodes every time, so concurrent
//! writers can at worst overshoot `maxSkew` briefly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What a form needs to know about one of its nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRollout {
    pub name: String,
    /// The form generation most recently pushed to the node.
    pub generation: Option<i64>,
    /// Ready condition is true for the node's current spec.
    pub ready: bool,
    /// When the current generation was pushed to the node.
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloutStats {
    pub total: u32,
    pub ready: u32,
    pub updated: u32,
    pub updating: u32,
    pub ready_updated: u32,
    /// Updating nodes that have exceeded the progress deadline.
    pub stalled: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum RolloutPhase {
    #[default]
    Idle,
    InProgress,
    Failed,
    Complete,
}

/// Rollout status reported on a form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    pub phase: RolloutPhase,
    pub target_generation: i64,
    pub total_nodes: u32,
    pub updated_nodes: u32,
    pub updating_nodes: u32,
    pub ready_updated_nodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Bounds how many nodes may be mid-update at once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Throttle {
    max_skew: u32,
}

// === impl NodeRollout ===

impl NodeRollout {
    pub fn is_updated(&self, target: i64) -> bool {
        self.generation == Some(target)
    }
}

// === impl RolloutStats ===

impl RolloutStats {
    pub fn compute(
        target: i64,
        nodes: &[NodeRollout],
        deadline: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self::default();
        for node in nodes {
            stats.total += 1;
            if node.ready {
                stats.ready += 1;
            }
            if !node.is_updated(target) {
                continue;
            }
            stats.updated += 1;
            if node.ready {
                stats.ready_updated += 1;
                continue;
            }
            stats.updating += 1;
            if node
                .started_at
                .is_some_and(|started| now.signed_duration_since(started) > deadline)
            {
                stats.stalled += 1;
            }
        }
        stats
    }

    /// Percentage of nodes that are updated and ready.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        f64::from(self.ready_updated) / f64::from(self.total) * 100.0
    }
}

// === impl RolloutPhase ===

impl RolloutPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::InProgress => "InProgress",
            Self::Failed => "Failed",
            Self::Complete => "Complete",
        }
    }

    /// Gauge encoding: Idle 0, InProgress 1, Failed 2, Complete 3.
    pub fn as_metric(&self) -> i64 {
        match self {
            Self::Idle => 0,
            Self::InProgress => 1,
            Self::Failed => 2,
            Self::Complete => 3,
        }
    }
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl RolloutState ===

impl RolloutState {
    /// Derives the rollout state for `target` from fresh stats, carrying
    /// timestamps over from `previous` when it tracked the same generation.
    pub fn observe(
        previous: Option<&RolloutState>,
        target: i64,
        stats: &RolloutStats,
        now: DateTime<Utc>,
    ) -> Self {
        let previous = previous.filter(|p| p.target_generation == target);
        let started = previous.and_then(|p| p.start_time).unwrap_or(now);
        let completed = previous.and_then(|p| p.completion_time).unwrap_or(now);

        let (phase, start_time, completion_time, message) = if stats.total == 0 {
            (RolloutPhase::Idle, None, None, "No nodes reference this form".to_string())
        } else if stats.ready_updated == stats.total {
            (
                RolloutPhase::Complete,
                Some(started),
                Some(completed),
                format!("All {} nodes updated and ready", stats.total),
            )
        } else if stats.stalled > 0 {
            (
                RolloutPhase::Failed,
                Some(started),
                Some(completed),
                format!(
                    "{} nodes exceeded the progress deadline without becoming ready",
                    stats.stalled
                ),
            )
        } else if stats.updated == 0 {
            (
                RolloutPhase::Idle,
                None,
                None,
                format!("Waiting to update {} nodes", stats.total),
            )
        } else {
            (
                RolloutPhase::InProgress,
                Some(started),
                None,
                format!(
                    "{}/{} nodes updated, {} updating",
                    stats.updated, stats.total, stats.updating
                ),
            )
        };

        Self {
            phase,
            target_generation: target,
            total_nodes: stats.total,
            updated_nodes: stats.updated,
            updating_nodes: stats.updating,
            ready_updated_nodes: stats.ready_updated,
            start_time,
            completion_time,
            message,
        }
    }
}

// === impl Throttle ===

impl Throttle {
    pub fn new(max_skew: u32) -> Self {
        Self { max_skew }
    }

    /// A zero skew disables throttling entirely.
    pub fn is_enabled(&self) -> bool {
        self.max_skew > 0
    }

    /// Returns the nodes that may be moved to `target` now, in name order.
    ///
    /// Nodes already on `target` are never returned. No node is admitted while
    /// the rollout is failed; a new generation starts a new rollout.
    pub fn admit<'n>(
        &self,
        target: i64,
        nodes: &'n [NodeRollout],
        state: &RolloutState,
    ) -> Vec<&'n NodeRollout> {
        let mut lagging = nodes
            .iter()
            .filter(|n| !n.is_updated(target))
            .collect::<Vec<_>>();
        lagging.sort_by(|a, b| a.name.cmp(&b.name));

        let capacity = if !self.is_enabled() {
            lagging.len()
        } else if state.phase == RolloutPhase::Failed && state.target_generation == target {
            0
        } else {
            self.max_skew.saturating_sub(state.updating_nodes) as usize
        };
        lagging.truncate(capacity);
        lagging
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn deadline() -> Duration {
        Duration::seconds(600)
    }

    fn node(name: &str, generation: Option<i64>, ready: bool) -> NodeRollout {
        NodeRollout {
            name: name.to_string(),
            generation,
            ready,
            started_at: generation.map(|_| now()),
        }
    }

    #[test]
    fn counts_updated_updating_and_ready() {
        let nodes = vec![
            node("a", Some(2), true),
            node("b", Some(2), false),
            node("c", Some(1), true),
            node("d", None, false),
        ];
        let stats = RolloutStats::compute(2, &nodes, deadline(), now());
        assert_eq!(
            stats,
            RolloutStats {
                total: 4,
                ready: 2,
                updated: 2,
                updating: 1,
                ready_updated: 1,
                stalled: 0,
            }
        );
        assert_eq!(stats.progress(), 25.0);
    }

    #[test]
    fn phases() {
        let t = now();
        let state = |nodes: &[NodeRollout]| {
            let stats = RolloutStats::compute(2, nodes, deadline(), t);
            RolloutState::observe(None, 2, &stats, t)
        };

        assert_eq!(state(&[]).phase, RolloutPhase::Idle);
        assert_eq!(state(&[node("a", Some(1), true)]).phase, RolloutPhase::Idle);
        assert_eq!(
            state(&[node("a", Some(2), false), node("b", Some(1), true)]).phase,
            RolloutPhase::InProgress
        );
        assert_eq!(
            state(&[node("a", Some(2), true), node("b", Some(2), true)]).phase,
            RolloutPhase::Complete
        );
    }

    #[test]
    fn stalled_update_fails_the_rollout() {
        let mut stuck = node("a", Some(2), false);
        stuck.started_at = Some(now() - Duration::seconds(601));
        let nodes = vec![stuck, node("b", Some(1), true)];

        let stats = RolloutStats::compute(2, &nodes, deadline(), now());
        assert_eq!(stats.stalled, 1);
        let state = RolloutState::observe(None, 2, &stats, now());
        assert_eq!(state.phase, RolloutPhase::Failed);
        assert_eq!(state.completion_time, Some(now()));

        let throttle = Throttle::new(5);
        assert!(throttle.admit(2, &nodes, &state).is_empty());
    }

    #[test]
    fn timestamps_carry_over_within_a_generation() {
        let t0 = now();
        let t1 = t0 + Duration::seconds(30);
        let t2 = t1 + Duration::seconds(30);

        let updating = [node("a", Some(2), false)];
        let s0 = RolloutState::observe(
            None,
            2,
            &RolloutStats::compute(2, &updating, deadline(), t0),
            t0,
        );
        assert_eq!(s0.start_time, Some(t0));
        assert_eq!(s0.completion_time, None);

        let done = [node("a", Some(2), true)];
        let s1 = RolloutState::observe(
            Some(&s0),
            2,
            &RolloutStats::compute(2, &done, deadline(), t1),
            t1,
        );
        assert_eq!(s1.phase, RolloutPhase::Complete);
        assert_eq!(s1.start_time, Some(t0));
        assert_eq!(s1.completion_time, Some(t1));

        let s2 = RolloutState::observe(
            Some(&s1),
            2,
            &RolloutStats::compute(2, &done, deadline(), t2),
            t2,
        );
        assert_eq!(s2.completion_time, Some(t1));

        // A new generation starts a new rollout.
        let lagging = [node("a", Some(2), true)];
        let s3 = RolloutState::observe(
            Some(&s2),
            3,
            &RolloutStats::compute(3, &lagging, deadline(), t2),
            t2,
        );
        assert_eq!(s3.phase, RolloutPhase::Idle);
        assert_eq!(s3.start_time, None);
        assert_eq!(s3.completion_time, None);
    }

    #[test]
    fn admits_in_name_order_up_to_capacity() {
        let nodes = vec![
            node("d", None, true),
            node("b", Some(1), true),
            node("a", Some(2), false),
            node("c", Some(1), true),
        ];
        let stats = RolloutStats::compute(2, &nodes, deadline(), now());
        let state = RolloutState::observe(None, 2, &stats, now());
        assert_eq!(state.updating_nodes, 1);

        let names = |admitted: Vec<&NodeRollout>| {
            admitted
                .into_iter()
                .map(|n| n.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(Throttle::new(1).admit(2, &nodes, &state)), Vec::<String>::new());
        assert_eq!(names(Throttle::new(3).admit(2, &nodes, &state)), vec!["b", "c"]);
        assert_eq!(
            names(Throttle::new(0).admit(2, &nodes, &state)),
            vec!["b", "c", "d"]
        );
    }

    #[test]
    fn rollout_respects_max_skew_and_completes() {
        const MAX_SKEW: u32 = 3;
        let target = 7;
        let mut t = now();
        let mut nodes = (0..20)
            .map(|i| node(&format!("node-{i:02}"), Some(6), true))
            .collect::<Vec<_>>();
        let throttle = Throttle::new(MAX_SKEW);
        let mut previous = None::<RolloutState>;

        for step in 0..200 {
            let stats = RolloutStats::compute(target, &nodes, deadline(), t);
            let state = RolloutState::observe(previous.as_ref(), target, &stats, t);
            assert!(state.updating_nodes <= MAX_SKEW, "step {step}: {state:?}");
            if state.phase == RolloutPhase::Complete {
                assert_eq!(state.ready_updated_nodes, state.total_nodes);
                return;
            }

            let admitted = throttle
                .admit(target, &nodes, &state)
                .into_iter()
                .map(|n| n.name.clone())
                .collect::<Vec<_>>();
            for node in nodes.iter_mut() {
                if admitted.contains(&node.name) {
                    node.generation = Some(target);
                    node.ready = false;
                    node.started_at = Some(t);
                }
            }

            let stats = RolloutStats::compute(target, &nodes, deadline(), t);
            assert!(stats.updating <= MAX_SKEW, "step {step}: {stats:?}");

            // Every other updating node becomes ready each step.
            let mut flip = step % 2 == 0;
            for node in nodes.iter_mut() {
                if node.is_updated(target) && !node.ready {
                    if flip {
                        node.ready = true;
                    }
                    flip = !flip;
                }
            }

            previous = Some(state);
            t += Duration::seconds(10);
        }
        panic!("rollout did not complete");
    }

    #[test]
    fn state_serializes_in_camel_case() {
        let state = RolloutState {
            phase: RolloutPhase::InProgress,
            target_generation: 3,
            total_nodes: 4,
            updated_nodes: 2,
            updating_nodes: 1,
            ready_updated_nodes: 1,
            start_time: None,
            completion_time: None,
            message: String::new(),
        };
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            serde_json::json!({
                "phase": "InProgress",
                "targetGeneration": 3,
                "totalNodes": 4,
                "updatedNodes": 2,
                "updatingNodes": 1,
                "readyUpdatedNodes": 1,
            })
        );
    }
}
