//! Reconciles `LynqForm`s: validation, form status, and the rollout of new
//! form generations to nodes through the throttle.

use crate::{
    backoff::Backoff,
    core::{Engine, NodeRollout, RolloutPhase, RolloutState, RolloutStats, Throttle},
    k8s::{
        condition::{self, Condition},
        labels, LynqForm, LynqFormStatus, LynqNode,
    },
    lease::Leadership,
    status::{self, events::action, EventType, FormMetrics, Publish, RetryPolicy},
    validation, Error,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::prelude::*;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Resource, ResourceExt,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};

pub(crate) struct Context {
    pub(crate) client: kube::Client,
    pub(crate) engine: Engine,
    pub(crate) events: Arc<dyn Publish>,
    pub(crate) metrics: FormMetrics,
    pub(crate) leadership: Leadership,
    pub(crate) field_manager: String,
    pub(crate) requeue: time::Duration,
    /// Resync while a rollout is moving.
    pub(crate) rollout_poll: time::Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) backoff: Backoff,
}

/// Everything one pass over a form decided.
#[derive(Debug)]
struct Plan {
    status: LynqFormStatus,
    stats: RolloutStats,
    phase: RolloutPhase,
    /// Nodes to move to the form's generation, in name order.
    push: Vec<String>,
    events: Vec<(EventType, &'static str, String)>,
}

const VALID: &str = "Valid";
const APPLIED: &str = "Applied";
const READY: &str = "Ready";

mod reason {
    pub const VALIDATION_PASSED: &str = "ValidationPassed";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const ROLLOUT_STARTED: &str = "RolloutStarted";
    pub const ROLLOUT_COMPLETE: &str = "RolloutComplete";
    pub const ROLLOUT_FAILED: &str = "RolloutFailed";
}

pub(crate) async fn run(ctx: Arc<Context>, concurrency: u16) {
    let forms = Api::<LynqForm>::all(ctx.client.clone());
    let nodes = Api::<LynqNode>::all(ctx.client.clone());
    Controller::new(forms, watcher::Config::default())
        .watches(nodes, watcher::Config::default(), |node| {
            let namespace = node.namespace()?;
            Some(ObjectRef::<LynqForm>::new(&node.spec.template_ref).within(&namespace))
        })
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((form, action)) => debug!(%form, ?action, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(form: Arc<LynqForm>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = form.namespace().unwrap_or_default();
    let name = form.name_any();
    if form.meta().deletion_timestamp.is_some() {
        ctx.metrics.remove(&namespace, &name);
        return Ok(Action::await_change());
    }
    if !ctx.leadership.is_leader() {
        return Ok(Action::requeue(ctx.requeue));
    }

    let res = sync(&form, &ctx)
        .instrument(info_span!("lynqform", %namespace, %name))
        .await;
    if res.is_ok() {
        ctx.backoff.reset(&namespace, &name);
    }
    res
}

fn error_policy(form: Arc<LynqForm>, error: &Error, ctx: Arc<Context>) -> Action {
    let namespace = form.namespace().unwrap_or_default();
    let name = form.name_any();
    let delay = ctx.backoff.failed(&namespace, &name);
    warn!(%namespace, %name, %error, ?delay, "Failed to reconcile LynqForm");
    Action::requeue(delay)
}

async fn sync(form: &LynqForm, ctx: &Context) -> Result<Action, Error> {
    let namespace = form.namespace().unwrap_or_default();
    let name = form.name_any();
    let now = Utc::now();

    let valid = validation::validate_form(&form.spec, &ctx.engine).map_err(|e| e.to_string());
    if let Err(error) = &valid {
        info!(%error, "Form is invalid; not rolling out");
    }

    let nodes = Api::<LynqNode>::namespaced(ctx.client.clone(), &namespace);
    let members = nodes
        .list(&ListParams::default())
        .await?
        .into_iter()
        .filter(|n| n.spec.template_ref == name && n.meta().deletion_timestamp.is_none())
        .map(|n| NodeRollout {
            name: n.name_any(),
            generation: n.template_generation(),
            ready: n.is_ready_for_rollout(),
            started_at: n.rollout_started_at(),
        })
        .collect::<Vec<_>>();

    let plan = plan(form, &members, valid, now);

    let target = form.meta().generation.unwrap_or_default();
    let mut failed = Vec::new();
    if !plan.push.is_empty() {
        let patch = snapshot(form, target, now)?;
        let params = PatchParams {
            field_manager: Some(ctx.field_manager.clone()),
            ..Default::default()
        };
        for node in &plan.push {
            match nodes.patch(node, &params, &Patch::Merge(&patch)).await {
                Ok(_) => debug!(%node, generation = target, "Moved node to form generation"),
                Err(error) => {
                    warn!(%node, %error, "Failed to move node to form generation");
                    failed.push(node.clone());
                }
            }
        }
        info!(
            pushed = plan.push.len() - failed.len(),
            generation = target,
            "Rolled out form"
        );
    }

    let reference = form.object_ref(&());
    for (type_, reason, note) in &plan.events {
        ctx.events
            .publish(&reference, *type_, reason, action_for(reason), note.clone())
            .await;
    }

    if plan.status.rollout.is_some() {
        ctx.metrics.observe(&namespace, &name, &plan.stats, plan.phase);
    } else {
        ctx.metrics.remove(&namespace, &name);
    }
    if form.status.as_ref() != Some(&plan.status) {
        let api = Api::<LynqForm>::namespaced(ctx.client.clone(), &namespace);
        match status::patch_status(
            &api,
            &name,
            form.resource_version().as_deref(),
            &plan.status,
            &ctx.field_manager,
            ctx.retry,
        )
        .await
        {
            Ok(_) => {}
            Err(error) if status::is_conflict(&error) => {
                warn!(%error, "Status write kept conflicting; leaving it to the next pass");
            }
            Err(error) => return Err(error.into()),
        }
    }

    if !failed.is_empty() {
        return Err(Error::Push {
            generation: target,
            nodes: failed,
        });
    }
    if plan.phase == RolloutPhase::InProgress || !plan.push.is_empty() {
        return Ok(Action::requeue(ctx.rollout_poll));
    }
    Ok(Action::requeue(ctx.requeue))
}

/// Decides which nodes move to the form's generation and what the form's
/// status becomes once they have.
fn plan(
    form: &LynqForm,
    nodes: &[NodeRollout],
    valid: Result<(), String>,
    now: DateTime<Utc>,
) -> Plan {
    let generation = form.meta().generation;
    let target = generation.unwrap_or_default();
    let rollout = form.spec.rollout();
    let throttle = Throttle::new(rollout.max_skew);
    let deadline = rollout.progress_deadline();
    let previous = form.status.as_ref();
    let previous_rollout = previous
        .and_then(|s| s.rollout.as_ref())
        .filter(|r| r.target_generation == target);

    let stats = RolloutStats::compute(target, nodes, deadline, now);
    let state = RolloutState::observe(previous_rollout, target, &stats, now);
    let push = if valid.is_ok() {
        throttle
            .admit(target, nodes, &state)
            .into_iter()
            .map(|n| n.name.clone())
            .collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    // Account for this pass's pushes before reporting.
    let (stats, state) = if push.is_empty() {
        (stats, state)
    } else {
        let nodes = nodes
            .iter()
            .map(|n| {
                if push.contains(&n.name) {
                    NodeRollout {
                        name: n.name.clone(),
                        generation: Some(target),
                        ready: false,
                        started_at: Some(now),
                    }
                } else {
                    n.clone()
                }
            })
            .collect::<Vec<_>>();
        let stats = RolloutStats::compute(target, &nodes, deadline, now);
        let state = RolloutState::observe(previous_rollout, target, &stats, now);
        (stats, state)
    };

    let mut events = Vec::new();
    let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();

    let (valid_status, valid_reason, valid_message) = match &valid {
        Ok(()) => (true, reason::VALIDATION_PASSED, "Form validation passed".to_string()),
        Err(error) => (false, reason::VALIDATION_FAILED, error.clone()),
    };
    let valid_changed = condition::set(
        &mut conditions,
        Condition::new(VALID, valid_status, valid_reason, &valid_message, generation, now),
    );
    let previous_message = previous
        .and_then(|s| condition::find(&s.conditions, VALID))
        .map(|c| c.message.as_str());
    if valid_changed || (!valid_status && previous_message != Some(valid_message.as_str())) {
        let type_ = if valid_status {
            EventType::Normal
        } else {
            EventType::Warning
        };
        events.push((type_, valid_reason, valid_message));
    }

    let (applied, applied_reason, applied_message) = if stats.total == 0 {
        (false, "NoNodes", "No nodes reference this form".to_string())
    } else if stats.updated == stats.total {
        (
            true,
            "AllNodesUpdated",
            format!("All {} nodes are on generation {target}", stats.total),
        )
    } else {
        (
            false,
            "NodesUpdating",
            format!(
                "{}/{} nodes are on generation {target}",
                stats.updated, stats.total
            ),
        )
    };
    condition::set(
        &mut conditions,
        Condition::new(APPLIED, applied, applied_reason, applied_message, generation, now),
    );

    let (ready, ready_reason, ready_message) = if stats.total == 0 {
        (false, "NoNodes", "No nodes reference this form".to_string())
    } else if stats.ready == stats.total {
        (true, "AllNodesReady", format!("All {} nodes ready", stats.total))
    } else {
        (
            false,
            "NotAllNodesReady",
            format!("{}/{} nodes ready", stats.ready, stats.total),
        )
    };
    condition::set(
        &mut conditions,
        Condition::new(READY, ready, ready_reason, ready_message, generation, now),
    );

    if throttle.is_enabled() {
        let before = previous_rollout.map(|r| r.phase);
        let entered = |phase| state.phase == phase && before != Some(phase);
        if entered(RolloutPhase::InProgress) && before != Some(RolloutPhase::Failed) {
            events.push((
                EventType::Normal,
                reason::ROLLOUT_STARTED,
                format!(
                    "Rolling out generation {target} to {} nodes, at most {} at a time",
                    stats.total, rollout.max_skew
                ),
            ));
        }
        if entered(RolloutPhase::Complete) && before.is_some() {
            events.push((
                EventType::Normal,
                reason::ROLLOUT_COMPLETE,
                state.message.clone(),
            ));
        }
        if entered(RolloutPhase::Failed) {
            events.push((EventType::Warning, reason::ROLLOUT_FAILED, state.message.clone()));
        }
    }

    let phase = state.phase;
    let status = LynqFormStatus {
        observed_generation: generation,
        total_nodes: stats.total,
        ready_nodes: stats.ready,
        rollout: throttle.is_enabled().then_some(state),
        conditions,
    };

    Plan {
        status,
        stats,
        phase,
        push,
        events,
    }
}

/// A merge patch that moves a node to the form's current resources.
fn snapshot(form: &LynqForm, generation: i64, now: DateTime<Utc>) -> Result<Value, Error> {
    let mut annotations = Map::new();
    annotations.insert(
        labels::TEMPLATE_GENERATION.to_string(),
        Value::from(generation.to_string()),
    );
    annotations.insert(
        labels::ROLLOUT_STARTED_AT.to_string(),
        Value::from(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );

    let mut metadata = Map::new();
    metadata.insert("annotations".to_string(), Value::Object(annotations));

    let mut patch = Map::new();
    patch.insert("metadata".to_string(), Value::Object(metadata));
    patch.insert(
        "spec".to_string(),
        Value::Object(form.spec.resources.to_merge_patch()?),
    );
    Ok(Value::Object(patch))
}

fn action_for(reason: &str) -> &'static str {
    match reason {
        reason::VALIDATION_PASSED | reason::VALIDATION_FAILED => action::VALIDATE,
        _ => action::ROLLOUT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
    }

    fn form(generation: i64, max_skew: u32) -> LynqForm {
        serde_json::from_value(json!({
            "apiVersion": "operator.lynq.sh/v1",
            "kind": "LynqForm",
            "metadata": {"name": "web", "namespace": "tenants", "generation": generation},
            "spec": {
                "hubId": "customers",
                "rollout": {"maxSkew": max_skew, "progressDeadlineSeconds": 60},
                "configMaps": [{"id": "cm", "nameTemplate": "{{ uid }}-cm"}],
            },
        }))
        .expect("form must parse")
    }

    fn node(name: &str, generation: Option<i64>, ready: bool) -> NodeRollout {
        NodeRollout {
            name: name.to_string(),
            generation,
            ready,
            started_at: generation.map(|_| at(0)),
        }
    }

    fn reasons(plan: &Plan) -> Vec<&'static str> {
        plan.events.iter().map(|(_, reason, _)| *reason).collect()
    }

    /// Applies a plan the way the cluster would: pushed nodes move to the
    /// target and the form carries the planned status.
    fn settle(form: &mut LynqForm, nodes: &mut [NodeRollout], plan: &Plan, now: DateTime<Utc>) {
        let target = form.metadata.generation.unwrap_or_default();
        for node in nodes.iter_mut() {
            if plan.push.contains(&node.name) {
                node.generation = Some(target);
                node.ready = false;
                node.started_at = Some(now);
            }
        }
        form.status = Some(plan.status.clone());
    }

    #[test]
    fn max_skew_bounds_updating_nodes_until_complete() {
        let mut form = form(2, 2);
        let mut nodes = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|n| node(n, Some(1), true))
            .collect::<Vec<_>>();

        let plan = plan(&form, &nodes, Ok(()), at(0));
        assert_eq!(plan.push, vec!["a", "b"]);
        assert_eq!(plan.phase, RolloutPhase::InProgress);
        assert_eq!(plan.stats.updating, 2);
        assert!(reasons(&plan).contains(&reason::ROLLOUT_STARTED));
        settle(&mut form, &mut nodes, &plan, at(0));

        // Nothing moves while both updating nodes are not ready.
        let plan = super::plan(&form, &nodes, Ok(()), at(10));
        assert!(plan.push.is_empty());
        assert_eq!(reasons(&plan), Vec::<&str>::new());
        settle(&mut form, &mut nodes, &plan, at(10));

        let mut second = 20;
        while plan_once(&mut form, &mut nodes, at(second)) != RolloutPhase::Complete {
            let updating = nodes
                .iter()
                .filter(|n| n.generation == Some(2) && !n.ready)
                .count();
            assert!(updating <= 2, "{updating} nodes updating at once");
            for n in nodes.iter_mut().filter(|n| n.generation == Some(2)) {
                n.ready = true;
            }
            second += 10;
            assert!(second < 200, "rollout never completed");
        }

        let status = form.status.as_ref().expect("status");
        let rollout = status.rollout.as_ref().expect("rollout");
        assert_eq!(rollout.updated_nodes, 5);
        assert_eq!(rollout.ready_updated_nodes, 5);
        assert!(rollout.completion_time.is_some());
        assert_eq!(status.ready_nodes, 5);
    }

    fn plan_once(form: &mut LynqForm, nodes: &mut [NodeRollout], now: DateTime<Utc>) -> RolloutPhase {
        let plan = plan(form, nodes, Ok(()), now);
        settle(form, nodes, &plan, now);
        plan.phase
    }

    #[test]
    fn zero_skew_pushes_every_lagging_node() {
        let form = form(3, 0);
        let nodes = vec![
            node("b", Some(2), true),
            node("a", None, false),
            node("c", Some(3), true),
        ];
        let plan = plan(&form, &nodes, Ok(()), at(0));
        assert_eq!(plan.push, vec!["a", "b"]);
        assert_eq!(plan.status.rollout, None);
        assert_eq!(plan.status.total_nodes, 3);
        assert!(!reasons(&plan).contains(&reason::ROLLOUT_STARTED));
    }

    #[test]
    fn stalled_rollouts_fail_and_stop_admitting() {
        let mut form = form(2, 1);
        let mut nodes = vec![node("a", Some(1), true), node("b", Some(1), true)];

        let plan = plan(&form, &nodes, Ok(()), at(0));
        assert_eq!(plan.push, vec!["a"]);
        settle(&mut form, &mut nodes, &plan, at(0));

        let plan = super::plan(&form, &nodes, Ok(()), at(61));
        assert_eq!(plan.phase, RolloutPhase::Failed);
        assert!(plan.push.is_empty());
        assert_eq!(reasons(&plan), vec![reason::ROLLOUT_FAILED]);
        settle(&mut form, &mut nodes, &plan, at(61));

        // Reported once.
        let plan = super::plan(&form, &nodes, Ok(()), at(90));
        assert!(plan.events.is_empty());
        assert!(plan.push.is_empty());

        // A new generation starts over.
        form.metadata.generation = Some(3);
        let plan = super::plan(&form, &nodes, Ok(()), at(120));
        assert_eq!(plan.push, vec!["a"]);
        assert_eq!(plan.phase, RolloutPhase::InProgress);
    }

    #[test]
    fn invalid_forms_are_not_rolled_out() {
        let mut form = form(2, 0);
        let nodes = vec![node("a", Some(1), true)];

        let plan = plan(&form, &nodes, Err("dependency cycle detected".to_string()), at(0));
        assert!(plan.push.is_empty());
        let valid = condition::find(&plan.status.conditions, VALID).expect("valid condition");
        assert!(!valid.is_true());
        assert_eq!(valid.reason, reason::VALIDATION_FAILED);
        assert_eq!(reasons(&plan), vec![reason::VALIDATION_FAILED]);
        form.status = Some(plan.status);

        // The same failure is not reported again.
        let plan = super::plan(&form, &nodes, Err("dependency cycle detected".to_string()), at(5));
        assert!(plan.events.is_empty());
        form.status = Some(plan.status);

        let plan = super::plan(&form, &nodes, Ok(()), at(10));
        assert_eq!(plan.push, vec!["a"]);
        assert_eq!(reasons(&plan), vec![reason::VALIDATION_PASSED]);
    }

    #[test]
    fn conditions_track_nodes() {
        let form = form(2, 0);
        let plan = plan(&form, &[], Ok(()), at(0));
        let applied = condition::find(&plan.status.conditions, APPLIED).expect("applied");
        assert_eq!(applied.reason, "NoNodes");

        let nodes = vec![node("a", Some(2), true), node("b", Some(2), false)];
        let plan = super::plan(&form, &nodes, Ok(()), at(0));
        assert!(plan.push.is_empty());
        assert!(condition::is_true(&plan.status.conditions, APPLIED));
        let ready = condition::find(&plan.status.conditions, READY).expect("ready");
        assert!(!ready.is_true());
        assert_eq!(ready.message, "1/2 nodes ready");
        assert_eq!(plan.status.ready_nodes, 1);
        assert_eq!(plan.status.observed_generation, Some(2));
    }

    #[test]
    fn snapshots_carry_the_generation_and_resources() {
        let form = form(4, 1);
        let patch = snapshot(&form, 4, at(0)).expect("patch");
        assert_eq!(
            patch["metadata"]["annotations"],
            json!({
                "lynq.sh/template-generation": "4",
                "lynq.sh/rollout-started-at": "2023-11-14T22:13:20Z",
            })
        );
        assert_eq!(patch["spec"]["configMaps"][0]["id"], json!("cm"));
        assert_eq!(patch["spec"]["deployments"], Value::Null);
        assert_eq!(patch["spec"].get("hubId"), None);
    }
}
