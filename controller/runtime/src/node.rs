//! Reconciles each `LynqNode` through the application pipeline.

use crate::{
    apply::{KubeCluster, NodeRef, Notice, Pipeline, Severity},
    backoff::Backoff,
    core::{Engine, Variables},
    k8s::{LynqNode, LynqNodeStatus, NODE_FINALIZER},
    lease::Leadership,
    status::{self, events::action, EventType, NodeMetrics, Publish, RetryPolicy},
    Error,
};
use chrono::Utc;
use futures::prelude::*;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{self, finalizer, Event as Finalizer},
        watcher,
    },
    Resource, ResourceExt,
};
use std::sync::Arc;
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};

pub(crate) struct Context {
    pub(crate) client: kube::Client,
    pub(crate) pipeline: Pipeline<Arc<KubeCluster>, Engine>,
    pub(crate) events: Arc<dyn Publish>,
    pub(crate) metrics: NodeMetrics,
    pub(crate) leadership: Leadership,
    pub(crate) field_manager: String,
    /// Periodic resync of settled nodes.
    pub(crate) requeue: time::Duration,
    /// Resync while resources wait for readiness.
    pub(crate) readiness_poll: time::Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) backoff: Backoff,
}

type ReconcileError = finalizer::Error<Error>;

pub(crate) async fn run(ctx: Arc<Context>, concurrency: u16) {
    let nodes = Api::<LynqNode>::all(ctx.client.clone());
    Controller::new(nodes, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(concurrency))
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((node, action)) => debug!(%node, ?action, "Reconciled"),
                Err(error) => debug!(%error, "Reconcile failed"),
            }
        })
        .await;
}

async fn reconcile(node: Arc<LynqNode>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if !ctx.leadership.is_leader() {
        return Ok(Action::requeue(ctx.requeue));
    }

    let namespace = node.namespace().unwrap_or_default();
    let name = node.name_any();
    let api = Api::<LynqNode>::namespaced(ctx.client.clone(), &namespace);
    let start = time::Instant::now();

    let context = ctx.clone();
    let res = finalizer(&api, NODE_FINALIZER, node, move |event| async move {
        match event {
            Finalizer::Apply(node) => apply(node, &context).await,
            Finalizer::Cleanup(node) => cleanup(node, &context).await,
        }
    })
    .instrument(info_span!("lynqnode", %namespace, %name))
    .await;

    let result = if res.is_ok() { "success" } else { "error" };
    ctx.metrics.reconciled(result, start.elapsed());
    if res.is_ok() {
        ctx.backoff.reset(&namespace, &name);
    }
    res
}

fn error_policy(node: Arc<LynqNode>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let namespace = node.namespace().unwrap_or_default();
    let name = node.name_any();
    let delay = ctx.backoff.failed(&namespace, &name);
    warn!(%namespace, %name, %error, ?delay, "Failed to reconcile LynqNode");
    Action::requeue(delay)
}

async fn apply(node: Arc<LynqNode>, ctx: &Context) -> Result<Action, Error> {
    let node_ref = NodeRef::new(&node);
    let vars = Variables::from(node.variables());
    let previous = node.status.as_ref();
    let now = Utc::now();

    let report = ctx
        .pipeline
        .run(&node_ref, &node.spec.resources, &vars, previous, now)
        .await;

    for attempt in &report.attempts {
        ctx.metrics.apply_attempt(&attempt.kind, attempt.success);
    }
    for conflict in &report.conflicts {
        ctx.metrics.conflict(&conflict.kind, conflict.policy);
    }
    publish(ctx, &node, &report.notices, action::RECONCILE).await;

    let status = report.to_status(&node_ref, previous, now);
    ctx.metrics.observe(&node_ref.namespace, &node_ref.name, &status);
    if previous != Some(&status) {
        write_status(ctx, &node, &status).await?;
    }

    if report.is_transient_failure() {
        return Err(Error::Transient(report.transient));
    }
    if report.is_waiting() {
        debug!(waiting = report.summary.waiting, "Resources are not ready yet");
        return Ok(Action::requeue(ctx.readiness_poll));
    }
    Ok(Action::requeue(ctx.requeue))
}

/// Releases everything the node applied. The finalizer stays until every
/// record has been deleted or retained.
async fn cleanup(node: Arc<LynqNode>, ctx: &Context) -> Result<Action, Error> {
    let node_ref = NodeRef::new(&node);
    let applied = node.applied_resources();
    let cleanup = ctx.pipeline.cleanup(&node_ref, applied, Utc::now()).await;
    publish(ctx, &node, &cleanup.notices, action::CLEANUP).await;

    if !cleanup.remaining.is_empty() {
        if cleanup.remaining != applied {
            let mut status = node.status.clone().unwrap_or_default();
            status.applied_resources = cleanup.remaining.clone();
            write_status(ctx, &node, &status).await?;
        }
        info!(
            remaining = cleanup.remaining.len(),
            errors = ?cleanup.transient,
            "Waiting to release resources"
        );
        return Err(Error::Cleanup(cleanup.remaining.len()));
    }

    ctx.metrics.remove(&node_ref.namespace, &node_ref.name);
    info!(released = applied.len(), "Released all resources");
    Ok(Action::await_change())
}

async fn write_status(ctx: &Context, node: &LynqNode, status: &LynqNodeStatus) -> Result<(), Error> {
    let namespace = node.namespace().unwrap_or_default();
    let api = Api::<LynqNode>::namespaced(ctx.client.clone(), &namespace);
    match status::patch_status(
        &api,
        &node.name_any(),
        node.resource_version().as_deref(),
        status,
        &ctx.field_manager,
        ctx.retry,
    )
    .await
    {
        Ok(_) => Ok(()),
        Err(error) if status::is_conflict(&error) => {
            warn!(%error, "Status write kept conflicting; leaving it to the next pass");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

async fn publish(ctx: &Context, node: &LynqNode, notices: &[Notice], action: &str) {
    let target = node.object_ref(&());
    for notice in notices {
        ctx.events
            .publish(
                &target,
                event_type(notice.severity),
                notice.reason,
                action,
                notice.message.clone(),
            )
            .await;
    }
}

fn event_type(severity: Severity) -> EventType {
    match severity {
        Severity::Normal => EventType::Normal,
        Severity::Warning => EventType::Warning,
    }
}
