//! Kubernetes events for node and form transitions.
//!
//! Publishing is best effort: a failed publish is logged and never fails a
//! reconcile.

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use lynq_controller_k8s_api::ObjectReference;

#[async_trait::async_trait]
pub trait Publish: Send + Sync {
    async fn publish(
        &self,
        target: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    );
}

pub struct KubeEvents {
    recorder: Recorder,
}

/// Drops every event.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoEvents;

pub mod action {
    pub const RECONCILE: &str = "Reconcile";
    pub const CLEANUP: &str = "Cleanup";
    pub const VALIDATE: &str = "Validate";
    pub const ROLLOUT: &str = "Rollout";
}

// === impl KubeEvents ===

impl KubeEvents {
    pub fn new(client: kube::Client, controller: &str, instance: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: Some(instance.to_string()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl Publish for KubeEvents {
    async fn publish(
        &self,
        target: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, target).await {
            tracing::warn!(
                %error,
                reason,
                name = ?target.name,
                namespace = ?target.namespace,
                "Failed to publish event"
            );
        }
    }
}

#[async_trait::async_trait]
impl Publish for NoEvents {
    async fn publish(&self, _: &ObjectReference, _: EventType, _: &str, _: &str, _: String) {}
}
