use crate::{
    condition::{self, Condition},
    labels,
    resources::Resources,
};
use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use lynq_controller_core::{AppliedResource, NodeVariables};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One instantiation of a form for a single hub row.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "operator.lynq.sh",
    version = "v1",
    kind = "LynqNode",
    status = "LynqNodeStatus",
    shortname = "ln",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LynqNodeSpec {
    pub uid: String,
    pub template_ref: String,
    #[serde(flatten)]
    pub resources: Resources,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LynqNodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub desired_resources: u32,
    #[serde(default)]
    pub ready_resources: u32,
    #[serde(default)]
    pub failed_resources: u32,
    #[serde(default)]
    pub skipped_resources: u32,
    #[serde(default)]
    pub conflicted_resources: u32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub skipped_resource_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub failed_resource_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_resources: Vec<AppliedResource>,
    /// When each resource started waiting for readiness.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pending_since: BTreeMap<String, DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// === impl LynqNode ===

impl LynqNode {
    pub const READY: &'static str = "Ready";
    pub const DEGRADED: &'static str = "Degraded";

    /// The variables available to this node's templates.
    ///
    /// A malformed `lynq.sh/extra` annotation is logged and ignored.
    pub fn variables(&self) -> NodeVariables {
        let annotations = self.annotations();
        let extra = match annotations.get(labels::EXTRA) {
            None => BTreeMap::new(),
            Some(raw) => match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw)
            {
                Ok(map) => map
                    .into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect(),
                Err(error) => {
                    tracing::warn!(
                        namespace = ?self.namespace(),
                        name = %self.name_any(),
                        %error,
                        "Ignoring malformed {} annotation",
                        labels::EXTRA,
                    );
                    BTreeMap::new()
                }
            },
        };

        NodeVariables {
            uid: self.spec.uid.clone(),
            template_ref: self.spec.template_ref.clone(),
            hub_id: self.labels().get(labels::HUB).cloned().unwrap_or_default(),
            activate: annotations
                .get(labels::ACTIVATE)
                .map_or(true, |v| v.parse::<bool>().unwrap_or(true)),
            host_or_url: annotations.get(labels::HOST_OR_URL).cloned(),
            extra,
        }
    }

    /// The form generation most recently pushed to this node.
    pub fn template_generation(&self) -> Option<i64> {
        self.annotations()
            .get(labels::TEMPLATE_GENERATION)?
            .parse()
            .ok()
    }

    pub fn rollout_started_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.annotations().get(labels::ROLLOUT_STARTED_AT)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Ready for the node's current spec: the Ready condition is true and
    /// status has caught up with the latest generation.
    pub fn is_ready_for_rollout(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        condition::is_true(&status.conditions, Self::READY)
            && status.observed_generation.is_some()
            && status.observed_generation == self.metadata.generation
    }

    pub fn applied_resources(&self) -> &[AppliedResource] {
        self.status
            .as_ref()
            .map(|s| s.applied_resources.as_slice())
            .unwrap_or_default()
    }
}
