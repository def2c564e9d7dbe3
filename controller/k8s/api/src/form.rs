use crate::{condition::Condition, resources::Resources};
use kube::CustomResource;
use lynq_controller_core::RolloutState;
use serde::{Deserialize, Serialize};

/// A set of templated resources instantiated once per hub row.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "operator.lynq.sh",
    version = "v1",
    kind = "LynqForm",
    status = "LynqFormStatus",
    shortname = "lf",
    schema = "disabled",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LynqFormSpec {
    pub hub_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutConfig>,
    #[serde(flatten)]
    pub resources: Resources,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutConfig {
    #[serde(default)]
    pub max_skew: u32,
    #[serde(default = "default_progress_deadline_seconds")]
    pub progress_deadline_seconds: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LynqFormStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub total_nodes: u32,
    #[serde(default)]
    pub ready_nodes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_progress_deadline_seconds() -> u32 {
    RolloutConfig::DEFAULT_PROGRESS_DEADLINE_SECONDS
}

// === impl RolloutConfig ===

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_skew: 0,
            progress_deadline_seconds: Self::DEFAULT_PROGRESS_DEADLINE_SECONDS,
        }
    }
}

impl RolloutConfig {
    pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: u32 = 600;
    pub const MIN_PROGRESS_DEADLINE_SECONDS: u32 = 60;
    pub const MAX_PROGRESS_DEADLINE_SECONDS: u32 = 3600;

    pub fn progress_deadline(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.progress_deadline_seconds))
    }
}

// === impl LynqFormSpec ===

impl LynqFormSpec {
    pub fn rollout(&self) -> RolloutConfig {
        self.rollout.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_grouped_resources() {
        let form = serde_json::from_value::<LynqForm>(json!({
            "apiVersion": "operator.lynq.sh/v1",
            "kind": "LynqForm",
            "metadata": {"name": "web", "namespace": "tenants", "generation": 3},
            "spec": {
                "hubId": "customers",
                "rollout": {"maxSkew": 2},
                "deployments": [{
                    "id": "app",
                    "nameTemplate": "{{ uid }}-app",
                    "dependIds": ["cm"],
                    "spec": {"spec": {"replicas": 1}},
                }],
                "configMaps": [{"id": "cm", "nameTemplate": "{{ uid }}-cm"}],
            },
        }))
        .unwrap();

        assert_eq!(form.spec.hub_id, "customers");
        assert_eq!(
            form.spec.rollout(),
            RolloutConfig {
                max_skew: 2,
                progress_deadline_seconds: 600,
            }
        );
        let ids = form
            .spec
            .resources
            .iter()
            .map(|d| d.resource.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["app", "cm"]);
        assert_eq!(
            form.spec.resources.graph().unwrap().topological_order().unwrap(),
            vec!["cm", "app"]
        );
    }

    #[test]
    fn rollout_defaults_when_absent() {
        let spec = serde_json::from_value::<LynqFormSpec>(json!({"hubId": "h"})).unwrap();
        assert_eq!(spec.rollout(), RolloutConfig::default());
        assert!(spec.resources.is_empty());
    }
}
