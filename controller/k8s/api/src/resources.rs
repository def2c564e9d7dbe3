//! Templated resource declarations shared by forms and nodes.

use lynq_controller_core::{DependencyGraph, GraphError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, str::FromStr};

/// One templated resource.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TResource {
    pub id: String,
    pub name_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_ids: Vec<String>,
    #[serde(default)]
    pub creation_policy: CreationPolicy,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub patch_strategy: PatchStrategy,
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default = "default_true")]
    pub skip_on_dependency_failure: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels_template: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations_template: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Value,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum CreationPolicy {
    #[default]
    WhenNeeded,
    Once,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ConflictPolicy {
    #[default]
    Stuck,
    Force,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStrategy {
    #[default]
    Apply,
    Merge,
    Replace,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown deletion policy {0:?}")]
pub struct InvalidDeletionPolicy(String);

/// A form's resources, grouped by kind.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_sets: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daemon_sets: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_volume_claims: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_disruption_budgets: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_policies: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub horizontal_pod_autoscalers: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<TResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<TResource>,
}

/// A resource along with the type its list implies.
#[derive(Copy, Clone, Debug)]
pub struct Declared<'r> {
    pub resource: &'r TResource,
    implied: Option<(&'static str, &'static str)>,
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u32 {
    TResource::DEFAULT_TIMEOUT_SECONDS
}

// === impl TResource ===

impl TResource {
    pub const DEFAULT_TIMEOUT_SECONDS: u32 = 300;
    pub const MAX_TIMEOUT_SECONDS: u32 = 3600;

    pub fn new(id: impl Into<String>, name_template: impl Into<String>, spec: Value) -> Self {
        Self {
            id: id.into(),
            name_template: name_template.into(),
            target_namespace: None,
            depend_ids: Vec::new(),
            creation_policy: CreationPolicy::default(),
            deletion_policy: DeletionPolicy::default(),
            conflict_policy: ConflictPolicy::default(),
            patch_strategy: PatchStrategy::default(),
            wait_for_ready: true,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
            skip_on_dependency_failure: true,
            ignore_fields: Vec::new(),
            labels_template: BTreeMap::new(),
            annotations_template: BTreeMap::new(),
            spec,
        }
    }

    /// The `targetNamespace` template, if one is set and non-empty.
    pub fn namespace_template(&self) -> Option<&str> {
        self.target_namespace.as_deref().filter(|ns| !ns.is_empty())
    }
}

// === impl DeletionPolicy ===

impl DeletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delete => "Delete",
            Self::Retain => "Retain",
        }
    }
}

impl FromStr for DeletionPolicy {
    type Err = InvalidDeletionPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Delete" => Ok(Self::Delete),
            "Retain" => Ok(Self::Retain),
            other => Err(InvalidDeletionPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ConflictPolicy ===

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stuck => "Stuck",
            Self::Force => "Force",
        }
    }
}

// === impl PatchStrategy ===

impl PatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

// === impl Resources ===

impl Resources {
    /// Wire names of every list, in declaration order.
    pub const KEYS: [&'static str; 16] = [
        "serviceAccounts",
        "deployments",
        "statefulSets",
        "daemonSets",
        "services",
        "ingresses",
        "configMaps",
        "secrets",
        "persistentVolumeClaims",
        "jobs",
        "cronJobs",
        "podDisruptionBudgets",
        "networkPolicies",
        "horizontalPodAutoscalers",
        "namespaces",
        "manifests",
    ];

    fn lists(&self) -> [(&[TResource], Option<(&'static str, &'static str)>); 16] {
        [
            (self.service_accounts.as_slice(), Some(("v1", "ServiceAccount"))),
            (self.deployments.as_slice(), Some(("apps/v1", "Deployment"))),
            (self.stateful_sets.as_slice(), Some(("apps/v1", "StatefulSet"))),
            (self.daemon_sets.as_slice(), Some(("apps/v1", "DaemonSet"))),
            (self.services.as_slice(), Some(("v1", "Service"))),
            (self.ingresses.as_slice(), Some(("networking.k8s.io/v1", "Ingress"))),
            (self.config_maps.as_slice(), Some(("v1", "ConfigMap"))),
            (self.secrets.as_slice(), Some(("v1", "Secret"))),
            (
                self.persistent_volume_claims.as_slice(),
                Some(("v1", "PersistentVolumeClaim")),
            ),
            (self.jobs.as_slice(), Some(("batch/v1", "Job"))),
            (self.cron_jobs.as_slice(), Some(("batch/v1", "CronJob"))),
            (
                self.pod_disruption_budgets.as_slice(),
                Some(("policy/v1", "PodDisruptionBudget")),
            ),
            (
                self.network_policies.as_slice(),
                Some(("networking.k8s.io/v1", "NetworkPolicy")),
            ),
            (
                self.horizontal_pod_autoscalers.as_slice(),
                Some(("autoscaling/v2", "HorizontalPodAutoscaler")),
            ),
            (self.namespaces.as_slice(), Some(("v1", "Namespace"))),
            (self.manifests.as_slice(), None),
        ]
    }

    /// Every resource in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Declared<'_>> + '_ {
        self.lists().into_iter().flat_map(|(list, implied)| {
            list.iter().map(move |resource| Declared { resource, implied })
        })
    }

    pub fn len(&self) -> usize {
        self.lists().iter().map(|(list, _)| list.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Declared<'_>> {
        self.iter().find(|d| d.resource.id == id)
    }

    /// Builds the dependency graph over every declared resource. The graph is
    /// not validated.
    pub fn graph(&self) -> Result<DependencyGraph, GraphError> {
        DependencyGraph::new(
            self.iter()
                .map(|d| (d.resource.id.clone(), d.resource.depend_ids.clone())),
        )
    }

    /// A JSON merge patch that replaces every list with the contents of
    /// `self`, removing lists that are empty here.
    pub fn to_merge_patch(&self) -> Result<serde_json::Map<String, Value>, serde_json::Error> {
        let mut patch = Self::KEYS
            .iter()
            .map(|k| (k.to_string(), Value::Null))
            .collect::<serde_json::Map<_, _>>();
        if let Value::Object(lists) = serde_json::to_value(self)? {
            patch.extend(lists);
        }
        Ok(patch)
    }
}

// === impl Declared ===

impl Declared<'_> {
    pub fn api_version(&self) -> Option<&str> {
        self.resource
            .spec
            .get("apiVersion")
            .and_then(Value::as_str)
            .or(self.implied.map(|(api_version, _)| api_version))
    }

    pub fn kind(&self) -> Option<&str> {
        self.resource
            .spec
            .get("kind")
            .and_then(Value::as_str)
            .or(self.implied.map(|(_, kind)| kind))
    }

    /// The manifest body with `apiVersion` and `kind` filled in.
    pub fn body(&self) -> Value {
        let mut body = match &self.resource.spec {
            Value::Object(map) => Value::Object(map.clone()),
            _ => Value::Object(Default::default()),
        };
        if let (Some(api_version), Some(kind)) = (self.api_version(), self.kind()) {
            body["apiVersion"] = Value::from(api_version);
            body["kind"] = Value::from(kind);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults() {
        let resource = serde_json::from_value::<TResource>(json!({
            "id": "app",
            "nameTemplate": "{{ uid }}-app",
            "spec": {},
        }))
        .unwrap();
        assert_eq!(resource, TResource::new("app", "{{ uid }}-app", json!({})));
        assert!(resource.wait_for_ready);
        assert!(resource.skip_on_dependency_failure);
        assert_eq!(resource.timeout_seconds, 300);
        assert_eq!(resource.patch_strategy, PatchStrategy::Apply);
        assert_eq!(resource.namespace_template(), None);
    }

    #[test]
    fn policies_parse_from_the_wire() {
        let resource = serde_json::from_value::<TResource>(json!({
            "id": "db",
            "nameTemplate": "db",
            "targetNamespace": "",
            "creationPolicy": "Once",
            "deletionPolicy": "Retain",
            "conflictPolicy": "Force",
            "patchStrategy": "replace",
            "waitForReady": false,
            "skipOnDependencyFailure": false,
        }))
        .unwrap();
        assert_eq!(resource.creation_policy, CreationPolicy::Once);
        assert_eq!(resource.deletion_policy, DeletionPolicy::Retain);
        assert_eq!(resource.conflict_policy, ConflictPolicy::Force);
        assert_eq!(resource.patch_strategy, PatchStrategy::Replace);
        assert!(!resource.wait_for_ready);
        assert!(!resource.skip_on_dependency_failure);
        assert_eq!(resource.namespace_template(), None);
        assert_eq!("Retain".parse::<DeletionPolicy>(), Ok(DeletionPolicy::Retain));
        assert!("retain".parse::<DeletionPolicy>().is_err());
    }

    #[test]
    fn declaration_order_and_implied_types() {
        let resources = Resources {
            manifests: vec![TResource::new(
                "cert",
                "cert",
                json!({"apiVersion": "cert-manager.io/v1", "kind": "Certificate"}),
            )],
            config_maps: vec![TResource::new("cm", "cm", json!({"data": {"a": "b"}}))],
            deployments: vec![TResource::new("app", "app", json!({}))],
            ..Default::default()
        };

        let ids = resources
            .iter()
            .map(|d| d.resource.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["app", "cm", "cert"]);

        let cm = resources.get("cm").unwrap();
        assert_eq!(cm.kind(), Some("ConfigMap"));
        assert_eq!(
            cm.body(),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"a": "b"}})
        );

        let cert = resources.get("cert").unwrap();
        assert_eq!(cert.api_version(), Some("cert-manager.io/v1"));
        assert_eq!(cert.kind(), Some("Certificate"));
        assert_eq!(resources.len(), 3);
    }

    #[test]
    fn merge_patch_clears_missing_lists() {
        let resources = Resources {
            secrets: vec![TResource::new("s", "s", json!({}))],
            ..Default::default()
        };
        let patch = resources.to_merge_patch().unwrap();
        assert_eq!(patch.len(), Resources::KEYS.len());
        assert_eq!(patch["deployments"], Value::Null);
        assert_eq!(patch["secrets"][0]["id"], json!("s"));
    }
}
