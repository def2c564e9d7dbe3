//! Label and annotation keys written on managed objects and nodes.

use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Name of the node that manages an object.
pub const NODE: &str = "lynq.sh/node";
/// Namespace of the node that manages an object.
pub const NODE_NAMESPACE: &str = "lynq.sh/node-namespace";
/// Set to `"true"` on objects released by their node.
pub const ORPHANED: &str = "lynq.sh/orphaned";
/// Hub a node was produced from.
pub const HUB: &str = "lynq.sh/hub";

pub const ORPHANED_AT: &str = "lynq.sh/orphaned-at";
pub const ORPHANED_REASON: &str = "lynq.sh/orphaned-reason";
pub const CREATED_ONCE: &str = "lynq.sh/created-once";
pub const DELETION_POLICY: &str = "lynq.sh/deletion-policy";

pub const TEMPLATE_GENERATION: &str = "lynq.sh/template-generation";
pub const ROLLOUT_STARTED_AT: &str = "lynq.sh/rollout-started-at";

pub const ACTIVATE: &str = "lynq.sh/activate";
pub const HOST_OR_URL: &str = "lynq.sh/hostOrUrl";
pub const EXTRA: &str = "lynq.sh/extra";

/// Identifies the node an object is tracked by.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tracking {
    pub name: String,
    pub namespace: String,
}

// === impl Tracking ===

impl Tracking {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn labels(&self) -> Map {
        let mut labels = Map::new();
        labels.insert(NODE.to_string(), self.name.clone());
        labels.insert(NODE_NAMESPACE.to_string(), self.namespace.clone());
        labels
    }

    /// True when `meta` carries this node's tracking labels.
    pub fn is_tracking(&self, meta: &ObjectMeta) -> bool {
        label(meta, NODE) == Some(self.name.as_str())
            && label(meta, NODE_NAMESPACE) == Some(self.namespace.as_str())
    }

    /// True when `meta` is tracked by this node, either through labels or a
    /// controller owner reference to the node's uid.
    pub fn is_managing(&self, meta: &ObjectMeta, node_uid: Option<&str>) -> bool {
        if self.is_tracking(meta) {
            return true;
        }
        let Some(uid) = node_uid else {
            return false;
        };
        meta.owner_references
            .iter()
            .flatten()
            .any(|owner| owner.uid == uid)
    }
}

pub fn label<'m>(meta: &'m ObjectMeta, key: &str) -> Option<&'m str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}

pub fn annotation<'m>(meta: &'m ObjectMeta, key: &str) -> Option<&'m str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

pub fn is_orphaned(meta: &ObjectMeta) -> bool {
    label(meta, ORPHANED) == Some("true")
}

pub fn is_created_once(meta: &ObjectMeta) -> bool {
    annotation(meta, CREATED_ONCE) == Some("true")
}

/// True when `meta` has a controller owner reference to anything other than
/// `uid`.
pub fn has_foreign_controller(meta: &ObjectMeta, uid: Option<&str>) -> bool {
    meta.owner_references.iter().flatten().any(|owner| {
        owner.controller == Some(true) && Some(owner.uid.as_str()) != uid
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use maplit::btreemap;

    fn meta(labels: Map) -> ObjectMeta {
        ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn owner(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "operator.lynq.sh/v1".to_string(),
            kind: "LynqNode".to_string(),
            name: "acme-web".to_string(),
            uid: uid.to_string(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn tracking_labels() {
        let tracking = Tracking::new("acme-web", "tenants");
        let m = meta(tracking.labels());
        assert!(tracking.is_tracking(&m));
        assert!(!Tracking::new("acme-web", "other").is_tracking(&m));
        assert!(!tracking.is_tracking(&ObjectMeta::default()));
    }

    #[test]
    fn managed_through_owner_reference() {
        let tracking = Tracking::new("acme-web", "tenants");
        let m = ObjectMeta {
            owner_references: Some(vec![owner("uid-1", true)]),
            ..Default::default()
        };
        assert!(tracking.is_managing(&m, Some("uid-1")));
        assert!(!tracking.is_managing(&m, Some("uid-2")));
        assert!(!tracking.is_managing(&m, None));
        assert!(has_foreign_controller(&m, Some("uid-2")));
        assert!(!has_foreign_controller(&m, Some("uid-1")));
    }

    #[test]
    fn orphan_markers() {
        assert!(is_orphaned(&meta(btreemap! {
            ORPHANED.to_string() => "true".to_string(),
        })));
        assert!(!is_orphaned(&meta(btreemap! {
            ORPHANED.to_string() => "false".to_string(),
        })));
    }
}
