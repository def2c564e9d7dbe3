use crate::cluster::{ObjectRef, Scope};
use kube::{Resource, ResourceExt};
use lynq_controller_core::{Render, RenderError, Variables};
use lynq_controller_k8s_api::{
    labels::{self, Tracking},
    CreationPolicy, Declared, DeletionPolicy, LynqNode, OwnerReference, TResource,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The node a pass runs on behalf of.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRef {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub generation: Option<i64>,
    owner: Option<OwnerReference>,
}

/// A resource's templates, rendered.
#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    body: Value,
}

// === impl NodeRef ===

impl NodeRef {
    pub fn new(node: &LynqNode) -> Self {
        Self {
            name: node.name_any(),
            namespace: node.namespace().unwrap_or_default(),
            uid: node.uid(),
            generation: node.metadata.generation,
            owner: node.controller_owner_ref(&()),
        }
    }

    pub fn tracking(&self) -> Tracking {
        Tracking::new(&self.name, &self.namespace)
    }

    pub fn owner_reference(&self) -> Option<&OwnerReference> {
        self.owner.as_ref()
    }
}

// === impl Rendered ===

impl Rendered {
    /// Renders the name, namespace, labels, annotations and body of a
    /// declared resource.
    pub fn render<R: Render + ?Sized>(
        renderer: &R,
        declared: &Declared<'_>,
        vars: &Variables,
    ) -> Result<Self, RenderError> {
        let resource = declared.resource;
        let name = renderer.render(&resource.name_template, vars)?;
        if name.is_empty() {
            return Err(RenderError::new(
                &resource.name_template,
                "name renders to an empty string",
            ));
        }
        let namespace = resource
            .namespace_template()
            .map(|ns| renderer.render(ns, vars))
            .transpose()?
            .filter(|ns| !ns.is_empty());

        let labels = render_map(renderer, &resource.labels_template, vars)?;
        let annotations = render_map(renderer, &resource.annotations_template, vars)?;

        let body = renderer.render_value(&declared.body(), vars)?;
        let api_version = body
            .get("apiVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RenderError::new(&resource.id, "manifest has no apiVersion"))?
            .to_string();
        let kind = body
            .get("kind")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RenderError::new(&resource.id, "manifest has no kind"))?
            .to_string();

        Ok(Self {
            api_version,
            kind,
            name,
            namespace,
            labels,
            annotations,
            body,
        })
    }

    /// Builds the object to write: identity, tracking labels, policy
    /// annotations and, where garbage collection applies, an owner reference
    /// to the node.
    pub fn assemble(self, scope: Scope, node: &NodeRef, resource: &TResource) -> (ObjectRef, Value) {
        let namespace = match scope {
            Scope::Namespaced => Some(self.namespace.unwrap_or_else(|| node.namespace.clone())),
            Scope::Cluster => None,
        };

        let mut body = self.body;
        if !body.is_object() {
            body = Value::Object(Map::new());
        }
        let metadata = body
            .as_object_mut()
            .map(|obj| obj.entry("metadata").or_insert_with(|| Value::Object(Map::new())));
        let mut meta = match metadata {
            Some(Value::Object(meta)) => std::mem::take(meta),
            _ => Map::new(),
        };

        meta.insert("name".to_string(), Value::from(self.name.clone()));
        match &namespace {
            Some(ns) => meta.insert("namespace".to_string(), Value::from(ns.clone())),
            None => meta.remove("namespace"),
        };

        let mut labels = string_map(meta.get("labels"));
        labels.extend(self.labels);
        labels.extend(node.tracking().labels());
        labels.remove(labels::ORPHANED);
        meta.insert("labels".to_string(), to_value(labels));

        let mut annotations = string_map(meta.get("annotations"));
        annotations.extend(self.annotations);
        annotations.remove(labels::ORPHANED_AT);
        annotations.remove(labels::ORPHANED_REASON);
        annotations.insert(
            labels::DELETION_POLICY.to_string(),
            resource.deletion_policy.to_string(),
        );
        if resource.creation_policy == CreationPolicy::Once {
            annotations.insert(labels::CREATED_ONCE.to_string(), "true".to_string());
        }
        meta.insert("annotations".to_string(), to_value(annotations));

        let owned = resource.deletion_policy == DeletionPolicy::Delete
            && namespace.as_deref() == Some(node.namespace.as_str());
        if let (true, Some(owner)) = (owned, node.owner_reference()) {
            let mut owners = meta
                .get("ownerReferences")
                .and_then(|v| serde_json::from_value::<Vec<OwnerReference>>(v.clone()).ok())
                .unwrap_or_default();
            owners.retain(|o| o.uid != owner.uid);
            owners.push(owner.clone());
            if let Ok(owners) = serde_json::to_value(owners) {
                meta.insert("ownerReferences".to_string(), owners);
            }
        }

        body["metadata"] = Value::Object(meta);
        let target = ObjectRef::new(
            Some(&self.api_version),
            self.kind,
            namespace.as_deref(),
            self.name,
        );
        (target, body)
    }
}

fn render_map<R: Render + ?Sized>(
    renderer: &R,
    templates: &BTreeMap<String, String>,
    vars: &Variables,
) -> Result<BTreeMap<String, String>, RenderError> {
    templates
        .iter()
        .map(|(k, v)| Ok((k.clone(), renderer.render(v, vars)?)))
        .collect()
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn to_value(map: BTreeMap<String, String>) -> Value {
    Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
}

/// Drops our controller owner reference when the live object is already
/// controlled by something else; only one controller reference is allowed.
pub(crate) fn yield_controller(desired: &mut Value, node: &NodeRef, live: &kube::api::ObjectMeta) {
    if !labels::has_foreign_controller(live, node.uid.as_deref()) {
        return;
    }
    if let Some(meta) = desired.get_mut("metadata").and_then(Value::as_object_mut) {
        let owners = meta
            .get("ownerReferences")
            .and_then(|v| serde_json::from_value::<Vec<OwnerReference>>(v.clone()).ok())
            .unwrap_or_default()
            .into_iter()
            .filter(|o| Some(o.uid.as_str()) != node.uid.as_deref())
            .collect::<Vec<_>>();
        if owners.is_empty() {
            meta.remove("ownerReferences");
        } else if let Ok(owners) = serde_json::to_value(owners) {
            meta.insert("ownerReferences".to_string(), owners);
        }
    }
}

#[cfg(test)]
pub(crate) fn node_ref(name: &str, namespace: &str, uid: &str, generation: i64) -> NodeRef {
    NodeRef {
        name: name.to_string(),
        namespace: namespace.to_string(),
        uid: Some(uid.to_string()),
        generation: Some(generation),
        owner: Some(OwnerReference {
            api_version: LynqNode::api_version(&()).to_string(),
            kind: LynqNode::kind(&()).to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }),
    }
}
