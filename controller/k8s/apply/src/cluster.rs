//! The controller's view of the cluster.
//!
//! The pipeline only needs a handful of operations on arbitrary kinds, so it
//! works against the [`Cluster`] trait. [`KubeCluster`] implements it with a
//! [`kube::Client`], resolving kinds through API discovery.

use ahash::AHashMap as HashMap;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    core::{gvk::GroupVersion, ApiResource},
    discovery::{self, ApiCapabilities, Discovery},
};
use lynq_controller_k8s_api::PatchStrategy;
use parking_lot::RwLock;
use serde_json::Value;
use std::{fmt, sync::Arc};

/// Names a cluster object. Objects recorded in status carry no API version;
/// those are resolved by kind alone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub api_version: Option<String>,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("no API resource for {kind} ({api_version:?})")]
    UnknownKind {
        api_version: Option<String>,
        kind: String,
    },

    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    #[error("invalid object: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    async fn scope(&self, api_version: Option<&str>, kind: &str) -> Result<Scope, ClusterError>;

    async fn get(&self, target: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError>;

    /// Writes `desired` with the given strategy. `live` is the current object,
    /// if any.
    async fn write(
        &self,
        target: &ObjectRef,
        desired: &DynamicObject,
        strategy: PatchStrategy,
        live: Option<&DynamicObject>,
    ) -> Result<DynamicObject, ClusterError>;

    /// Applies a JSON merge patch to an object's metadata, returning the
    /// patched object.
    async fn patch_metadata(
        &self,
        target: &ObjectRef,
        patch: &Value,
    ) -> Result<DynamicObject, ClusterError>;

    /// Deletes an object. Deleting an object that does not exist succeeds.
    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError>;
}

pub struct KubeCluster {
    client: kube::Client,
    field_manager: String,
    resources: RwLock<HashMap<(Option<String>, String), (ApiResource, ApiCapabilities)>>,
}

/// API groups that accept strategic merge patches.
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "scheduling.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
];

// === impl ObjectRef ===

impl ObjectRef {
    pub fn new(
        api_version: Option<&str>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.map(Into::into),
            kind: kind.into(),
            namespace: namespace.map(Into::into),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

// === impl ClusterError ===

impl ClusterError {
    /// Errors that are expected to clear on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Rejected { code, .. } => *code == 409 || *code == 429 || *code >= 500,
            Self::UnknownKind { .. } | Self::Invalid(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected { code: 404, .. })
    }
}

impl From<kube::Error> for ClusterError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => Self::Rejected {
                code: response.code,
                message: response.message,
            },
            kube::Error::SerdeError(error) => Self::Invalid(error),
            error => Self::Unavailable(error.to_string()),
        }
    }
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: kube::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            resources: Default::default(),
        }
    }

    async fn resolve(
        &self,
        api_version: Option<&str>,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let key = (api_version.map(str::to_string), kind.to_string());
        if let Some(found) = self.resources.read().get(&key) {
            return Ok(found.clone());
        }

        let found = match api_version {
            Some(api_version) => {
                let gvk = api_version
                    .parse::<GroupVersion>()
                    .map_err(|_| ClusterError::UnknownKind {
                        api_version: Some(api_version.to_string()),
                        kind: kind.to_string(),
                    })?
                    .with_kind(kind);
                match discovery::pinned_kind(&self.client, &gvk).await {
                    Ok(found) => found,
                    Err(kube::Error::Api(response)) if response.code == 404 => {
                        return Err(ClusterError::UnknownKind {
                            api_version: Some(api_version.to_string()),
                            kind: kind.to_string(),
                        })
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            None => self.discover_kind(kind).await?,
        };

        self.resources.write().insert(key, found.clone());
        Ok(found)
    }

    /// Finds the preferred resource for a bare kind, favoring the core group.
    async fn discover_kind(
        &self,
        kind: &str,
    ) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut candidates = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .filter(|(ar, _)| ar.kind == kind)
            .collect::<Vec<_>>();
        candidates.sort_by_key(|(ar, _)| !ar.group.is_empty());
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::UnknownKind {
                api_version: None,
                kind: kind.to_string(),
            })
    }

    async fn api(&self, target: &ObjectRef) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (ar, caps) = self.resolve(target.api_version.as_deref(), &target.kind).await?;
        let api = match (caps.scope, target.namespace.as_deref()) {
            (discovery::Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &ar)
            }
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn scope(&self, api_version: Option<&str>, kind: &str) -> Result<Scope, ClusterError> {
        let (_, caps) = self.resolve(api_version, kind).await?;
        Ok(match caps.scope {
            discovery::Scope::Namespaced => Scope::Namespaced,
            discovery::Scope::Cluster => Scope::Cluster,
        })
    }

    async fn get(&self, target: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError> {
        let (api, _) = self.api(target).await?;
        Ok(api.get_opt(&target.name).await?)
    }

    async fn write(
        &self,
        target: &ObjectRef,
        desired: &DynamicObject,
        strategy: PatchStrategy,
        live: Option<&DynamicObject>,
    ) -> Result<DynamicObject, ClusterError> {
        let (api, ar) = self.api(target).await?;
        let name = &target.name;
        let written = match (strategy, live) {
            (PatchStrategy::Apply, _) => {
                let params = PatchParams::apply(&self.field_manager).force();
                api.patch(name, &params, &Patch::Apply(desired)).await?
            }
            (PatchStrategy::Merge | PatchStrategy::Replace, None) => {
                api.create(&self.post_params(), desired).await?
            }
            (PatchStrategy::Merge, Some(_)) => {
                if BUILTIN_GROUPS.contains(&ar.group.as_str()) {
                    api.patch(name, &self.patch_params(), &Patch::Strategic(desired))
                        .await?
                } else {
                    api.patch(name, &self.patch_params(), &Patch::Merge(desired))
                        .await?
                }
            }
            (PatchStrategy::Replace, Some(live)) => {
                let mut desired = desired.clone();
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                api.replace(name, &self.post_params(), &desired).await?
            }
        };
        Ok(written)
    }

    async fn patch_metadata(
        &self,
        target: &ObjectRef,
        patch: &Value,
    ) -> Result<DynamicObject, ClusterError> {
        let (api, _) = self.api(target).await?;
        let patched = api
            .patch(&target.name, &self.patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(patched)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        let (api, _) = self.api(target).await?;
        match api.delete(&target.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl<C: Cluster + ?Sized> Cluster for Arc<C> {
    async fn scope(&self, api_version: Option<&str>, kind: &str) -> Result<Scope, ClusterError> {
        (**self).scope(api_version, kind).await
    }

    async fn get(&self, target: &ObjectRef) -> Result<Option<DynamicObject>, ClusterError> {
        (**self).get(target).await
    }

    async fn write(
        &self,
        target: &ObjectRef,
        desired: &DynamicObject,
        strategy: PatchStrategy,
        live: Option<&DynamicObject>,
    ) -> Result<DynamicObject, ClusterError> {
        (**self).write(target, desired, strategy, live).await
    }

    async fn patch_metadata(
        &self,
        target: &ObjectRef,
        patch: &Value,
    ) -> Result<DynamicObject, ClusterError> {
        (**self).patch_metadata(target, patch).await
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        (**self).delete(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors() {
        for (code, transient) in [
            (400, false),
            (404, false),
            (409, true),
            (422, false),
            (429, true),
            (500, true),
            (503, true),
        ] {
            let error = ClusterError::from(api_error(code));
            assert_eq!(error.is_transient(), transient, "{code}");
        }
        assert!(ClusterError::from(api_error(404)).is_not_found());
        assert!(!ClusterError::UnknownKind {
            api_version: None,
            kind: "Widget".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn displays_object_refs() {
        let namespaced = ObjectRef::new(Some("v1"), "ConfigMap", Some("tenants"), "acme");
        assert_eq!(namespaced.to_string(), "ConfigMap/tenants/acme");
        let cluster = ObjectRef::new(None, "Namespace", None, "acme");
        assert_eq!(cluster.to_string(), "Namespace/acme");
    }
}
