//! Releasing resources a node no longer declares.
//!
//! The fate of a released object is read from the `deletion-policy`
//! annotation written on the object itself, so it is still known after the
//! declaring entry has been removed from the form.

use crate::{
    cluster::{Cluster, ClusterError, ObjectRef},
    desired::NodeRef,
};
use chrono::{DateTime, SecondsFormat, Utc};
use lynq_controller_core::AppliedResource;
use lynq_controller_k8s_api::{labels, DeletionPolicy, ObjectMeta};
use serde_json::{json, Map, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OrphanReason {
    RemovedFromTemplate,
    LynqNodeDeleted,
}

/// What happened to a released object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Deleted,
    /// Kept, with the orphan markers set.
    Retained,
    /// Already gone, or no longer tracked by this node.
    Untracked,
}

// === impl OrphanReason ===

impl OrphanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RemovedFromTemplate => "RemovedFromTemplate",
            Self::LynqNodeDeleted => "LynqNodeDeleted",
        }
    }
}

pub fn record_target(record: &AppliedResource) -> ObjectRef {
    ObjectRef::new(None, &record.kind, record.namespace(), &record.name)
}

/// Deletes or retains the object behind `record` according to its own
/// deletion policy.
pub async fn release<C: Cluster + ?Sized>(
    cluster: &C,
    node: &NodeRef,
    record: &AppliedResource,
    reason: OrphanReason,
    now: DateTime<Utc>,
) -> Result<Disposition, ClusterError> {
    let target = record_target(record);
    let Some(live) = cluster.get(&target).await? else {
        return Ok(Disposition::Untracked);
    };
    let meta = &live.metadata;
    if labels::is_orphaned(meta) || !node.tracking().is_managing(meta, node.uid.as_deref()) {
        tracing::debug!(%target, "Object is not managed by this node");
        return Ok(Disposition::Untracked);
    }

    let policy = labels::annotation(meta, labels::DELETION_POLICY)
        .and_then(|p| p.parse::<DeletionPolicy>().ok())
        .unwrap_or_default();
    match policy {
        DeletionPolicy::Delete => {
            cluster.delete(&target).await?;
            tracing::info!(%target, reason = reason.as_str(), "Deleted resource");
            Ok(Disposition::Deleted)
        }
        DeletionPolicy::Retain => {
            let patch = orphan_patch(meta, node, reason, now);
            cluster.patch_metadata(&target, &patch).await?;
            tracing::info!(%target, reason = reason.as_str(), "Retained orphaned resource");
            Ok(Disposition::Retained)
        }
    }
}

/// Marks an object orphaned, dropping tracking labels and any owner
/// reference to the node.
fn orphan_patch(
    meta: &ObjectMeta,
    node: &NodeRef,
    reason: OrphanReason,
    now: DateTime<Utc>,
) -> Value {
    let mut metadata = Map::new();
    metadata.insert(
        "labels".to_string(),
        json!({
            (labels::ORPHANED): "true",
            (labels::NODE): null,
            (labels::NODE_NAMESPACE): null,
        }),
    );
    metadata.insert(
        "annotations".to_string(),
        json!({
            (labels::ORPHANED_AT): now.to_rfc3339_opts(SecondsFormat::Secs, true),
            (labels::ORPHANED_REASON): reason.as_str(),
        }),
    );
    if let (Some(owners), Some(uid)) = (meta.owner_references.as_ref(), node.uid.as_deref()) {
        if owners.iter().any(|o| o.uid == uid) {
            let kept = owners.iter().filter(|o| o.uid != uid).collect::<Vec<_>>();
            metadata.insert("ownerReferences".to_string(), json!(kept));
        }
    }
    json!({ "metadata": metadata })
}

/// Puts an object under the node's tracking: orphan markers are removed and
/// the tracking labels and deletion policy are set.
pub(crate) fn adopt_patch(
    meta: &ObjectMeta,
    node: &NodeRef,
    policy: DeletionPolicy,
    owned: bool,
) -> Value {
    let tracking = node.tracking();
    let mut metadata = Map::new();
    metadata.insert(
        "labels".to_string(),
        json!({
            (labels::ORPHANED): null,
            (labels::NODE): tracking.name,
            (labels::NODE_NAMESPACE): tracking.namespace,
        }),
    );
    metadata.insert(
        "annotations".to_string(),
        json!({
            (labels::ORPHANED_AT): null,
            (labels::ORPHANED_REASON): null,
            (labels::DELETION_POLICY): policy.as_str(),
        }),
    );
    if let (true, Some(owner)) = (owned, node.owner_reference()) {
        if !labels::has_foreign_controller(meta, node.uid.as_deref()) {
            let mut owners = meta.owner_references.clone().unwrap_or_default();
            owners.retain(|o| o.uid != owner.uid);
            owners.push(owner.clone());
            metadata.insert("ownerReferences".to_string(), json!(owners));
        }
    }
    json!({ "metadata": metadata })
}

/// Releases every record, most recently applied first.
pub async fn release_all<C: Cluster + ?Sized>(
    cluster: &C,
    node: &NodeRef,
    records: &[AppliedResource],
    reason: OrphanReason,
    now: DateTime<Utc>,
) -> Vec<(AppliedResource, Result<Disposition, ClusterError>)> {
    let mut results = Vec::with_capacity(records.len());
    for record in records.iter().rev() {
        let result = release(cluster, node, record, reason, now).await;
        if let Err(error) = &result {
            tracing::warn!(%record, %error, "Failed to release resource");
        }
        results.push((record.clone(), result));
    }
    results
}
