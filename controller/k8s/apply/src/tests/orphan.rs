use super::{vars, FakeCluster};
use crate::{
    desired::node_ref,
    orphan::{self, Disposition, OrphanReason},
    pipeline::{reason, Pipeline},
};
use chrono::{DateTime, Utc};
use lynq_controller_core::{AppliedResource, Engine};
use lynq_controller_k8s_api::{labels, DeletionPolicy, Resources, TResource};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn record(name: &str) -> AppliedResource {
    AppliedResource::new("ConfigMap", Some("tenants"), name, "config")
}

fn managed(name: &str, policy: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": "tenants",
            "labels": {
                (labels::NODE): "acme-web",
                (labels::NODE_NAMESPACE): "tenants",
            },
            "annotations": {(labels::DELETION_POLICY): policy},
            "ownerReferences": [{
                "apiVersion": "operator.lynq.sh/v1",
                "kind": "LynqNode",
                "name": "acme-web",
                "uid": "node-uid",
                "controller": true,
            }],
        },
    })
}

#[tokio::test]
async fn policy_is_read_from_the_object() {
    let cluster = FakeCluster::default();
    let node = node_ref("acme-web", "tenants", "node-uid", 1);
    cluster.insert(managed("gone", "Delete"));
    cluster.insert(managed("kept", "Retain"));

    let deleted = orphan::release(
        &cluster,
        &node,
        &record("gone"),
        OrphanReason::RemovedFromTemplate,
        now(),
    )
    .await
    .unwrap();
    assert_eq!(deleted, Disposition::Deleted);
    assert_eq!(cluster.deletes(), ["gone"]);

    let retained = orphan::release(
        &cluster,
        &node,
        &record("kept"),
        OrphanReason::LynqNodeDeleted,
        now(),
    )
    .await
    .unwrap();
    assert_eq!(retained, Disposition::Retained);
    let kept = cluster.object("ConfigMap", Some("tenants"), "kept").unwrap();
    assert_eq!(kept["metadata"]["labels"][labels::ORPHANED], "true");
    assert_eq!(
        kept["metadata"]["annotations"][labels::ORPHANED_REASON],
        "LynqNodeDeleted"
    );
    assert_eq!(kept["metadata"]["ownerReferences"], json!([]));
}

#[tokio::test]
async fn unmanaged_and_missing_objects_are_left_alone() {
    let cluster = FakeCluster::default();
    let node = node_ref("acme-web", "tenants", "node-uid", 1);
    cluster.insert(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": "foreign",
            "namespace": "tenants",
            "labels": {(labels::NODE): "other", (labels::NODE_NAMESPACE): "tenants"},
        },
    }));

    for name in ["foreign", "missing"] {
        let disposition = orphan::release(
            &cluster,
            &node,
            &record(name),
            OrphanReason::RemovedFromTemplate,
            now(),
        )
        .await
        .unwrap();
        assert_eq!(disposition, Disposition::Untracked, "{name}");
    }
    assert!(cluster.deletes().is_empty());
    assert!(cluster.object("ConfigMap", Some("tenants"), "foreign").is_some());
}

#[tokio::test]
async fn cleanup_releases_everything_in_reverse() {
    let pipeline = Pipeline::new(Arc::new(FakeCluster::default()), Engine::new());
    let node = node_ref("acme-web", "tenants", "node-uid", 1);
    let mut kept = TResource::new("kept", "{{ uid }}-kept", json!({}));
    kept.deletion_policy = DeletionPolicy::Retain;
    kept.depend_ids = vec!["base".to_string()];
    let resources = Resources {
        config_maps: vec![TResource::new("base", "{{ uid }}-base", json!({})), kept],
        ..Default::default()
    };
    let report = pipeline.run(&node, &resources, &vars(), None, now()).await;
    assert_eq!(report.applied.len(), 2);

    let cleanup = pipeline.cleanup(&node, &report.applied, now()).await;
    assert!(cleanup.remaining.is_empty());
    assert!(cleanup.transient.is_empty());
    assert_eq!(
        cleanup.notices.iter().map(|n| n.reason).collect::<Vec<_>>(),
        [reason::RESOURCE_ORPHANED, reason::RESOURCE_DELETED]
    );
    assert_eq!(pipeline.cluster().deletes(), ["acme-base"]);
    let kept = pipeline
        .cluster()
        .object("ConfigMap", Some("tenants"), "acme-kept")
        .unwrap();
    assert_eq!(
        kept["metadata"]["annotations"][labels::ORPHANED_REASON],
        "LynqNodeDeleted"
    );
}

#[tokio::test]
async fn cleanup_keeps_records_that_could_not_be_released() {
    let pipeline = Pipeline::new(Arc::new(FakeCluster::default()), Engine::new());
    let node = node_ref("acme-web", "tenants", "node-uid", 1);
    pipeline.cluster().insert(managed("stuck", "Delete"));
    pipeline.cluster().insert(managed("free", "Delete"));
    pipeline.cluster().fail("stuck", 503);

    let cleanup = pipeline
        .cleanup(&node, &[record("stuck"), record("free")], now())
        .await;
    assert_eq!(cleanup.remaining, [record("stuck")]);
    assert_eq!(cleanup.transient.len(), 1);
    assert_eq!(pipeline.cluster().deletes(), ["free"]);
}
