use crate::retry::{self, RetryPolicy};
use kube::{
    api::{Api, Patch, PatchParams},
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};
use std::fmt::Debug;

/// Writes `status` to the status subresource of `name` as a merge patch
/// guarded by the object's resource version.
///
/// The first attempt uses `resource_version`; after a conflict the current
/// version is fetched and the write is retried per `policy`.
pub async fn patch_status<K, S>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    status: &S,
    field_manager: &str,
    policy: RetryPolicy,
) -> Result<K, kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    let status = serde_json::to_value(status).map_err(kube::Error::SerdeError)?;
    let params = PatchParams {
        field_manager: Some(field_manager.to_string()),
        ..Default::default()
    };
    let (status, params) = (&status, &params);

    policy
        .run(
            move |attempt| async move {
                let version = match attempt {
                    0 => resource_version.map(str::to_string),
                    _ => api.get_status(name).await?.meta().resource_version.clone(),
                };
                if attempt > 0 {
                    tracing::debug!(%name, attempt, "Status write conflicted; retrying");
                }
                let patch = status_patch(version.as_deref(), status);
                api.patch_status(name, params, &Patch::Merge(&patch)).await
            },
            retry::is_conflict,
        )
        .await
}

fn status_patch(resource_version: Option<&str>, status: &Value) -> Value {
    let mut metadata = Map::new();
    if let Some(version) = resource_version {
        metadata.insert("resourceVersion".to_string(), Value::from(version));
    }
    json!({ "metadata": metadata, "status": status })
}
