use crate::k8s::ObjectMeta;
use anyhow::{Context, Result};
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use kube::{
    api::{Api, Patch, PatchParams},
    Resource,
};
use std::sync::Arc;
use tokio::{sync::watch, time};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "lynq-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Tracks whether this replica currently holds the write lease.
#[derive(Clone, Debug)]
pub(crate) struct Leadership {
    claims: watch::Receiver<Arc<kubert::lease::Claim>>,
    hostname: String,
}

pub(crate) async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<Leadership> {
    // The controller deployment owns the Lease so that uninstalling removes it.
    let api = Api::<Deployment>::namespaced(runtime.client(), ns);
    let deployment = api
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch deployment {ns}/{deployment_name}"))?;

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // A resource version of "0" only creates the Lease if it does not
            // already exist.
            resource_version: Some("0".to_string()),
            owner_references: deployment.controller_owner_ref(&()).map(|o| vec![o]),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/name".to_string(),
                        deployment_name.to_string(),
                    ),
                    (
                        "app.kubernetes.io/component".to_string(),
                        "controller".to_string(),
                    ),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            LEASE_NAME,
            &PatchParams {
                field_manager: Some("lynq-controller".to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(Leadership {
        claims,
        hostname: hostname.to_string(),
    })
}

// === impl Leadership ===

impl Leadership {
    pub(crate) fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.hostname)
    }
}
