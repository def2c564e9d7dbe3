use crate::cluster::{Cluster, ClusterError, ObjectRef};
use lynq_controller_core::readiness;
use serde_json::Value;
use tokio::time;

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("{target} not ready after {timeout:?}: {message}")]
    Timeout {
        target: String,
        timeout: time::Duration,
        message: String,
    },

    #[error("{0} no longer exists")]
    Gone(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Polls `target` every `interval` until it is ready, failing once `timeout`
/// elapses. Returns the ready object.
pub async fn wait_for_ready<C: Cluster + ?Sized>(
    cluster: &C,
    target: &ObjectRef,
    timeout: time::Duration,
    interval: time::Duration,
) -> Result<Value, WaitError> {
    let mut message = String::from("not observed yet");
    let polled = time::timeout(timeout, poll(cluster, target, interval, &mut message)).await;
    match polled {
        Ok(result) => result,
        Err(_) => Err(WaitError::Timeout {
            target: target.to_string(),
            timeout,
            message,
        }),
    }
}

async fn poll<C: Cluster + ?Sized>(
    cluster: &C,
    target: &ObjectRef,
    interval: time::Duration,
    message: &mut String,
) -> Result<Value, WaitError> {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let obj = cluster
            .get(target)
            .await?
            .ok_or_else(|| WaitError::Gone(target.to_string()))?;
        let obj = serde_json::to_value(&obj).map_err(ClusterError::from)?;
        if readiness::is_ready(&obj) {
            return Ok(obj);
        }
        *message = readiness::readiness_message(&obj);
        tracing::trace!(%target, %message, "Waiting for readiness");
    }
}
