//! Per-kind readiness predicates over live objects.
//!
//! Objects are inspected as JSON so the same predicates apply to anything the
//! controller writes, including kinds it has no typed model for.

use serde_json::Value;

/// Returns true when `obj` is ready according to its kind.
pub fn is_ready(obj: &Value) -> bool {
    match kind(obj) {
        "Deployment" => deployment_ready(obj),
        "StatefulSet" => stateful_set_ready(obj),
        "DaemonSet" => daemon_set_ready(obj),
        "Job" => job_ready(obj),
        "Service" => service_ready(obj),
        "Ingress" => ingress_ready(obj),
        "PersistentVolumeClaim" => phase(obj) == Some("Bound"),
        "Namespace" => phase(obj) == Some("Active"),
        "HorizontalPodAutoscaler" => condition(obj, "AbleToScale") == Some("True"),
        "ConfigMap" | "Secret" | "ServiceAccount" | "CronJob" | "PodDisruptionBudget"
        | "NetworkPolicy" => true,
        _ => generic_ready(obj),
    }
}

/// A short human-readable description of why `obj` is or is not ready.
pub fn readiness_message(obj: &Value) -> String {
    let kind = kind(obj);
    if is_ready(obj) {
        return format!("{kind} is ready");
    }

    match kind {
        "Deployment" | "StatefulSet" => format!(
            "{kind}: {}/{} replicas ready, {} updated",
            int(obj, "/status/readyReplicas").unwrap_or(0),
            int(obj, "/spec/replicas").unwrap_or(1),
            int(obj, "/status/updatedReplicas").unwrap_or(0),
        ),
        "DaemonSet" => format!(
            "DaemonSet: {}/{} pods ready",
            int(obj, "/status/numberReady").unwrap_or(0),
            int(obj, "/status/desiredNumberScheduled").unwrap_or(0),
        ),
        "Job" => {
            if condition(obj, "Failed") == Some("True") {
                "Job: failed".to_string()
            } else {
                format!(
                    "Job: {} active, {} succeeded",
                    int(obj, "/status/active").unwrap_or(0),
                    int(obj, "/status/succeeded").unwrap_or(0),
                )
            }
        }
        "Service" | "Ingress" => format!("{kind}: waiting for a load balancer address"),
        "PersistentVolumeClaim" | "Namespace" => {
            format!("{kind}: phase {}", phase(obj).unwrap_or("unknown"))
        }
        _ => format!("{kind} is not ready"),
    }
}

fn kind(obj: &Value) -> &str {
    obj.get("kind").and_then(Value::as_str).unwrap_or_default()
}

fn int(obj: &Value, pointer: &str) -> Option<i64> {
    obj.pointer(pointer).and_then(Value::as_i64)
}

fn phase(obj: &Value) -> Option<&str> {
    obj.pointer("/status/phase").and_then(Value::as_str)
}

fn conditions(obj: &Value) -> Option<&Vec<Value>> {
    obj.pointer("/status/conditions").and_then(Value::as_array)
}

fn condition<'o>(obj: &'o Value, type_: &str) -> Option<&'o str> {
    conditions(obj)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
}

fn observed_current_generation(obj: &Value) -> bool {
    match int(obj, "/metadata/generation") {
        Some(generation) => int(obj, "/status/observedGeneration") == Some(generation),
        None => true,
    }
}

fn deployment_ready(obj: &Value) -> bool {
    if !observed_current_generation(obj) {
        return false;
    }
    let replicas = int(obj, "/spec/replicas").unwrap_or(1);
    if replicas == 0 {
        return false;
    }
    ["updatedReplicas", "readyReplicas", "availableReplicas"]
        .iter()
        .all(|field| int(obj, &format!("/status/{field}")) == Some(replicas))
}

fn stateful_set_ready(obj: &Value) -> bool {
    if !observed_current_generation(obj) {
        return false;
    }
    let replicas = int(obj, "/spec/replicas").unwrap_or(1);
    if replicas == 0 {
        return false;
    }
    ["updatedReplicas", "readyReplicas", "currentReplicas"]
        .iter()
        .all(|field| int(obj, &format!("/status/{field}")).unwrap_or(0) == replicas)
}

fn daemon_set_ready(obj: &Value) -> bool {
    let desired = int(obj, "/status/desiredNumberScheduled").unwrap_or(0);
    desired > 0
        && ["numberReady", "updatedNumberScheduled", "numberAvailable"]
            .iter()
            .all(|field| int(obj, &format!("/status/{field}")) == Some(desired))
}

fn job_ready(obj: &Value) -> bool {
    if condition(obj, "Complete") == Some("True") {
        return true;
    }
    if condition(obj, "Failed") == Some("True") {
        return false;
    }
    int(obj, "/status/succeeded").unwrap_or(0) > 0
}

fn has_lb_ingress(obj: &Value) -> bool {
    obj.pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .is_some_and(|ingress| !ingress.is_empty())
}

fn service_ready(obj: &Value) -> bool {
    match obj.pointer("/spec/type").and_then(Value::as_str) {
        Some("LoadBalancer") => has_lb_ingress(obj),
        _ => true,
    }
}

fn ingress_ready(obj: &Value) -> bool {
    has_lb_ingress(obj)
        || obj
            .pointer("/spec/rules")
            .and_then(Value::as_array)
            .is_some_and(|rules| !rules.is_empty())
}

fn generic_ready(obj: &Value) -> bool {
    match conditions(obj) {
        None => true,
        Some(conditions) if conditions.is_empty() => true,
        Some(_) => condition(obj, "Ready") == Some("True"),
    }
}
