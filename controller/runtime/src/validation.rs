//! Checks a form must pass before it is admitted or rolled out.

use crate::{
    core::{Engine, FieldPath, GraphError, RenderError},
    k8s::{LynqFormSpec, RolloutConfig, TResource},
};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const RESOURCE_ID_REGEX: &str = r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$";
const MAX_RESOURCE_ID_LEN: usize = 63;

static RESOURCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(RESOURCE_ID_REGEX).expect("resource id regex must compile"));

#[derive(Debug, Error, PartialEq, Clone)]
pub enum FormError {
    #[error("spec.hubId must not be empty")]
    MissingHubId,

    #[error(
        "resource id {id:?} must be at most {max} characters and match the regex: {regex}",
        max = MAX_RESOURCE_ID_LEN,
        regex = RESOURCE_ID_REGEX
    )]
    InvalidId { id: String },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("resource {id:?} has no apiVersion and kind")]
    MissingKind { id: String },

    #[error("resource {id:?}: {error}")]
    Template { id: String, error: RenderError },

    #[error("resource {id:?} ignoreFields: {error}")]
    IgnoreFields { id: String, error: String },

    #[error("resource {id:?} timeoutSeconds must be between 1 and {max}, got {seconds}")]
    Timeout { id: String, seconds: u32, max: u32 },

    #[error("rollout.progressDeadlineSeconds must be between {min} and {max}, got {seconds}")]
    ProgressDeadline { seconds: u32, min: u32, max: u32 },
}

fn is_valid_id(id: &str) -> bool {
    id.len() <= MAX_RESOURCE_ID_LEN && RESOURCE_ID.is_match(id)
}

/// Validates a form, returning the first problem found.
pub(crate) fn validate_form(spec: &LynqFormSpec, engine: &Engine) -> Result<(), FormError> {
    if spec.hub_id.trim().is_empty() {
        return Err(FormError::MissingHubId);
    }

    if let Some(rollout) = &spec.rollout {
        let seconds = rollout.progress_deadline_seconds;
        let (min, max) = (
            RolloutConfig::MIN_PROGRESS_DEADLINE_SECONDS,
            RolloutConfig::MAX_PROGRESS_DEADLINE_SECONDS,
        );
        if !(min..=max).contains(&seconds) {
            return Err(FormError::ProgressDeadline { seconds, min, max });
        }
    }

    for declared in spec.resources.iter() {
        let resource = declared.resource;
        // Empty and duplicate ids are reported by the graph.
        if !resource.id.is_empty() && !is_valid_id(&resource.id) {
            return Err(FormError::InvalidId {
                id: resource.id.clone(),
            });
        }
    }

    spec.resources.graph()?.validate()?;

    for declared in spec.resources.iter() {
        let resource = declared.resource;
        if declared.api_version().is_none() || declared.kind().is_none() {
            return Err(FormError::MissingKind {
                id: resource.id.clone(),
            });
        }
        validate_resource(resource, engine)?;
    }

    Ok(())
}

fn validate_resource(resource: &TResource, engine: &Engine) -> Result<(), FormError> {
    let id = &resource.id;
    let template = |error| FormError::Template {
        id: id.clone(),
        error,
    };

    engine.check(&resource.name_template).map_err(template)?;
    if let Some(ns) = resource.namespace_template() {
        engine.check(ns).map_err(template)?;
    }
    for value in resource
        .labels_template
        .values()
        .chain(resource.annotations_template.values())
    {
        engine.check(value).map_err(template)?;
    }
    engine.check_value(&resource.spec).map_err(template)?;

    FieldPath::parse_all(&resource.ignore_fields).map_err(|error| FormError::IgnoreFields {
        id: id.clone(),
        error: error.to_string(),
    })?;

    let max = TResource::MAX_TIMEOUT_SECONDS;
    if resource.timeout_seconds == 0 || resource.timeout_seconds > max {
        return Err(FormError::Timeout {
            id: id.clone(),
            seconds: resource.timeout_seconds,
            max,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn form(value: serde_json::Value) -> LynqFormSpec {
        serde_json::from_value(value).expect("form must parse")
    }

    fn validate(value: serde_json::Value) -> Result<(), FormError> {
        validate_form(&form(value), &Engine::new())
    }

    #[test]
    fn accepts_a_valid_form() {
        let res = validate(json!({
            "hubId": "customers",
            "rollout": {"maxSkew": 2, "progressDeadlineSeconds": 120},
            "configMaps": [{
                "id": "settings",
                "nameTemplate": "{{ uid }}-settings",
                "labelsTemplate": {"tier": "{{ hubId }}"},
                "spec": {"data": {"host": "{{ uid | to_host }}"}},
            }],
            "deployments": [{
                "id": "app",
                "nameTemplate": "{{ uid | trunc63 }}",
                "dependIds": ["settings"],
                "ignoreFields": ["$.spec.replicas"],
                "spec": {"spec": {"replicas": "{{ 2 | int }}"}},
            }],
        }));
        assert_eq!(res, Ok(()));
    }

    #[test]
    fn rejects_an_empty_hub_id() {
        assert_eq!(validate(json!({"hubId": " "})), Err(FormError::MissingHubId));
    }

    #[test]
    fn rejects_malformed_ids() {
        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{"id": "-bad", "nameTemplate": "x"}],
        }));
        assert_eq!(
            res,
            Err(FormError::InvalidId {
                id: "-bad".to_string()
            })
        );

        let long = "a".repeat(64);
        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{"id": long, "nameTemplate": "x"}],
        }));
        assert_eq!(res, Err(FormError::InvalidId { id: "a".repeat(64) }));
    }

    #[test]
    fn resource_ids() {
        let longest = "x".repeat(63);
        let too_long = "x".repeat(64);
        for id in ["a", "db", "app.v2", "tenant_db-1", longest.as_str()] {
            assert!(is_valid_id(id), "{id}");
        }
        for id in ["-a", "a-", "a b", "a/b", too_long.as_str()] {
            assert!(!is_valid_id(id), "{id}");
        }
    }

    #[test]
    fn rejects_invalid_graphs() {
        let res = validate(json!({
            "hubId": "h",
            "configMaps": [
                {"id": "a", "nameTemplate": "a", "dependIds": ["b"]},
                {"id": "b", "nameTemplate": "b", "dependIds": ["a"]},
            ],
        }));
        assert!(matches!(res, Err(FormError::Graph(ref e)) if e.is_cycle()), "{res:?}");

        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{"id": "a", "nameTemplate": "a", "dependIds": ["missing"]}],
        }));
        assert!(
            matches!(res, Err(FormError::Graph(GraphError::MissingDependency { .. }))),
            "{res:?}"
        );

        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{"id": "a", "nameTemplate": "a"}],
            "secrets": [{"id": "a", "nameTemplate": "b"}],
        }));
        assert_eq!(
            res,
            Err(FormError::Graph(GraphError::DuplicateId("a".to_string())))
        );
    }

    #[test]
    fn rejects_broken_templates() {
        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{"id": "a", "nameTemplate": "{{ uid "}],
        }));
        assert!(matches!(res, Err(FormError::Template { ref id, .. }) if id == "a"), "{res:?}");

        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{
                "id": "a",
                "nameTemplate": "a",
                "spec": {"data": {"k": "{% if %}"}},
            }],
        }));
        assert!(matches!(res, Err(FormError::Template { .. })), "{res:?}");
    }

    #[test]
    fn rejects_manifests_without_a_kind() {
        let res = validate(json!({
            "hubId": "h",
            "manifests": [{"id": "raw", "nameTemplate": "raw", "spec": {"data": {}}}],
        }));
        assert_eq!(
            res,
            Err(FormError::MissingKind {
                id: "raw".to_string()
            })
        );
    }

    #[test]
    fn rejects_bad_ignore_fields() {
        let res = validate(json!({
            "hubId": "h",
            "deployments": [{"id": "app", "nameTemplate": "app", "ignoreFields": ["$.spec["]}],
        }));
        assert!(matches!(res, Err(FormError::IgnoreFields { .. })), "{res:?}");
    }

    #[test]
    fn enforces_bounds() {
        let res = validate(json!({
            "hubId": "h",
            "configMaps": [{"id": "a", "nameTemplate": "a", "timeoutSeconds": 0}],
        }));
        assert_eq!(
            res,
            Err(FormError::Timeout {
                id: "a".to_string(),
                seconds: 0,
                max: 3600
            })
        );

        let res = validate(json!({"hubId": "h", "rollout": {"progressDeadlineSeconds": 30}}));
        assert_eq!(
            res,
            Err(FormError::ProgressDeadline {
                seconds: 30,
                min: 60,
                max: 3600
            })
        );
    }
}
