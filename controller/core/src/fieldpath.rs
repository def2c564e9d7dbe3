//! Field paths for `ignoreFields`.
//!
//! Supports the subset of JSONPath that is useful for pointing at fields of
//! a manifest: `$.spec.replicas`, `$.metadata.annotations['example.com/key']`,
//! `$.spec.template.spec.containers[0].image` and `[*]` wildcards. The leading
//! `$` is optional.

use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum PathError {
    #[error("field path selects nothing: {0:?}")]
    Empty(String),

    #[error("invalid field path {path:?} at offset {offset}")]
    Malformed { path: String, offset: usize },
}

// === impl FieldPath ===

impl FieldPath {
    pub fn parse_all<S: AsRef<str>>(paths: &[S]) -> Result<Vec<Self>, PathError> {
        paths.iter().map(|p| p.as_ref().parse()).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Every value the path selects in `root`.
    pub fn select<'v>(&self, root: &'v Value) -> Vec<&'v Value> {
        let mut found = Vec::new();
        select(root, &self.segments, &mut found);
        found
    }

    fn matches(&self, root: &Value) -> Vec<(Vec<Step>, Value)> {
        let mut found = Vec::new();
        matches(root, &self.segments, &mut Vec::new(), &mut found);
        found
    }

    fn remove(&self, root: &mut Value) {
        remove(root, &self.segments);
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = |offset: usize| PathError::Malformed {
            path: raw.to_string(),
            offset,
        };

        let bytes = raw.as_bytes();
        // `spec.replicas` is read as `$.spec.replicas`.
        let (mut pos, mut implicit_dot) = match bytes.first() {
            Some(b'$') => (1, false),
            Some(b'.') | Some(b'[') | None => (0, false),
            Some(_) => (0, true),
        };

        let mut segments = Vec::new();
        while pos < bytes.len() || implicit_dot {
            if implicit_dot || bytes[pos] == b'.' {
                if !implicit_dot {
                    pos += 1;
                }
                implicit_dot = false;
                let start = pos;
                while pos < bytes.len() && bytes[pos] != b'.' && bytes[pos] != b'[' {
                    pos += 1;
                }
                match &raw[start..pos] {
                    "" => return Err(malformed(start)),
                    "*" => segments.push(Segment::Wildcard),
                    key => segments.push(Segment::Key(key.to_string())),
                }
            } else if bytes[pos] == b'[' {
                let start = pos + 1;
                let close = raw[start..]
                    .find(']')
                    .map(|i| start + i)
                    .ok_or_else(|| malformed(pos))?;
                let inner = &raw[start..close];
                let segment = if inner == "*" {
                    Segment::Wildcard
                } else if let Some(quoted) = unquote(inner) {
                    Segment::Key(quoted.to_string())
                } else if let Ok(index) = inner.parse::<usize>() {
                    Segment::Index(index)
                } else {
                    return Err(malformed(start));
                };
                segments.push(segment);
                pos = close + 1;
            } else {
                return Err(malformed(pos));
            }
        }

        if segments.is_empty() {
            return Err(PathError::Empty(raw.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

fn unquote(s: &str) -> Option<&str> {
    let s = s
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Strips every selected field from `obj`.
pub fn remove_ignored_fields(obj: &mut Value, paths: &[FieldPath]) {
    for path in paths {
        path.remove(obj);
    }
}

/// Makes the ignored fields of `desired` match the live object.
///
/// Values present on `existing` are copied onto `desired`; fields absent
/// there are dropped from `desired`. Without a live object every ignored
/// field is dropped, so the field is left to whoever else manages it.
pub fn preserve_ignored_fields(desired: &mut Value, existing: Option<&Value>, paths: &[FieldPath]) {
    let Some(existing) = existing else {
        remove_ignored_fields(desired, paths);
        return;
    };

    for path in paths {
        let live = path.matches(existing);
        path.remove(desired);
        for (steps, value) in live {
            set(desired, &steps, value);
        }
    }
}

fn select<'v>(value: &'v Value, segments: &[Segment], found: &mut Vec<&'v Value>) {
    let Some((first, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };
    match (first, value) {
        (Segment::Key(key), Value::Object(map)) => {
            if let Some(v) = map.get(key) {
                select(v, rest, found);
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(v) = items.get(*i) {
                select(v, rest, found);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for v in map.values() {
                select(v, rest, found);
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for v in items {
                select(v, rest, found);
            }
        }
        _ => {}
    }
}

fn matches(
    value: &Value,
    segments: &[Segment],
    prefix: &mut Vec<Step>,
    found: &mut Vec<(Vec<Step>, Value)>,
) {
    let Some((first, rest)) = segments.split_first() else {
        found.push((prefix.clone(), value.clone()));
        return;
    };
    let mut descend = |step: Step, v: &Value, prefix: &mut Vec<Step>| {
        prefix.push(step);
        matches(v, rest, prefix, found);
        prefix.pop();
    };
    match (first, value) {
        (Segment::Key(key), Value::Object(map)) => {
            if let Some(v) = map.get(key) {
                descend(Step::Key(key.clone()), v, prefix);
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(v) = items.get(*i) {
                descend(Step::Index(*i), v, prefix);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for (k, v) in map {
                descend(Step::Key(k.clone()), v, prefix);
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for (i, v) in items.iter().enumerate() {
                descend(Step::Index(i), v, prefix);
            }
        }
        _ => {}
    }
}

fn remove(value: &mut Value, segments: &[Segment]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        match (first, value) {
            (Segment::Key(key), Value::Object(map)) => {
                map.remove(key);
            }
            (Segment::Index(i), Value::Array(items)) => {
                if *i < items.len() {
                    items.remove(*i);
                }
            }
            (Segment::Wildcard, Value::Object(map)) => map.clear(),
            (Segment::Wildcard, Value::Array(items)) => items.clear(),
            _ => {}
        }
        return;
    }

    match (first, value) {
        (Segment::Key(key), Value::Object(map)) => {
            if let Some(v) = map.get_mut(key) {
                remove(v, rest);
            }
        }
        (Segment::Index(i), Value::Array(items)) => {
            if let Some(v) = items.get_mut(*i) {
                remove(v, rest);
            }
        }
        (Segment::Wildcard, Value::Object(map)) => {
            for v in map.values_mut() {
                remove(v, rest);
            }
        }
        (Segment::Wildcard, Value::Array(items)) => {
            for v in items.iter_mut() {
                remove(v, rest);
            }
        }
        _ => {}
    }
}

/// Writes `new` at `steps`, creating intermediate objects. Array elements are
/// never created; a missing index leaves `value` untouched.
fn set(value: &mut Value, steps: &[Step], new: Value) {
    let Some((first, rest)) = steps.split_first() else {
        *value = new;
        return;
    };
    match first {
        Step::Key(key) => {
            if value.is_null() {
                *value = Value::Object(Map::new());
            }
            if let Value::Object(map) = value {
                let child = map.entry(key.clone()).or_insert(Value::Null);
                set(child, rest, new);
            }
        }
        Step::Index(i) => {
            if let Some(child) = value.as_array_mut().and_then(|items| items.get_mut(*i)) {
                set(child, rest, new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn paths(raw: &[&str]) -> Vec<FieldPath> {
        FieldPath::parse_all(raw).unwrap()
    }

    #[test]
    fn parses_supported_forms() {
        let p = "$.spec.template.spec.containers[0].image"
            .parse::<FieldPath>()
            .unwrap();
        assert_eq!(
            p.segments,
            vec![
                Segment::Key("spec".into()),
                Segment::Key("template".into()),
                Segment::Key("spec".into()),
                Segment::Key("containers".into()),
                Segment::Index(0),
                Segment::Key("image".into()),
            ]
        );

        let p = "$.metadata.annotations['example.com/owner']"
            .parse::<FieldPath>()
            .unwrap();
        assert_eq!(p.segments[2], Segment::Key("example.com/owner".into()));

        let p = "spec.containers[*].resources".parse::<FieldPath>().unwrap();
        assert_eq!(
            p.segments,
            vec![
                Segment::Key("spec".into()),
                Segment::Key("containers".into()),
                Segment::Wildcard,
                Segment::Key("resources".into()),
            ]
        );
        assert_eq!(p.to_string(), "spec.containers[*].resources");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(
            "$".parse::<FieldPath>(),
            Err(PathError::Empty("$".into()))
        );
        assert!(matches!(
            "$.spec..replicas".parse::<FieldPath>(),
            Err(PathError::Malformed { offset: 7, .. })
        ));
        assert!(matches!(
            "$.spec[abc]".parse::<FieldPath>(),
            Err(PathError::Malformed { .. })
        ));
        assert!(matches!(
            "$.spec[0".parse::<FieldPath>(),
            Err(PathError::Malformed { .. })
        ));
        assert!(matches!(
            "$spec".parse::<FieldPath>(),
            Err(PathError::Malformed { offset: 1, .. })
        ));
    }

    #[test]
    fn preserves_live_values() {
        let mut desired = json!({"spec": {"replicas": 1, "paused": false}});
        let live = json!({"spec": {"replicas": 5, "paused": false}});
        preserve_ignored_fields(&mut desired, Some(&live), &paths(&["$.spec.replicas"]));
        assert_eq!(desired, json!({"spec": {"replicas": 5, "paused": false}}));
    }

    #[test]
    fn drops_fields_missing_from_the_live_object() {
        let mut desired = json!({"spec": {"replicas": 1, "paused": false}});
        let live = json!({"spec": {"paused": true}});
        preserve_ignored_fields(&mut desired, Some(&live), &paths(&["$.spec.replicas"]));
        assert_eq!(desired, json!({"spec": {"paused": false}}));
    }

    #[test]
    fn adds_fields_only_present_on_the_live_object() {
        let mut desired = json!({"metadata": {"name": "web"}});
        let live = json!({"metadata": {"name": "web", "annotations": {"scaled-by": "hpa"}}});
        preserve_ignored_fields(
            &mut desired,
            Some(&live),
            &paths(&["$.metadata.annotations['scaled-by']"]),
        );
        assert_eq!(
            desired,
            json!({"metadata": {"name": "web", "annotations": {"scaled-by": "hpa"}}})
        );
    }

    #[test]
    fn omits_ignored_fields_on_create() {
        let mut desired = json!({"spec": {"replicas": 3, "selector": {}}});
        preserve_ignored_fields(&mut desired, None, &paths(&["$.spec.replicas"]));
        assert_eq!(desired, json!({"spec": {"selector": {}}}));
    }

    #[test]
    fn wildcards_copy_per_element() {
        let mut desired = json!({"containers": [
            {"name": "a", "resources": {"cpu": "1"}},
            {"name": "b", "resources": {"cpu": "1"}},
        ]});
        let live = json!({"containers": [
            {"name": "a", "resources": {"cpu": "2"}},
            {"name": "b"},
        ]});
        preserve_ignored_fields(
            &mut desired,
            Some(&live),
            &paths(&["$.containers[*].resources"]),
        );
        assert_eq!(
            desired,
            json!({"containers": [
                {"name": "a", "resources": {"cpu": "2"}},
                {"name": "b"},
            ]})
        );
    }

    #[test]
    fn selects_values() {
        let obj = json!({"items": [{"v": 1}, {"v": 2}], "other": {"v": 3}});
        let p = "$.items[*].v".parse::<FieldPath>().unwrap();
        assert_eq!(p.select(&obj), vec![&json!(1), &json!(2)]);
        let p = "$.items[1]".parse::<FieldPath>().unwrap();
        assert_eq!(p.select(&obj), vec![&json!({"v": 2})]);
        let p = "$.missing.v".parse::<FieldPath>().unwrap();
        assert!(p.select(&obj).is_empty());
    }

    #[test]
    fn removes_fields() {
        let mut obj = json!({"spec": {"replicas": 3, "template": {}}, "status": {"x": 1}});
        remove_ignored_fields(&mut obj, &paths(&["$.spec.replicas", "$.status"]));
        assert_eq!(obj, json!({"spec": {"template": {}}}));
    }
}
