use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A resource written on behalf of a node, recorded in the node's status so
/// that resources dropped from the template can be found again.
///
/// Encoded as `Kind/Namespace/Name@id`. Cluster-scoped resources have an
/// empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppliedResource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecordError {
    #[error("expected Kind/Namespace/Name@id: {0:?}")]
    Malformed(String),

    #[error("empty {field} in {record:?}")]
    Empty { field: &'static str, record: String },
}

impl AppliedResource {
    pub fn new(
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }

    /// True when both records point at the same cluster object, regardless of
    /// the id that declared it.
    pub fn same_object(&self, other: &Self) -> bool {
        self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for AppliedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.kind, self.namespace, self.name, self.id
        )
    }
}

impl FromStr for AppliedResource {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RecordError::Malformed(s.to_string());

        // Kinds and object names never contain '/' or '@', so the first
        // separators are unambiguous and the id may contain anything.
        let (kind, rest) = s.split_once('/').ok_or_else(malformed)?;
        let (namespace, rest) = rest.split_once('/').ok_or_else(malformed)?;
        let (name, id) = rest.split_once('@').ok_or_else(malformed)?;

        for (field, value) in [("kind", kind), ("name", name), ("id", id)] {
            if value.is_empty() {
                return Err(RecordError::Empty {
                    field,
                    record: s.to_string(),
                });
            }
        }

        Ok(Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            id: id.to_string(),
        })
    }
}

impl Serialize for AppliedResource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AppliedResource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_encodes() {
        let record = "ConfigMap/ns/name@id".parse::<AppliedResource>().unwrap();
        assert_eq!(
            record,
            AppliedResource {
                kind: "ConfigMap".into(),
                namespace: "ns".into(),
                name: "name".into(),
                id: "id".into(),
            }
        );
        assert_eq!(record.to_string(), "ConfigMap/ns/name@id");
    }

    #[test]
    fn cluster_scoped_records_have_no_namespace() {
        let record = AppliedResource::new("Namespace", None, "tenant-a", "tenant-ns");
        assert_eq!(record.to_string(), "Namespace//tenant-a@tenant-ns");
        let parsed = record.to_string().parse::<AppliedResource>().unwrap();
        assert_eq!(parsed.namespace(), None);
        assert_eq!(parsed, record);
    }

    #[test]
    fn ids_may_contain_separators() {
        let record = "Secret/ns/creds@db/primary@v2"
            .parse::<AppliedResource>()
            .unwrap();
        assert_eq!(record.name, "creds");
        assert_eq!(record.id, "db/primary@v2");
        assert_eq!(record.to_string(), "Secret/ns/creds@db/primary@v2");
    }

    #[test]
    fn rejects_malformed_records() {
        for bad in ["", "ConfigMap", "ConfigMap/ns", "ConfigMap/ns/name"] {
            assert_eq!(
                bad.parse::<AppliedResource>(),
                Err(RecordError::Malformed(bad.to_string())),
                "{bad:?}"
            );
        }
        assert!(matches!(
            "/ns/name@id".parse::<AppliedResource>(),
            Err(RecordError::Empty { field: "kind", .. })
        ));
        assert!(matches!(
            "ConfigMap/ns/name@".parse::<AppliedResource>(),
            Err(RecordError::Empty { field: "id", .. })
        ));
    }

    #[test]
    fn serializes_as_string() {
        let records = vec![
            AppliedResource::new("Deployment", Some("ns"), "web", "app"),
            AppliedResource::new("Service", Some("ns"), "web", "svc"),
        ];
        let json = serde_json::to_value(&records).unwrap();
        assert_eq!(
            json,
            serde_json::json!(["Deployment/ns/web@app", "Service/ns/web@svc"])
        );
        let back: Vec<AppliedResource> = serde_json::from_value(json).unwrap();
        assert_eq!(back, records);
    }
}
