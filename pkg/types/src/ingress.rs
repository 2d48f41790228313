use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use pkg_constants::annotations;

/// Backend service target for an Ingress path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressBackend {
    pub service_name: String,
    pub service_port: u16,
}

/// A single path rule within an Ingress HTTP rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    pub backend: IngressBackend,
}

/// HTTP rules for a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressHTTP {
    #[serde(default)]
    pub paths: Vec<IngressPath>,
}

/// A single host-based Ingress rule. The host is carried for completeness;
/// load balancer rules are keyed on path only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub http: IngressHTTP,
}

/// Ingress specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

impl IngressSpec {
    /// Every HTTP path across all host rules, in declaration order.
    pub fn http_paths(&self) -> impl Iterator<Item = &IngressPath> {
        self.rules.iter().flat_map(|r| r.http.paths.iter())
    }
}

/// Ingress resource as served by the registry API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingress {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub spec: IngressSpec,
    pub created_at: DateTime<Utc>,
}

impl Ingress {
    /// Stable identifier used to key the load balancer tree: `namespace/name`.
    pub fn ingress_id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(|v| v.as_str())
    }

    /// Value of the `kubernetes.io/ingress.class` annotation, if set.
    pub fn ingress_class(&self) -> Option<&str> {
        self.annotation(annotations::INGRESS_CLASS)
    }

    /// Whether this Ingress belongs to `class`. An empty class accepts everything.
    pub fn matches_class(&self, class: &str) -> bool {
        class.is_empty() || self.ingress_class() == Some(class)
    }
}
