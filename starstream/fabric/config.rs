use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::{
    model::ResourceModel,
    resource::{Domain, EndpointId, ResourceSpec},
    telemetry::FabricTelemetry,
};

/// Topology declared in TOML.
///
/// ```toml
/// endpoints = ["gpu-a", "gpu-b"]
///
/// [[resources]]
/// id = "oc-1"
/// domain = "optical"
/// a = "tor-1"
/// b = "tor-2"
/// capacity_gbps = 400.0
/// latency_ms = 0.05
/// tags = { tenant = "blue" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyDocument {
    /// Endpoints with no resources yet.
    #[serde(default)]
    pub endpoints: Vec<EndpointId>,
    /// Resource declarations.
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

/// One resource declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    /// Identifier.
    pub id: String,
    /// Domain.
    pub domain: Domain,
    /// First endpoint.
    pub a: String,
    /// Second endpoint.
    pub b: String,
    /// Total capacity in Gbps.
    pub capacity_gbps: f64,
    /// Nominal latency.
    #[serde(default)]
    pub latency_ms: f64,
    /// Tags.
    #[serde(default)]
    pub tags: IndexMap<String, String>,
}

impl TopologyDocument {
    /// Loads a topology from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading topology {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates a topology document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let document: Self = toml::from_str(raw)?;
        let mut seen = std::collections::HashSet::new();
        for entry in &document.resources {
            if !seen.insert(entry.id.as_str()) {
                bail!("duplicate resource id `{}`", entry.id);
            }
        }
        Ok(document)
    }

    /// Resource specs in declaration order.
    #[must_use]
    pub fn specs(&self) -> Vec<ResourceSpec> {
        self.resources
            .iter()
            .map(|entry| {
                let mut spec = ResourceSpec::new(
                    entry.id.as_str(),
                    entry.domain,
                    entry.a.as_str(),
                    entry.b.as_str(),
                    entry.capacity_gbps,
                    entry.latency_ms,
                );
                spec.tags = entry.tags.clone();
                spec
            })
            .collect()
    }

    /// Builds a populated resource model.
    pub fn into_model(self, telemetry: Option<FabricTelemetry>) -> Result<ResourceModel> {
        let mut model = ResourceModel::new();
        if let Some(tel) = telemetry {
            model = model.with_telemetry(tel);
        }
        for spec in self.specs() {
            let id = spec.id.clone();
            model
                .register(spec)
                .with_context(|| format!("registering resource `{id}`"))?;
        }
        for endpoint in self.endpoints {
            model.add_endpoint(endpoint);
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
endpoints = ["spare"]

[[resources]]
id = "oc-1"
domain = "optical"
a = "tor-1"
b = "tor-2"
capacity_gbps = 400.0
latency_ms = 0.05
tags = { tenant = "blue" }

[[resources]]
id = "el-1"
domain = "electronic"
a = "tor-2"
b = "gpu-a"
capacity_gbps = 100.0
"#;

    #[test]
    fn loads_topology_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("topology.toml");
        fs::write(&path, SAMPLE).unwrap();
        let model = TopologyDocument::load(&path).unwrap().into_model(None).unwrap();
        assert_eq!(model.len(), 2);
        let optical = model.get(&"oc-1".into()).unwrap();
        assert_eq!(optical.tag("tenant"), Some("blue"));
        assert!(model.view().has_endpoint(&"spare".into()));
    }

    #[test]
    fn rejects_duplicates_and_bad_capacity() {
        let dup = format!("{SAMPLE}\n[[resources]]\nid = \"oc-1\"\ndomain = \"optical\"\na = \"x\"\nb = \"y\"\ncapacity_gbps = 1.0\n");
        assert!(TopologyDocument::from_toml_str(&dup).is_err());
        let bad = "[[resources]]\nid = \"z\"\ndomain = \"compute\"\na = \"x\"\nb = \"y\"\ncapacity_gbps = 0.0\n";
        let doc = TopologyDocument::from_toml_str(bad).unwrap();
        assert!(doc.into_model(None).is_err());
    }
}
