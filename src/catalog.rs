// tenantbackup/src/catalog.rs
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;

/// A structured record set (table) that belongs to the tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSetRef {
    pub name: String,
}

/// An object storage container (bucket) that belongs to the tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub name: String,
}

/// What a tenant backup contains. Built once from configuration and shared
/// read-only between jobs.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    record_sets: Vec<RecordSetRef>,
    containers: Vec<ContainerRef>,
}

impl SourceCatalog {
    /// Validates names and builds the catalog, preserving declaration order.
    pub fn new(record_sets: Vec<String>, containers: Vec<String>) -> Result<Self> {
        let identifier = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .context("Failed to compile record set name pattern")?;

        let mut seen = HashSet::new();
        for name in &record_sets {
            if !identifier.is_match(name) {
                anyhow::bail!("Invalid record set name in catalog: {:?}", name);
            }
            if !seen.insert(name.as_str()) {
                anyhow::bail!("Record set listed twice in catalog: {}", name);
            }
        }

        let mut seen = HashSet::new();
        for name in &containers {
            if name.trim().is_empty() || name.contains('/') {
                anyhow::bail!("Invalid container name in catalog: {:?}", name);
            }
            if !seen.insert(name.as_str()) {
                anyhow::bail!("Container listed twice in catalog: {}", name);
            }
        }

        Ok(SourceCatalog {
            record_sets: record_sets
                .into_iter()
                .map(|name| RecordSetRef { name })
                .collect(),
            containers: containers
                .into_iter()
                .map(|name| ContainerRef { name })
                .collect(),
        })
    }

    pub fn record_sets(&self) -> &[RecordSetRef] {
        &self.record_sets
    }

    pub fn containers(&self) -> &[ContainerRef] {
        &self.containers
    }
}

impl RecordSetRef {
    /// Archive path of this record set's export.
    pub fn archive_path(&self) -> String {
        format!("database/{}.json", self.name)
    }
}

impl ContainerRef {
    /// Archive path of a leaf object stored in this container.
    pub fn archive_path(&self, key: &str) -> String {
        format!("storage/{}/{}", self.name, key)
    }
}
